use dppm_core::{Domain, MergedPlan};

use crate::context::PromptContext;
use crate::headers;
use crate::markers;

/// Persona the pre-flight critic adopts when reviewing a plan.
pub trait CritiqueStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Opening paragraph that sets the reviewer's stance.
    fn persona(&self) -> String;

    /// Specific failure modes the critic should look for.
    fn concerns(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Default critic: assumes every step can fail and looks for how.
#[derive(Debug, Clone, Default)]
pub struct DevilsAdvocate;

impl CritiqueStrategy for DevilsAdvocate {
    fn name(&self) -> &str {
        "devils-advocate"
    }

    fn persona(&self) -> String {
        "You are a skeptical reviewer. Assume each step will go wrong and find \
         the most likely and most damaging ways it can."
            .into()
    }

    fn concerns(&self) -> Vec<String> {
        vec![
            "external services being slow, rate limited or unavailable".into(),
            "steps whose expected outcome cannot be checked".into(),
            "dependencies that hand over incomplete output".into(),
        ]
    }
}

/// Critic tuned to a single domain's usual failure modes.
#[derive(Debug, Clone)]
pub struct DomainCritic {
    pub domain: Domain,
    pub concerns: Vec<String>,
}

impl DomainCritic {
    pub fn new(domain: Domain, concerns: Vec<String>) -> Self {
        Self { domain, concerns }
    }

    /// Built-in concern list for each domain.
    pub fn for_domain(domain: Domain) -> Self {
        let concerns: &[&str] = match domain {
            Domain::Research => &[
                "stale or unverifiable sources",
                "search results that do not answer the question",
            ],
            Domain::Writing => &[
                "tone that does not fit the audience",
                "length limits of the target medium",
            ],
            Domain::Code => &[
                "build or test failures",
                "changes that break existing behaviour",
            ],
            Domain::Data => &["malformed or missing input data", "silent unit mismatches"],
            Domain::Communication => &[
                "posting to the wrong account or channel",
                "platform rate limits and content policies",
            ],
            Domain::General => &["unclear completion criteria"],
        };
        Self::new(domain, concerns.iter().map(|c| c.to_string()).collect())
    }
}

impl CritiqueStrategy for DomainCritic {
    fn name(&self) -> &str {
        self.domain.as_str()
    }

    fn persona(&self) -> String {
        format!(
            "You are a senior {} specialist reviewing a plan before it runs. \
             Focus on what typically breaks in {} work.",
            self.domain, self.domain
        )
    }

    fn concerns(&self) -> Vec<String> {
        self.concerns.clone()
    }
}

/// Assemble the pre-flight critique prompt for a merged plan.
pub fn build(ctx: &PromptContext, plan: &MergedPlan, critic: &dyn CritiqueStrategy) -> String {
    let mut prompt = String::new();
    ctx.append_preamble(&mut prompt);
    append_plan(&mut prompt, plan);

    prompt.push_str(headers::CRITIQUE);
    prompt.push_str("\n\n");
    prompt.push_str(&critic.persona());
    prompt.push_str("\n\n");

    let concerns = critic.concerns();
    if !concerns.is_empty() {
        prompt.push_str("Pay particular attention to:\n");
        for c in &concerns {
            prompt.push_str(&format!("- {c}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "List between 3 and 7 risks, most severe first. Likelihood and impact are \
         numbers between 0 and 1. Use the subtask id the risk applies to, or `plan` \
         if it concerns the whole plan. Strategy `step` adds a defensive step; \
         `fallback` adds a fallback path.\n\n",
    );
    prompt.push_str(&format!(
        "{} <risk description>\n\
         **Subtask:** <id | plan>\n\
         **Likelihood:** <0..1>\n\
         **Impact:** <0..1>\n\
         **Mitigation:** <action that reduces the risk>\n\
         **Strategy:** <step | fallback>\n\
         {}\n",
        markers::RISK,
        markers::SEPARATOR
    ));
    prompt
}

fn append_plan(prompt: &mut String, plan: &MergedPlan) {
    prompt.push_str("## Plan\n\n");
    for phase in &plan.phases {
        prompt.push_str(&format!("### Phase {}\n\n", phase.index + 1));
        for id in &phase.subtask_ids {
            let Some(subtask) = plan.subtask(id) else {
                continue;
            };
            prompt.push_str(&format!("- **{}** ({}): {}\n", subtask.id, subtask.domain, subtask.title));
            if let Some(mini) = plan.mini_plan(id) {
                for (i, step) in mini.steps.iter().enumerate() {
                    prompt.push_str(&format!(
                        "  {}. {} [{}] -> {}\n",
                        i + 1,
                        step.action,
                        step.capability,
                        step.expected_outcome
                    ));
                }
                if mini.alternative.is_some() {
                    prompt.push_str("  (has alternative approach)\n");
                }
            }
        }
        prompt.push('\n');
    }
    if !plan.tools.is_empty() {
        prompt.push_str(&format!("Tools: {}\n\n", plan.tools.join(", ")));
    }
}
