use dppm_core::{AlternativeApproach, MiniPlan, PlanStep};
use dppm_prompts::markers;

enum Section {
    None,
    Step,
    Risks,
    Alternative,
}

/// Parse a planning response into a mini-plan for `subtask_id`.
///
/// Expects one or more step blocks, then optional tools, risks and an
/// alternative approach:
/// ```markdown
/// #### STEP: <action>
/// **Expected:** <outcome>
/// **Capability:** <tag>
/// ---
/// #### TOOLS: web, files
/// #### RISK: <risk>
/// <another risk>
/// #### ALTERNATIVE: <description>
/// - <fallback action>
/// ```
///
/// A response with no steps is an error.
pub fn parse_mini_plan(subtask_id: &str, content: &str) -> Result<MiniPlan, String> {
    let mut steps: Vec<PlanStep> = Vec::new();
    let mut tools: Vec<String> = Vec::new();
    let mut risks: Vec<String> = Vec::new();
    let mut alternative: Option<AlternativeApproach> = None;
    let mut section = Section::None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(action) = trimmed.strip_prefix(markers::STEP) {
            let action = action.trim();
            if action.is_empty() {
                section = Section::None;
                continue;
            }
            steps.push(PlanStep::new(action, String::new()));
            section = Section::Step;
            continue;
        }

        if let Some(list) = trimmed.strip_prefix(markers::TOOLS) {
            for tool in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if !tools.iter().any(|t| t == tool) {
                    tools.push(tool.to_string());
                }
            }
            section = Section::None;
            continue;
        }

        if let Some(risk) = trimmed.strip_prefix(markers::RISK) {
            push_nonempty(&mut risks, risk);
            section = Section::Risks;
            continue;
        }

        if let Some(desc) = trimmed.strip_prefix(markers::ALTERNATIVE) {
            alternative = Some(AlternativeApproach {
                description: desc.trim().to_string(),
                steps: Vec::new(),
            });
            section = Section::Alternative;
            continue;
        }

        if trimmed == markers::SEPARATOR {
            section = Section::None;
            continue;
        }

        match section {
            Section::Step => {
                let Some(step) = steps.last_mut() else {
                    continue;
                };
                if let Some(v) = field(trimmed, "Expected") {
                    step.expected_outcome = v.to_string();
                } else if let Some(v) = field(trimmed, "Capability") {
                    if !v.is_empty() {
                        step.capability = v.to_lowercase();
                    }
                }
            }
            Section::Risks => push_nonempty(&mut risks, bullet(trimmed)),
            Section::Alternative => {
                if let Some(alt) = alternative.as_mut() {
                    let action = bullet(trimmed);
                    if !action.is_empty() {
                        let expected = alt.description.clone();
                        alt.steps.push(PlanStep::new(action, expected));
                    }
                }
            }
            Section::None => {}
        }
    }

    if steps.is_empty() {
        return Err("response contained no steps".into());
    }

    for step in &mut steps {
        if step.expected_outcome.is_empty() {
            step.expected_outcome = format!("{} done", step.action);
        }
    }

    // An alternative without steps becomes a single step of its description.
    if let Some(alt) = alternative.as_mut() {
        if alt.steps.is_empty() && !alt.description.is_empty() {
            alt.steps
                .push(PlanStep::new(alt.description.clone(), alt.description.clone()));
        }
    }
    let alternative = alternative.filter(|a| !a.steps.is_empty());

    Ok(MiniPlan {
        subtask_id: subtask_id.to_string(),
        steps,
        tools,
        risks,
        alternative,
        placeholder: false,
        provider: None,
    })
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let tight = format!("**{name}:**");
    let loose = format!("**{name}: **");
    line.strip_prefix(tight.as_str())
        .or_else(|| line.strip_prefix(loose.as_str()))
        .map(str::trim)
}

/// Strip a leading list marker: `- `, `* ` or `1. `.
fn bullet(line: &str) -> &str {
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line);
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return rest.trim();
        }
    }
    line.trim()
}

fn push_nonempty(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        list.push(value.to_string());
    }
}
