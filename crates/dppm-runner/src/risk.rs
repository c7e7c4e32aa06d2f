use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dppm_core::{
    AlternativeApproach, AppliedMitigation, Domain, DppmConfig, DppmError, MergedPlan, MiniPlan,
    Mitigation, MitigationStrategy, PlanStep, PreFlightReport, Risk, Subtask,
};
use dppm_prompts::{critique, markers, CritiqueStrategy, DevilsAdvocate, DomainCritic, PromptContext};

use crate::merger;
use crate::router::{self, ModelRouter, RouterError};

const MAX_RISKS: usize = 7;
const MIN_RISKS: usize = 3;

/// Pre-flight critic. Reviews a merged plan and writes the high-scoring
/// mitigations back into it.
pub struct RiskReflector {
    router: Arc<ModelRouter>,
    critics: HashMap<Domain, Arc<dyn CritiqueStrategy>>,
    fallback: Arc<dyn CritiqueStrategy>,
}

impl RiskReflector {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self {
            router,
            critics: HashMap::new(),
            fallback: Arc::new(DevilsAdvocate),
        }
    }

    /// Register the built-in critic for every specific domain.
    pub fn with_default_critics(mut self) -> Self {
        for domain in Domain::ALL.iter().filter(|d| **d != Domain::General) {
            self.critics
                .insert(*domain, Arc::new(DomainCritic::for_domain(*domain)));
        }
        self
    }

    pub fn with_critic(mut self, domain: Domain, critic: Arc<dyn CritiqueStrategy>) -> Self {
        self.critics.insert(domain, critic);
        self
    }

    /// Critic for the domain most subtasks belong to.
    pub fn critic_for(&self, plan: &MergedPlan) -> Arc<dyn CritiqueStrategy> {
        dominant_domain(&plan.subtasks)
            .and_then(|d| self.critics.get(&d).cloned())
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Critique `plan` and materialize mitigations scoring at or above the
    /// configured threshold. On error the plan is left untouched.
    pub async fn review(
        &self,
        ctx: &PromptContext,
        plan: &mut MergedPlan,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<PreFlightReport, DppmError> {
        let critic = self.critic_for(plan);
        let prompt = critique::build(ctx, plan, critic.as_ref());

        let resp = match self
            .router
            .invoke(router::CRITIQUE, &prompt, config.model_timeout(), cancel)
            .await
        {
            Ok(resp) => resp,
            Err(RouterError::Cancelled) => return Err(DppmError::Cancelled),
            Err(e) => return Err(DppmError::Reflection(e.to_string())),
        };

        let mut ranked = parse_risks(&resp.text);
        if ranked.is_empty() {
            return Err(DppmError::Reflection("critic returned no risks".into()));
        }
        if ranked.len() < MIN_RISKS {
            warn!(count = ranked.len(), "critic returned fewer risks than asked for");
        }
        ranked.sort_by(|a, b| b.0.score().total_cmp(&a.0.score()));
        ranked.truncate(MAX_RISKS);

        let mut risks = Vec::with_capacity(ranked.len());
        let mut mitigations = Vec::with_capacity(ranked.len());
        for (i, (mut risk, mut mitigation)) in ranked.into_iter().enumerate() {
            risk.id = format!("risk-{}", i + 1);
            mitigation.risk_id = risk.id.clone();
            if risk.score() >= config.risk_threshold {
                mitigation.applied = Some(apply(plan, &risk, &mitigation));
            }
            risks.push(risk);
            mitigations.push(mitigation);
        }

        if mitigations.iter().any(|m| {
            matches!(m.applied, Some(AppliedMitigation::FallbackSubtask { .. }))
        }) {
            if let Err(e) = merger::refresh(plan) {
                warn!("could not refresh plan after mitigation: {e}");
            }
        }

        let report = PreFlightReport {
            critic: critic.name().to_string(),
            risks,
            mitigations,
        };
        info!(
            critic = %report.critic,
            risks = report.risks.len(),
            applied = report.applied_count(),
            "pre-flight review done"
        );
        Ok(report)
    }
}

/// Most common domain among non-optional subtasks; first seen wins ties.
fn dominant_domain(subtasks: &[Subtask]) -> Option<Domain> {
    let mut counts: Vec<(Domain, usize)> = Vec::new();
    for s in subtasks.iter().filter(|s| !s.optional) {
        match counts.iter_mut().find(|(d, _)| *d == s.domain) {
            Some((_, n)) => *n += 1,
            None => counts.push((s.domain, 1)),
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(Domain, usize)>, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })
        .map(|(d, _)| d)
}

fn apply(plan: &mut MergedPlan, risk: &Risk, mitigation: &Mitigation) -> AppliedMitigation {
    let target = risk
        .subtask_id
        .as_deref()
        .filter(|id| plan.subtask(id).is_some())
        .map(str::to_string);

    let Some(subtask_id) = target else {
        return add_mitigation_subtask(plan, risk, mitigation);
    };
    let Some(mini) = plan.mini_plan_mut(&subtask_id) else {
        return add_mitigation_subtask(plan, risk, mitigation);
    };

    let defensive = PlanStep::new(
        mitigation.action.clone(),
        format!("{} mitigated", risk.id),
    )
    .defensive();

    if mitigation.strategy == MitigationStrategy::Fallback && mini.alternative.is_none() {
        mini.alternative = Some(AlternativeApproach {
            description: mitigation.action.clone(),
            steps: vec![PlanStep::new(
                mitigation.action.clone(),
                mini.expected_outcome().unwrap_or("subtask done").to_string(),
            )],
        });
        debug!(subtask = %subtask_id, risk = %risk.id, "alternative added");
        return AppliedMitigation::Alternative { subtask_id };
    }

    mini.steps.insert(0, defensive);
    debug!(subtask = %subtask_id, risk = %risk.id, "defensive step added");
    AppliedMitigation::DefensiveStep { subtask_id }
}

/// Plan-wide mitigations become an optional, dependency-free subtask in
/// the first phase.
fn add_mitigation_subtask(
    plan: &mut MergedPlan,
    risk: &Risk,
    mitigation: &Mitigation,
) -> AppliedMitigation {
    let mut n = 1;
    while plan.subtask(&format!("mitigation-{n}")).is_some() {
        n += 1;
    }
    let id = format!("mitigation-{n}");

    plan.subtasks.push(Subtask {
        id: id.clone(),
        title: mitigation.action.clone(),
        description: format!("{} (guards against: {})", mitigation.action, risk.description),
        domain: Domain::infer(&mitigation.action),
        depends_on: Vec::new(),
        complexity: 1,
        optional: true,
    });
    plan.mini_plans.push(MiniPlan {
        subtask_id: id.clone(),
        steps: vec![PlanStep::new(mitigation.action.clone(), format!("{} mitigated", risk.id))
            .defensive()],
        tools: Vec::new(),
        risks: vec![risk.description.clone()],
        alternative: None,
        placeholder: false,
        provider: None,
    });
    match plan.phases.first_mut() {
        Some(phase) => phase.subtask_ids.push(id.clone()),
        None => plan.phases.push(dppm_core::ExecutionPhase {
            index: 0,
            subtask_ids: vec![id.clone()],
        }),
    }
    debug!(subtask = %id, risk = %risk.id, "mitigation subtask added");
    AppliedMitigation::FallbackSubtask { subtask_id: id }
}

/// Parse risk blocks. Ids are assigned by the caller after ranking.
pub fn parse_risks(content: &str) -> Vec<(Risk, Mitigation)> {
    let mut out = Vec::new();
    let mut current: Option<(Risk, Mitigation)> = None;

    for line in content.lines() {
        let trimmed = line.trim();

        if let Some(desc) = trimmed.strip_prefix(markers::RISK) {
            if let Some(done) = current.take() {
                out.push(finish(done));
            }
            current = Some(blank(desc.trim()));
            continue;
        }

        let Some((risk, mitigation)) = current.as_mut() else {
            continue;
        };

        if trimmed == markers::SEPARATOR {
            if let Some(done) = current.take() {
                out.push(finish(done));
            }
        } else if let Some(v) = field(trimmed, "Subtask") {
            risk.subtask_id = match v.to_lowercase().as_str() {
                "" | "plan" | "none" | "all" => None,
                _ => Some(v.trim_matches('`').to_string()),
            };
        } else if let Some(v) = field(trimmed, "Likelihood") {
            risk.likelihood = parse_unit(v);
        } else if let Some(v) = field(trimmed, "Impact") {
            risk.impact = parse_unit(v);
        } else if let Some(v) = field(trimmed, "Mitigation") {
            mitigation.action = v.to_string();
        } else if let Some(v) = field(trimmed, "Strategy") {
            mitigation.strategy =
                MitigationStrategy::parse_str(&v.to_lowercase()).unwrap_or(MitigationStrategy::Step);
        }
    }

    if let Some(done) = current.take() {
        out.push(finish(done));
    }
    out.retain(|(r, _)| !r.description.is_empty());
    out
}

fn blank(description: &str) -> (Risk, Mitigation) {
    (
        Risk {
            id: String::new(),
            description: description.to_string(),
            subtask_id: None,
            likelihood: 0.5,
            impact: 0.5,
        },
        Mitigation {
            risk_id: String::new(),
            action: String::new(),
            strategy: MitigationStrategy::Step,
            applied: None,
        },
    )
}

fn finish((risk, mut mitigation): (Risk, Mitigation)) -> (Risk, Mitigation) {
    if mitigation.action.is_empty() {
        mitigation.action = format!("guard against: {}", risk.description);
    }
    (risk, mitigation)
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let tight = format!("**{name}:**");
    let loose = format!("**{name}: **");
    line.strip_prefix(tight.as_str())
        .or_else(|| line.strip_prefix(loose.as_str()))
        .map(str::trim)
}

/// Accepts `0.4`, `40%` or `40`; clamps to [0, 1]. Unparsable is 0.5.
fn parse_unit(value: &str) -> f64 {
    let (num, percent) = match value.strip_suffix('%') {
        Some(n) => (n.trim(), true),
        None => (value, false),
    };
    let Ok(mut v) = num.parse::<f64>() else {
        return 0.5;
    };
    if !v.is_finite() {
        return 0.5;
    }
    if percent || v > 1.0 {
        v /= 100.0;
    }
    v.clamp(0.0, 1.0)
}
