use serde::{Deserialize, Serialize};

use crate::subtask::Subtask;

/// A single action within a mini-plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: String,
    pub expected_outcome: String,
    /// Capability tag the tool executor needs (e.g. "web", "files").
    pub capability: String,
    /// Set on steps injected by the pre-flight pass.
    #[serde(default)]
    pub defensive: bool,
}

impl PlanStep {
    pub fn new(action: impl Into<String>, expected_outcome: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            expected_outcome: expected_outcome.into(),
            capability: "general".into(),
            defensive: false,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn defensive(mut self) -> Self {
        self.defensive = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeApproach {
    pub description: String,
    pub steps: Vec<PlanStep>,
}

/// Step sequence produced for one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniPlan {
    pub subtask_id: String,
    pub steps: Vec<PlanStep>,
    pub tools: Vec<String>,
    pub risks: Vec<String>,
    pub alternative: Option<AlternativeApproach>,
    /// True when planning failed and this is the manual-fallback substitute.
    #[serde(default)]
    pub placeholder: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

impl MiniPlan {
    pub const PLACEHOLDER_ACTION: &'static str = "manual fallback required";

    /// Minimal plan used when the planning call could not be completed.
    pub fn placeholder(subtask_id: impl Into<String>, reason: &str) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            steps: vec![PlanStep::new(
                Self::PLACEHOLDER_ACTION,
                format!("operator completes the subtask by hand ({reason})"),
            )
            .with_capability("manual")],
            tools: Vec::new(),
            risks: vec![format!("planning unavailable: {reason}")],
            alternative: None,
            placeholder: true,
            provider: None,
        }
    }

    /// Expected outcome of the last step, which is what the subtask delivers.
    pub fn expected_outcome(&self) -> Option<&str> {
        self.steps.last().map(|s| s.expected_outcome.as_str())
    }
}

/// A set of subtasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    pub index: usize,
    pub subtask_ids: Vec<String>,
}

impl ExecutionPhase {
    pub fn contains(&self, id: &str) -> bool {
        self.subtask_ids.iter().any(|s| s == id)
    }
}

/// The dependency-ordered plan for a whole goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPlan {
    pub goal: String,
    pub subtasks: Vec<Subtask>,
    /// One per subtask, in subtask declaration order.
    pub mini_plans: Vec<MiniPlan>,
    pub phases: Vec<ExecutionPhase>,
    pub tools: Vec<String>,
    pub risks: Vec<String>,
    pub total_estimated_secs: u64,
    pub critical_path: Vec<String>,
}

impl MergedPlan {
    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn mini_plan(&self, id: &str) -> Option<&MiniPlan> {
        self.mini_plans.iter().find(|p| p.subtask_id == id)
    }

    pub fn mini_plan_mut(&mut self, id: &str) -> Option<&mut MiniPlan> {
        self.mini_plans.iter_mut().find(|p| p.subtask_id == id)
    }

    pub fn phase_of(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.contains(id))
    }

    /// Subtasks whose mini plan is a planning-failure placeholder.
    pub fn placeholder_ids(&self) -> Vec<&str> {
        self.mini_plans
            .iter()
            .filter(|p| p.placeholder)
            .map(|p| p.subtask_id.as_str())
            .collect()
    }

    /// Copy of this plan re-targeted at a new goal text. Used when a cached
    /// workflow template is reused.
    pub fn retarget(&self, goal: &str) -> Self {
        let mut plan = self.clone();
        plan.goal = goal.to_string();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtask::Domain;

    fn subtask(id: &str, deps: &[&str]) -> Subtask {
        Subtask {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            domain: Domain::General,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            complexity: 1,
            optional: false,
        }
    }

    fn plan_for(id: &str, actions: &[&str]) -> MiniPlan {
        MiniPlan {
            subtask_id: id.into(),
            steps: actions.iter().map(|a| PlanStep::new(*a, "done")).collect(),
            tools: vec![],
            risks: vec![],
            alternative: None,
            placeholder: false,
            provider: None,
        }
    }

    fn sample() -> MergedPlan {
        MergedPlan {
            goal: "goal".into(),
            subtasks: vec![subtask("a", &[]), subtask("b", &["a"])],
            mini_plans: vec![plan_for("b", &["b1"]), plan_for("a", &["a1", "a2"])],
            phases: vec![
                ExecutionPhase {
                    index: 0,
                    subtask_ids: vec!["a".into()],
                },
                ExecutionPhase {
                    index: 1,
                    subtask_ids: vec!["b".into()],
                },
            ],
            tools: vec![],
            risks: vec![],
            total_estimated_secs: 120,
            critical_path: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn placeholder_has_single_manual_step() {
        let p = MiniPlan::placeholder("x", "provider timeout");
        assert!(p.placeholder);
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].action, MiniPlan::PLACEHOLDER_ACTION);
        assert!(p.risks[0].contains("provider timeout"));
    }

    #[test]
    fn placeholder_ids_lists_only_placeholders() {
        let mut plan = sample();
        assert!(plan.placeholder_ids().is_empty());
        plan.mini_plans.push(MiniPlan::placeholder("c", "timeout"));
        assert_eq!(plan.placeholder_ids(), vec!["c"]);
    }

    #[test]
    fn phase_lookup() {
        let plan = sample();
        assert_eq!(plan.phase_of("b"), Some(1));
        assert_eq!(plan.phase_of("zzz"), None);
    }

    #[test]
    fn retarget_only_changes_goal() {
        let plan = sample();
        let other = plan.retarget("new goal");
        assert_eq!(other.goal, "new goal");
        assert_eq!(other.subtasks, plan.subtasks);
        assert_eq!(other.phases, plan.phases);
    }
}
