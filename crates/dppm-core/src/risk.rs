use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStrategy {
    /// Insert a defensive step ahead of the subtask's own steps.
    Step,
    /// Give the subtask (or plan) a fallback path.
    Fallback,
}

impl MitigationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MitigationStrategy::Step => "step",
            MitigationStrategy::Fallback => "fallback",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "step" => Some(MitigationStrategy::Step),
            "fallback" => Some(MitigationStrategy::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for MitigationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub id: String,
    pub description: String,
    /// `None` when the risk applies to the plan as a whole.
    pub subtask_id: Option<String>,
    pub likelihood: f64,
    pub impact: f64,
}

impl Risk {
    pub fn score(&self) -> f64 {
        self.likelihood * self.impact
    }
}

/// What a mitigation turned into once materialized in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedMitigation {
    DefensiveStep { subtask_id: String },
    Alternative { subtask_id: String },
    FallbackSubtask { subtask_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mitigation {
    pub risk_id: String,
    pub action: String,
    pub strategy: MitigationStrategy,
    /// Filled in when the risk scored above the threshold and the
    /// mitigation was inserted into the plan.
    #[serde(default)]
    pub applied: Option<AppliedMitigation>,
}

/// Outcome of the pre-flight critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreFlightReport {
    /// Name of the critique strategy that produced the report.
    pub critic: String,
    /// Ranked by score, highest first.
    pub risks: Vec<Risk>,
    pub mitigations: Vec<Mitigation>,
}

impl PreFlightReport {
    pub fn applied_count(&self) -> usize {
        self.mitigations.iter().filter(|m| m.applied.is_some()).count()
    }

    pub fn risk(&self, id: &str) -> Option<&Risk> {
        self.risks.iter().find(|r| r.id == id)
    }
}
