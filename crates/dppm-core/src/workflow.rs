use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::MergedPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    /// Success rate degraded below threshold; kept for history, never matched.
    Retired,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Retired => "retired",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WorkflowStatus::Active),
            "retired" => Some(WorkflowStatus::Retired),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reusable plan template derived from a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub owner: String,
    pub goal: String,
    pub plan: MergedPlan,
    pub success_count: i64,
    pub total_uses: i64,
    pub status: WorkflowStatus,
    pub source_experience_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Success rate over recorded uses. A workflow that has never been reused
    /// reports 1.0, since it was saved from a successful run.
    pub fn success_rate(&self) -> f64 {
        if self.total_uses == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_uses as f64
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub owner: String,
    pub goal: String,
    pub plan: MergedPlan,
    pub source_experience_id: Option<String>,
}
