use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionResult;
use crate::plan::MergedPlan;
use crate::reflection::PostExecutionReflection;

/// Immutable record of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub owner: String,
    pub goal: String,
    pub plan: MergedPlan,
    pub result: ExecutionResult,
    pub reflection: PostExecutionReflection,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperience {
    pub owner: String,
    pub goal: String,
    pub plan: MergedPlan,
    pub result: ExecutionResult,
    pub reflection: PostExecutionReflection,
}
