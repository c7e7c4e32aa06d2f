use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionResult;
use crate::plan::MergedPlan;
use crate::reflection::PostExecutionReflection;
use crate::risk::PreFlightReport;

/// Lifecycle of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Decomposing,
    Planning,
    Merging,
    PreFlight,
    Executing,
    Reflecting,
    Completed,
    PartialSuccess,
    Failed,
    /// User abort before execution started.
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Decomposing => "decomposing",
            RunState::Planning => "planning",
            RunState::Merging => "merging",
            RunState::PreFlight => "pre_flight",
            RunState::Executing => "executing",
            RunState::Reflecting => "reflecting",
            RunState::Completed => "completed",
            RunState::PartialSuccess => "partial_success",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "decomposing" => Some(RunState::Decomposing),
            "planning" => Some(RunState::Planning),
            "merging" => Some(RunState::Merging),
            "pre_flight" => Some(RunState::PreFlight),
            "executing" => Some(RunState::Executing),
            "reflecting" => Some(RunState::Reflecting),
            "completed" => Some(RunState::Completed),
            "partial_success" => Some(RunState::PartialSuccess),
            "failed" => Some(RunState::Failed),
            "cancelled" => Some(RunState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::PartialSuccess
                | RunState::Failed
                | RunState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// A reused workflow enters `Executing` from `Decomposing` directly, and
    /// `Failed` is only reachable while decomposing or merging.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if next == Cancelled {
            return matches!(self, Decomposing | Planning | Merging | PreFlight);
        }
        matches!(
            (self, next),
            (Decomposing, Planning)
                | (Decomposing, Executing)
                | (Decomposing, Failed)
                | (Planning, Merging)
                | (Merging, PreFlight)
                | (Merging, Executing)
                | (Merging, Failed)
                | (PreFlight, Executing)
                | (Executing, Reflecting)
                | (Reflecting, Completed)
                | (Reflecting, PartialSuccess)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted bookkeeping row for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub owner: String,
    pub goal: String,
    pub state: RunState,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything a caller gets back from a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DppmResult {
    pub run_id: String,
    pub state: RunState,
    pub plan: MergedPlan,
    pub pre_flight: Option<PreFlightReport>,
    pub execution_result: ExecutionResult,
    pub post_reflection: PostExecutionReflection,
    /// Workflow saved by this run, or the one it reused.
    pub workflow_id: Option<String>,
    pub reused_workflow: bool,
}
