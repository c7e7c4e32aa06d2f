use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DppmError;

/// Per-run knobs for the orchestrator.
///
/// Every field has a default, so callers can deserialize a partial JSON
/// object and only override what they care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DppmConfig {
    pub min_subtasks: usize,
    pub max_subtasks: usize,
    pub skip_pre_flight: bool,
    pub skip_post_reflection: bool,
    /// Per-plan cap on concurrently executing subtasks.
    pub max_concurrency: usize,
    /// Cap on concurrent mini-plan requests.
    pub max_planning_concurrency: usize,
    /// Number of providers competing on decomposition. 1 disables the ensemble.
    pub decompose_ensemble: usize,

    /// Mitigations for risks scoring at or above this are inserted into the plan.
    pub risk_threshold: f64,

    /// Tool calls per step, counting the first.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,

    pub workflow_success_threshold: f64,
    pub max_fallbacks_for_workflow: usize,
    pub reuse_workflows: bool,
    pub workflow_match_threshold: f64,
    pub experience_match_threshold: f64,
    pub experience_limit: usize,
    pub retire_min_uses: i64,
    pub retire_threshold: f64,
}

impl Default for DppmConfig {
    fn default() -> Self {
        Self {
            min_subtasks: 3,
            max_subtasks: 7,
            skip_pre_flight: false,
            skip_post_reflection: false,
            max_concurrency: 4,
            max_planning_concurrency: 8,
            decompose_ensemble: 1,
            risk_threshold: 0.3,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            model_timeout_secs: 120,
            tool_timeout_secs: 300,
            workflow_success_threshold: 0.8,
            max_fallbacks_for_workflow: 1,
            reuse_workflows: true,
            workflow_match_threshold: 0.85,
            experience_match_threshold: 0.3,
            experience_limit: 3,
            retire_min_uses: 3,
            retire_threshold: 0.5,
        }
    }
}

impl DppmConfig {
    pub fn validate(&self) -> Result<(), DppmError> {
        if self.min_subtasks == 0 {
            return Err(DppmError::InvalidInput("min_subtasks must be at least 1".into()));
        }
        if self.min_subtasks > self.max_subtasks {
            return Err(DppmError::InvalidInput(format!(
                "min_subtasks ({}) exceeds max_subtasks ({})",
                self.min_subtasks, self.max_subtasks
            )));
        }
        if self.max_concurrency == 0 || self.max_planning_concurrency == 0 {
            return Err(DppmError::InvalidInput("concurrency caps must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(DppmError::InvalidInput("max_attempts must be at least 1".into()));
        }
        let unit = [
            ("risk_threshold", self.risk_threshold),
            ("workflow_success_threshold", self.workflow_success_threshold),
            ("workflow_match_threshold", self.workflow_match_threshold),
            ("experience_match_threshold", self.experience_match_threshold),
            ("retire_threshold", self.retire_threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(DppmError::InvalidInput(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms))
    }
}
