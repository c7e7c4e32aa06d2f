use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use dppm_core::{PlanStep, Subtask};

use super::{ToolError, ToolExecutor, ToolOutput};

/// Scripted outcome of one tool call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Ok(String),
    Timeout,
    Transient(String),
    Permanent(String),
    /// Never returns. Used to exercise cancellation.
    Hang,
}

/// Tool executor driven by per-subtask outcome queues. Once a subtask's
/// queue is empty its calls succeed with `"<subtask>: <action>"`.
#[derive(Default)]
pub struct MockToolExecutor {
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Duration,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, subtask_id: &str, outcomes: Vec<MockOutcome>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(subtask_id.to_string())
                .or_default()
                .extend(outcomes);
        }
        self
    }

    /// Number of calls made for `subtask_id`.
    pub fn calls_for(&self, subtask_id: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(id, _)| id == subtask_id).count())
            .unwrap_or(0)
    }

    /// `(subtask_id, action)` for every call, in the order calls started.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, subtask: &Subtask, step: &PlanStep) -> Result<ToolOutput, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((subtask.id.clone(), step.action.clone()));
        }
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&subtask.id).and_then(|q| q.pop_front()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match next {
            None => Ok(ToolOutput::text(format!("{}: {}", subtask.id, step.action))),
            Some(MockOutcome::Ok(out)) => Ok(ToolOutput::text(out)),
            Some(MockOutcome::Timeout) => Err(ToolError::Timeout(Duration::ZERO)),
            Some(MockOutcome::Transient(msg)) => Err(ToolError::transient(msg)),
            Some(MockOutcome::Permanent(msg)) => Err(ToolError::permanent(msg)),
            Some(MockOutcome::Hang) => {
                std::future::pending::<()>().await;
                Err(ToolError::permanent("unreachable"))
            }
        }
    }
}
