use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub subtask_id: String,
    pub status: StepStatus,
    pub output: String,
    pub duration_ms: u64,
    /// Largest number of tool calls spent on any single step.
    pub attempts: u32,
    pub used_fallback: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    pub fn skipped(subtask_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            status: StepStatus::Skipped,
            output: String::new(),
            duration_ms: 0,
            attempts: 0,
            used_fallback: false,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Transient,
    Permanent,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed tool call, kept for the reflection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub subtask_id: String,
    pub step_index: usize,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub results: Vec<StepResult>,
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn result(&self, subtask_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.subtask_id == subtask_id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn fallbacks_used(&self) -> usize {
        self.results.iter().filter(|r| r.used_fallback).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, status: StepStatus, fallback: bool) -> StepResult {
        StepResult {
            subtask_id: id.into(),
            status,
            output: String::new(),
            duration_ms: 1,
            attempts: 1,
            used_fallback: fallback,
            error: None,
        }
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn counts_and_fallbacks() {
        let r = ExecutionResult {
            results: vec![
                result("a", StepStatus::Success, true),
                result("b", StepStatus::Failed, false),
                result("c", StepStatus::Skipped, false),
                result("d", StepStatus::Success, false),
            ],
            errors: vec![],
            cancelled: false,
            duration_ms: 10,
        };
        assert_eq!(r.count(StepStatus::Success), 2);
        assert_eq!(r.count(StepStatus::Failed), 1);
        assert_eq!(r.count(StepStatus::Skipped), 1);
        assert_eq!(r.fallbacks_used(), 1);
        assert_eq!(r.result("b").unwrap().status, StepStatus::Failed);
    }

    #[test]
    fn skipped_constructor() {
        let s = StepResult::skipped("x", "dependency failed");
        assert_eq!(s.status, StepStatus::Skipped);
        assert_eq!(s.attempts, 0);
        assert_eq!(s.error.as_deref(), Some("dependency failed"));
    }
}
