use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use dppm_core::{PlanStep, Subtask};

use super::{CommandPolicy, ToolError, ToolExecutor, ToolOutput};
use crate::process::{self, ProcessError};

/// `EX_TEMPFAIL` from sysexits.h. A tool exiting with it asks for a retry.
const EXIT_TEMPFAIL: i32 = 75;

/// Runs a configured program once per plan step.
///
/// The program receives `{"subtask": .., "step": ..}` as JSON on stdin.
/// Stdout is the output, either plain text or a JSON `ToolOutput` object.
/// A non-zero exit is a failure, retryable when the exit code is 75.
#[derive(Debug, Clone)]
pub struct CommandToolExecutor {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub policy: CommandPolicy,
}

impl CommandToolExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            policy: CommandPolicy::default(),
        }
    }

    /// Parse a whitespace-separated command line.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn with_timeouts(mut self, timeout: Duration, kill_grace: Duration) -> Self {
        self.timeout = timeout;
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl ToolExecutor for CommandToolExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn preflight_check(&self) -> Result<()> {
        // The name goes in as `$1` so the shell never parses it.
        let status = std::process::Command::new("sh")
            .args(["-c", r#"command -v "$1""#, "sh"])
            .arg(&self.program)
            .output()
            .context("failed to run sh")?;
        if !status.status.success() {
            anyhow::bail!("tool command '{}' not found on PATH", self.program);
        }
        info!("tool: {}", self.program);
        Ok(())
    }

    async fn execute(&self, subtask: &Subtask, step: &PlanStep) -> Result<ToolOutput, ToolError> {
        if step.capability == "shell" {
            self.policy
                .check(&step.action)
                .map_err(|reason| ToolError::permanent(format!("command rejected: {reason}")))?;
        }

        let payload = json!({ "subtask": subtask, "step": step });
        let input = serde_json::to_vec(&payload)
            .map_err(|e| ToolError::permanent(format!("encode tool input: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        debug!(subtask = %subtask.id, capability = %step.capability, "running tool");

        let out = match process::run_managed(&mut cmd, Some(input), self.timeout, self.kill_grace)
            .await
        {
            Ok(out) => out,
            Err(ProcessError::TimedOut(d)) => return Err(ToolError::Timeout(d)),
            Err(e) => return Err(ToolError::permanent(e.to_string())),
        };

        if !out.success {
            let stderr = out.stderr.trim();
            let message = if stderr.is_empty() {
                format!("tool exited with {}", out.exit_code)
            } else {
                stderr.to_string()
            };
            return Err(ToolError::Failed {
                message,
                retryable: out.exit_code == EXIT_TEMPFAIL,
            });
        }

        Ok(parse_output(&out.stdout))
    }
}

fn parse_output(stdout: &str) -> ToolOutput {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<ToolOutput>(trimmed) {
            return parsed;
        }
    }
    ToolOutput::text(trimmed)
}
