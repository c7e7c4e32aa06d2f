pub mod command;
pub mod mock;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use dppm_core::{PlanStep, Subtask};

/// What a successful tool call produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    #[serde(default)]
    pub side_effects: Vec<String>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            side_effects: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("{message}")]
    Failed { message: String, retryable: bool },
}

impl ToolError {
    pub fn permanent(message: impl Into<String>) -> Self {
        ToolError::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ToolError::Failed {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Executes one plan step on behalf of a subtask.
///
/// Retry, backoff and fallback are the bridge's job; an executor makes
/// exactly one attempt per call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn preflight_check(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, subtask: &Subtask, step: &PlanStep) -> Result<ToolOutput, ToolError>;
}

/// Allow/deny screening for steps that carry a shell command.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Program names permitted as the first word. Empty allows any program
    /// not denied.
    pub allowed: Vec<String>,
    /// Words that reject a command wherever they appear.
    pub blocked: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        let allowed = [
            "npm", "node", "pnpm", "yarn", "npx", "tsc", "python", "python3", "pip", "pip3",
            "git", "gcc", "g++", "make", "cargo", "ls", "cat", "echo", "mkdir", "pwd", "cp",
            "mv", "rm", "touch", "chmod", "grep", "find", "sed", "awk", "curl",
        ];
        let blocked = [
            "sudo", "su", "passwd", "useradd", "usermod", "fdisk", "mkfs", "mount", "umount",
            "iptables", "reboot", "shutdown", "init",
        ];
        Self {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            blocked: blocked.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CommandPolicy {
    pub fn permissive() -> Self {
        Self {
            allowed: Vec::new(),
            blocked: Vec::new(),
        }
    }

    /// Reject a command line with the reason, or accept it.
    pub fn check(&self, command: &str) -> Result<(), String> {
        let words: Vec<&str> = command
            .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')'))
            .filter(|w| !w.is_empty())
            .collect();

        let Some(first) = words.first() else {
            return Err("empty command".into());
        };

        for word in &words {
            let base = word.rsplit('/').next().unwrap_or(word);
            if self.blocked.iter().any(|b| b == base) {
                warn!("blocked command detected: {base}");
                return Err(format!("command uses blocked program '{base}'"));
            }
        }

        let program = first.rsplit('/').next().unwrap_or(first);
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a == program) {
            warn!("command not in allow list: {program}");
            return Err(format!("program '{program}' is not allowed"));
        }
        Ok(())
    }
}
