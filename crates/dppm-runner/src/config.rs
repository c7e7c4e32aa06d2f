use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dppm_core::DppmConfig;

#[derive(Debug, Parser)]
#[command(name = "dppm-runner", about = "DPPM goal orchestrator")]
pub struct RunnerConfig {
    /// SQLite database file
    #[arg(long, env = "DPPM_DB_PATH")]
    pub db_path: Option<String>,

    /// Model providers as `name[@cost]=command args`, separated by `;`.
    /// The prompt is passed as the final argument.
    #[arg(long = "provider", env = "DPPM_PROVIDERS", value_delimiter = ';')]
    pub providers: Vec<String>,

    /// Program that executes plan steps. Receives `{subtask, step}` JSON on stdin.
    #[arg(long, env = "DPPM_TOOL_COMMAND")]
    pub tool_command: Option<String>,

    /// JSON file with orchestration settings. Flags below override it.
    #[arg(long = "config", env = "DPPM_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Timeout for a single model call (seconds).
    #[arg(long, env = "DPPM_MODEL_TIMEOUT")]
    pub model_timeout: Option<u64>,

    /// Timeout for a single tool call (seconds).
    #[arg(long, env = "DPPM_TOOL_TIMEOUT")]
    pub tool_timeout: Option<u64>,

    /// Grace period after SIGTERM before SIGKILL (seconds).
    #[arg(long, env = "DPPM_KILL_GRACE", default_value = "5")]
    pub kill_grace_period: u64,

    /// Subtasks executing at once within one run.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Subtasks executing at once across all runs of this process.
    #[arg(long, default_value = "16")]
    pub global_concurrency: usize,

    /// Attempts per step, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    #[arg(long)]
    pub min_subtasks: Option<usize>,

    #[arg(long)]
    pub max_subtasks: Option<usize>,

    #[arg(long)]
    pub skip_pre_flight: bool,

    #[arg(long)]
    pub skip_post_reflection: bool,

    /// Always plan from scratch, even when a cached workflow matches.
    #[arg(long)]
    pub no_workflow_reuse: bool,

    /// Accept any program in shell steps instead of the built-in allow list.
    #[arg(long)]
    pub allow_any_command: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan and execute a goal, printing the result as JSON.
    Run {
        #[arg(long)]
        goal: String,

        #[arg(long, env = "DPPM_USER", default_value = "local")]
        user: String,
    },
    /// List stored experiences.
    Experiences {
        #[arg(long, env = "DPPM_USER", default_value = "local")]
        user: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List cached workflows.
    Workflows {
        #[arg(long, env = "DPPM_USER", default_value = "local")]
        user: String,

        /// Include retired workflows.
        #[arg(long)]
        all: bool,
    },
    /// Check that every provider and the tool command are usable.
    Preflight,
}

impl RunnerConfig {
    /// Settings for `Orchestrator::run_dppm`: defaults, then the config
    /// file, then flags.
    pub fn to_dppm_config(&self) -> Result<DppmConfig> {
        let mut config = match &self.config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => DppmConfig::default(),
        };

        if let Some(v) = self.model_timeout {
            config.model_timeout_secs = v;
        }
        if let Some(v) = self.tool_timeout {
            config.tool_timeout_secs = v;
        }
        if let Some(v) = self.max_concurrency {
            config.max_concurrency = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.min_subtasks {
            config.min_subtasks = v;
        }
        if let Some(v) = self.max_subtasks {
            config.max_subtasks = v;
        }
        config.skip_pre_flight |= self.skip_pre_flight;
        config.skip_post_reflection |= self.skip_post_reflection;
        if self.no_workflow_reuse {
            config.reuse_workflows = false;
        }

        config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(config)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period)
    }
}
