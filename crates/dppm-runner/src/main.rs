use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dppm_core::{DppmConfig, StepStatus};
use dppm_db::{Database, DbConfig, SqliteDatabase};
use dppm_runner::config::{Command, RunnerConfig};
use dppm_runner::provider::cli::CliProvider;
use dppm_runner::provider::ModelProvider;
use dppm_runner::tool::command::CommandToolExecutor;
use dppm_runner::tool::{CommandPolicy, ToolExecutor};
use dppm_runner::{preflight, Orchestrator};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunnerConfig::parse();
    info!("dppm-runner starting");

    let db_config = DbConfig {
        sqlite_path: config.db_path.clone(),
    };
    let db: Arc<dyn Database> =
        Arc::new(SqliteDatabase::open(&db_config).context("failed to open database")?);

    match &config.command {
        Command::Preflight => {
            let dppm_config = config.to_dppm_config()?;
            let providers = build_providers(&config, &dppm_config)?;
            let tools = build_tools(&config, &dppm_config)?;
            preflight::run_all(&providers, tools.as_ref()).await?;
        }
        Command::Experiences { user, limit } => {
            let experiences = db
                .list_experiences(user, *limit)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            print_json(&experiences)?;
        }
        Command::Workflows { user, all } => {
            let workflows = db
                .list_workflows(user, *all)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            print_json(&workflows)?;
        }
        Command::Run { goal, user } => {
            let dppm_config = config.to_dppm_config()?;
            let providers = build_providers(&config, &dppm_config)?;
            let tools = build_tools(&config, &dppm_config)?;
            preflight::run_all(&providers, tools.as_ref()).await?;

            let orchestrator = Orchestrator::new(providers, tools, db)
                .with_global_concurrency(config.global_concurrency);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_signal.cancel();
                }
            });

            let result = orchestrator
                .run_dppm_with_token(goal, user, &dppm_config, cancel)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            info!(
                run_id = %result.run_id,
                state = %result.state,
                "{} of {} subtasks succeeded",
                result.execution_result.count(StepStatus::Success),
                result.plan.subtasks.len()
            );
            print_json(&result)?;
        }
    }

    Ok(())
}

fn build_providers(
    config: &RunnerConfig,
    dppm_config: &DppmConfig,
) -> Result<Vec<Arc<dyn ModelProvider>>> {
    config
        .providers
        .iter()
        .filter(|spec| !spec.trim().is_empty())
        .map(|spec| {
            let provider = CliProvider::parse_spec(spec)?
                .with_timeouts(dppm_config.model_timeout(), config.kill_grace());
            Ok(Arc::new(provider) as Arc<dyn ModelProvider>)
        })
        .collect()
}

fn build_tools(config: &RunnerConfig, dppm_config: &DppmConfig) -> Result<Arc<dyn ToolExecutor>> {
    let command = config
        .tool_command
        .as_deref()
        .context("no tool command configured. Pass --tool-command or set DPPM_TOOL_COMMAND")?;
    let policy = if config.allow_any_command {
        CommandPolicy::permissive()
    } else {
        CommandPolicy::default()
    };
    let executor = CommandToolExecutor::parse(command)
        .with_context(|| format!("tool command '{command}' is empty"))?
        .with_timeouts(dppm_config.tool_timeout(), config.kill_grace())
        .with_policy(policy);
    Ok(Arc::new(executor))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
