use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ModelProvider, ProviderError};
use crate::process::{self, ProcessError};

/// Wraps a command-line model client. The prompt is passed as the final
/// argument and stdout is the response.
#[derive(Debug, Clone)]
pub struct CliProvider {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub cost: f64,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl CliProvider {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            model: None,
            cost: 1.0,
            timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Parse `name=program arg arg`, optionally suffixed with `@cost`
    /// on the name (`fast@0.2=llm -m small`).
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let (head, command) = spec
            .split_once('=')
            .with_context(|| format!("provider spec '{spec}' is not name=command"))?;
        let (name, cost) = match head.trim().split_once('@') {
            Some((name, cost)) => {
                let cost: f64 = cost
                    .parse()
                    .with_context(|| format!("invalid cost in provider spec '{spec}'"))?;
                (name.trim(), cost)
            }
            None => (head.trim(), 1.0),
        };
        if name.is_empty() {
            bail!("provider spec '{spec}' has an empty name");
        }
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .with_context(|| format!("provider spec '{spec}' has no command"))?;
        let mut provider = Self::new(name, program, parts.collect());
        provider.cost = cost;
        Ok(provider)
    }

    pub fn with_timeouts(mut self, timeout: Duration, kill_grace: Duration) -> Self {
        self.timeout = timeout;
        self.kill_grace = kill_grace;
        self
    }
}

#[async_trait]
impl ModelProvider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_hint(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    async fn preflight_check(&self) -> Result<()> {
        let output = std::process::Command::new(&self.program)
            .arg("--version")
            .output()
            .with_context(|| format!("{}: '{}' is not installed", self.name, self.program))?;
        if !output.status.success() {
            bail!("{}: {} --version failed", self.name, self.program);
        }
        let version = String::from_utf8_lossy(&output.stdout);
        info!("{}: {}", self.name, version.lines().next().unwrap_or("").trim());
        Ok(())
    }

    async fn invoke(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(prompt);
        debug!(provider = %self.name, "invoking {}", self.program);

        match process::run_managed(&mut cmd, None, self.timeout, self.kill_grace).await {
            Ok(out) if out.success => Ok(out.stdout),
            Ok(out) => {
                let detail = out.stderr.trim();
                let detail = if detail.is_empty() { "no stderr" } else { detail };
                Err(ProviderError::Failed(format!(
                    "{} exited with {}: {detail}",
                    self.program, out.exit_code
                )))
            }
            Err(ProcessError::TimedOut(d)) => Err(ProviderError::Timeout(d)),
            Err(e) => Err(ProviderError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spec_splits_name_and_command() {
        let p = CliProvider::parse_spec("claude=claude -p --output-format text").unwrap();
        assert_eq!(p.name(), "claude");
        assert_eq!(p.program, "claude");
        assert_eq!(p.args, vec!["-p", "--output-format", "text"]);
        assert_eq!(p.cost_per_call(), 1.0);
    }

    #[test]
    fn parse_spec_with_cost() {
        let p = CliProvider::parse_spec("fast@0.25=llm -m small").unwrap();
        assert_eq!(p.name(), "fast");
        assert_eq!(p.cost_per_call(), 0.25);
        assert_eq!(p.program, "llm");
    }

    #[test]
    fn parse_spec_rejects_garbage() {
        assert!(CliProvider::parse_spec("no-equals-sign").is_err());
        assert!(CliProvider::parse_spec("=cmd").is_err());
        assert!(CliProvider::parse_spec("name=   ").is_err());
        assert!(CliProvider::parse_spec("x@cheap=cmd").is_err());
    }

    #[tokio::test]
    async fn invoke_passes_prompt_as_last_argument() {
        let p = CliProvider::new("echo", "echo", vec!["-n".into()]);
        let out = p.invoke("hello model").await.unwrap();
        assert_eq!(out, "hello model");
    }

    #[tokio::test]
    async fn invoke_maps_nonzero_exit_to_failed() {
        let p = CliProvider::new("false", "sh", vec!["-c".into(), "echo bad >&2; exit 2".into()]);
        let err = p.invoke("ignored").await.unwrap_err();
        match err {
            ProviderError::Failed(msg) => assert!(msg.contains("bad"), "{msg}"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_maps_timeout() {
        let p = CliProvider::new("slow", "sleep", vec![])
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(50));
        let err = p.invoke("30").await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }
}
