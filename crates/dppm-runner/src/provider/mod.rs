pub mod cli;
pub mod mock;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider failed: {0}")]
    Failed(String),
}

/// A language-model endpoint the router can send prompts to.
///
/// Implementations only turn a prompt into text. Prompt assembly lives in
/// dppm-prompts, and ranking, timeouts and fallthrough live in the router.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable name, used as the key in the router's performance log.
    fn name(&self) -> &str;

    /// Optional model hint for logging/display purposes.
    fn model_hint(&self) -> Option<&str> {
        None
    }

    /// Relative cost of one call. Only the ratio between providers matters.
    fn cost_per_call(&self) -> f64 {
        1.0
    }

    /// Run provider-specific checks. Called by the `preflight` subcommand.
    async fn preflight_check(&self) -> Result<()> {
        Ok(())
    }

    async fn invoke(&self, prompt: &str) -> Result<String, ProviderError>;
}
