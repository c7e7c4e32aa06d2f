use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::provider::ModelProvider;
use crate::tool::ToolExecutor;

/// Run all preflight checks before accepting goals.
pub async fn run_all(providers: &[Arc<dyn ModelProvider>], tools: &dyn ToolExecutor) -> Result<()> {
    if providers.is_empty() {
        bail!("no model providers configured. Pass --provider or set DPPM_PROVIDERS");
    }
    for provider in providers {
        check_provider(provider.as_ref()).await?;
    }
    tools
        .preflight_check()
        .await
        .with_context(|| format!("tool executor '{}' is not usable", tools.name()))?;
    info!("all preflight checks passed");
    Ok(())
}

async fn check_provider(provider: &dyn ModelProvider) -> Result<()> {
    provider
        .preflight_check()
        .await
        .with_context(|| format!("provider '{}' failed its preflight check", provider.name()))?;
    match provider.model_hint() {
        Some(model) => info!("provider {}: ok ({model})", provider.name()),
        None => info!("provider {}: ok", provider.name()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::tool::mock::MockToolExecutor;

    #[tokio::test]
    async fn mocks_pass() {
        let providers: Vec<Arc<dyn ModelProvider>> = vec![Arc::new(MockProvider::new("m"))];
        run_all(&providers, &MockToolExecutor::new()).await.unwrap();
    }

    #[tokio::test]
    async fn no_providers_fails() {
        let err = run_all(&[], &MockToolExecutor::new()).await.unwrap_err();
        assert!(err.to_string().contains("no model providers"));
    }
}
