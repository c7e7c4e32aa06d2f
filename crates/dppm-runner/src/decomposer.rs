use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dppm_core::{DppmConfig, DppmError, Subtask};
use dppm_prompts::{decompose, PromptContext};

use crate::merger;
use crate::router::{self, CallError, ModelRouter};
use crate::subtask_parser;

/// Splits a goal into dependency-linked subtasks.
pub struct TaskDecomposer {
    router: Arc<ModelRouter>,
}

impl TaskDecomposer {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    /// Ask the best provider for a decomposition, falling through the
    /// ranking on failed calls and on responses that do not validate.
    ///
    /// With `decompose_ensemble > 1` the top providers answer concurrently and
    /// the first valid answer in rank order wins.
    pub async fn decompose(
        &self,
        ctx: &PromptContext,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subtask>, DppmError> {
        let prompt = decompose::build(ctx, config.min_subtasks, config.max_subtasks);

        if config.decompose_ensemble > 1 && self.router.providers().len() > 1 {
            return self.decompose_ensemble(prompt, config, cancel).await;
        }

        let mut last_error = String::from("no providers configured");
        for provider in self.router.select(router::DECOMPOSE) {
            if cancel.is_cancelled() {
                return Err(DppmError::Cancelled);
            }
            let started = Instant::now();
            let text = match router::call(provider.as_ref(), &prompt, config.model_timeout(), cancel)
                .await
            {
                Ok(text) => text,
                Err(CallError::Cancelled) => return Err(DppmError::Cancelled),
                Err(CallError::Provider(e)) => {
                    self.router
                        .record(provider.name(), router::DECOMPOSE, false, started.elapsed());
                    warn!(provider = provider.name(), "decomposition call failed: {e}");
                    last_error = format!("{}: {e}", provider.name());
                    continue;
                }
            };

            match parse_and_validate(&text, config) {
                Ok(subtasks) => {
                    self.router
                        .record(provider.name(), router::DECOMPOSE, true, started.elapsed());
                    info!(
                        provider = provider.name(),
                        count = subtasks.len(),
                        "goal decomposed"
                    );
                    return Ok(subtasks);
                }
                Err(reason) => {
                    self.router
                        .record(provider.name(), router::DECOMPOSE, false, started.elapsed());
                    warn!(provider = provider.name(), "rejected decomposition: {reason}");
                    last_error = format!("{}: {reason}", provider.name());
                }
            }
        }

        Err(DppmError::Decomposition(last_error))
    }

    async fn decompose_ensemble(
        &self,
        prompt: String,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Subtask>, DppmError> {
        let candidates = self
            .router
            .select_top(router::DECOMPOSE, config.decompose_ensemble);
        debug!(k = candidates.len(), "decomposition ensemble");

        let prompt = Arc::new(prompt);
        let timeout = config.model_timeout();
        let mut set = JoinSet::new();
        for (rank, provider) in candidates.iter().enumerate() {
            let provider = provider.clone();
            let prompt = prompt.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let started = Instant::now();
                let res = router::call(provider.as_ref(), &prompt, timeout, &cancel).await;
                (rank, res, started.elapsed())
            });
        }

        let mut answers: Vec<Option<(Result<String, CallError>, std::time::Duration)>> =
            (0..candidates.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((rank, res, elapsed)) => answers[rank] = Some((res, elapsed)),
                Err(e) => warn!("ensemble task panicked: {e}"),
            }
        }
        if cancel.is_cancelled() {
            return Err(DppmError::Cancelled);
        }

        let mut winner: Option<Vec<Subtask>> = None;
        let mut last_error = String::from("no ensemble answers");
        for (provider, answer) in candidates.iter().zip(answers) {
            let Some((res, elapsed)) = answer else {
                continue;
            };
            let outcome = res
                .map_err(|e| e.to_string())
                .and_then(|text| parse_and_validate(&text, config));
            match outcome {
                Ok(subtasks) => {
                    if winner.is_none() {
                        self.router
                            .record(provider.name(), router::DECOMPOSE, true, elapsed);
                        info!(provider = provider.name(), "ensemble winner");
                        winner = Some(subtasks);
                    }
                }
                Err(reason) => {
                    self.router
                        .record(provider.name(), router::DECOMPOSE, false, elapsed);
                    warn!(provider = provider.name(), "ensemble answer rejected: {reason}");
                    last_error = format!("{}: {reason}", provider.name());
                }
            }
        }

        winner.ok_or(DppmError::Decomposition(last_error))
    }
}

/// Parse a decomposition response and check it against the configured bounds.
pub fn parse_and_validate(text: &str, config: &DppmConfig) -> Result<Vec<Subtask>, String> {
    let subtasks = subtask_parser::extract_subtasks(text);
    validate(&subtasks, config.min_subtasks, config.max_subtasks)?;
    Ok(subtasks)
}

/// Count bounds, id hygiene, backward-only references, then a full cycle check.
pub fn validate(subtasks: &[Subtask], min: usize, max: usize) -> Result<(), String> {
    if subtasks.is_empty() {
        return Err("no subtasks found in response".into());
    }
    if subtasks.len() < min || subtasks.len() > max {
        return Err(format!(
            "expected between {min} and {max} subtasks, got {}",
            subtasks.len()
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for s in subtasks {
        if s.id.is_empty() {
            return Err("subtask with empty id".into());
        }
        for dep in &s.depends_on {
            if dep == &s.id {
                return Err(format!("subtask '{}' depends on itself", s.id));
            }
            if !seen.contains(dep.as_str()) {
                return Err(format!(
                    "subtask '{}' depends on '{dep}', which is not declared before it",
                    s.id
                ));
            }
        }
        if !seen.insert(s.id.as_str()) {
            return Err(format!("duplicate subtask id '{}'", s.id));
        }
    }

    merger::topological_phases(subtasks).map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dppm_core::Domain;
    use dppm_prompts::headers;

    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::provider::ModelProvider;

    const TWEET: &str = r#"
#### SUBTASK: draft
**Title:** Draft tweet
**Domain:** writing
**Depends on:** none
---
#### SUBTASK: review
**Title:** Review tweet
**Domain:** writing
**Depends on:** draft
---
#### SUBTASK: post
**Title:** Post tweet
**Domain:** communication
**Depends on:** review
---
"#;

    const TOO_FEW: &str = "#### SUBTASK: only\n**Title:** Only one\n---\n";

    fn subtask(id: &str, deps: &[&str]) -> Subtask {
        Subtask {
            id: id.into(),
            title: id.into(),
            description: id.into(),
            domain: Domain::General,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            complexity: 1,
            optional: false,
        }
    }

    fn decomposer(providers: Vec<MockProvider>) -> (TaskDecomposer, Arc<ModelRouter>) {
        let providers = providers
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn ModelProvider>)
            .collect();
        let router = Arc::new(ModelRouter::new(providers));
        (TaskDecomposer::new(router.clone()), router)
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let ok = vec![subtask("a", &[]), subtask("b", &["a"]), subtask("c", &["a", "b"])];
        assert!(validate(&ok, 3, 7).is_ok());

        assert!(validate(&ok[..2], 3, 7).unwrap_err().contains("between 3 and 7"));
        assert!(validate(&ok, 1, 2).is_err());

        let dup = vec![subtask("a", &[]), subtask("a", &[]), subtask("c", &[])];
        assert!(validate(&dup, 1, 7).unwrap_err().contains("duplicate"));

        let selfdep = vec![subtask("a", &["a"])];
        assert!(validate(&selfdep, 1, 7).unwrap_err().contains("itself"));

        let forward = vec![subtask("a", &["b"]), subtask("b", &[])];
        assert!(validate(&forward, 1, 7).unwrap_err().contains("not declared before"));

        let empty_id = vec![subtask("", &[])];
        assert!(validate(&empty_id, 1, 7).unwrap_err().contains("empty id"));
    }

    #[tokio::test]
    async fn decomposes_linear_chain() {
        let (d, router) = decomposer(vec![MockProvider::new("m").on(headers::DECOMPOSE, TWEET)]);
        let subtasks = d
            .decompose(
                &PromptContext::new("Write and post a tweet"),
                &DppmConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["draft", "review", "post"]);
        assert_eq!(subtasks[2].domain, Domain::Communication);
        assert!(router.events()[0].won);
    }

    #[tokio::test]
    async fn invalid_answer_falls_through_to_next_provider() {
        let (d, router) = decomposer(vec![
            MockProvider::new("sloppy").on(headers::DECOMPOSE, TOO_FEW),
            MockProvider::new("careful").on(headers::DECOMPOSE, TWEET),
        ]);
        let subtasks = d
            .decompose(
                &PromptContext::new("tweet"),
                &DppmConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 3);
        let events = router.events();
        assert!(!events[0].won && events[0].provider == "sloppy");
        assert!(events[1].won && events[1].provider == "careful");
    }

    #[tokio::test]
    async fn unparsable_everywhere_is_decomposition_error() {
        let (d, _) = decomposer(vec![MockProvider::new("m").on(headers::DECOMPOSE, "no idea")]);
        let err = d
            .decompose(
                &PromptContext::new("tweet"),
                &DppmConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DppmError::Decomposition(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn prompt_carries_bounds_and_experience() {
        let provider = Arc::new(MockProvider::new("m").on(headers::DECOMPOSE, TWEET));
        let router = Arc::new(ModelRouter::new(vec![provider.clone() as Arc<dyn ModelProvider>]));
        let d = TaskDecomposer::new(router);
        let ctx = PromptContext::new("tweet").with_experiences(vec![dppm_prompts::ExperienceHint {
            goal: "older tweet".into(),
            succeeded: true,
            lessons: vec!["keep it short".into()],
        }]);
        let config = DppmConfig {
            max_subtasks: 5,
            ..Default::default()
        };
        d.decompose(&ctx, &config, &CancellationToken::new())
            .await
            .unwrap();
        let prompt = &provider.prompts()[0];
        assert!(prompt.contains("between 3 and 5 subtasks"));
        assert!(prompt.contains("keep it short"));
    }

    #[tokio::test]
    async fn ensemble_prefers_best_ranked_valid_answer() {
        let (d, router) = decomposer(vec![
            MockProvider::new("a").on(headers::DECOMPOSE, TOO_FEW),
            MockProvider::new("b")
                .with_delay(Duration::from_millis(30))
                .on(headers::DECOMPOSE, TWEET),
            MockProvider::new("c").on(headers::DECOMPOSE, TWEET),
        ]);
        let config = DppmConfig {
            decompose_ensemble: 3,
            ..Default::default()
        };
        let subtasks = d
            .decompose(&PromptContext::new("tweet"), &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 3);

        let events = router.events();
        let won: Vec<_> = events.iter().filter(|e| e.won).map(|e| e.provider.as_str()).collect();
        let lost: Vec<_> = events.iter().filter(|e| !e.won).map(|e| e.provider.as_str()).collect();
        assert_eq!(won, vec!["b"]);
        assert_eq!(lost, vec!["a"]);
    }

    #[tokio::test]
    async fn cancelled_before_call() {
        let (d, _) = decomposer(vec![MockProvider::new("m").on(headers::DECOMPOSE, TWEET)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = d
            .decompose(&PromptContext::new("tweet"), &DppmConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DppmError::Cancelled));
    }
}
