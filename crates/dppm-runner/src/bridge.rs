use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dppm_core::{
    DppmConfig, ErrorKind, ExecutionError, ExecutionResult, MergedPlan, MiniPlan, PlanStep,
    StepResult, StepStatus, Subtask,
};

use crate::tool::{ToolError, ToolExecutor};

/// Substrings that mark a tool failure as worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "503",
    "unavailable",
    "connection reset",
    "temporarily",
];

/// Retry settings for one run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DppmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            timeout: config.tool_timeout(),
        }
    }

    /// Delay before retry number `attempt` (1 = first retry), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.2);
        delay + delay.mul_f64(jitter)
    }
}

/// Map a tool failure onto the retry classes.
pub fn classify(err: &ToolError) -> ErrorKind {
    match err {
        ToolError::Timeout(_) => ErrorKind::Timeout,
        ToolError::Failed { retryable: true, .. } => ErrorKind::Transient,
        ToolError::Failed { message, .. } => {
            let lower = message.to_lowercase();
            if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                ErrorKind::Transient
            } else {
                ErrorKind::Permanent
            }
        }
    }
}

/// Runs a merged plan phase by phase against a tool executor.
pub struct ExecutionBridge {
    tools: Arc<dyn ToolExecutor>,
    global: Arc<Semaphore>,
}

impl ExecutionBridge {
    /// `global` caps concurrent subtasks across every run sharing it.
    pub fn new(tools: Arc<dyn ToolExecutor>, global: Arc<Semaphore>) -> Self {
        Self { tools, global }
    }

    /// Execute every phase in order. Never fails: subtask failures, skips
    /// and cancellation are all reported in the result.
    pub async fn execute(
        &self,
        plan: &MergedPlan,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let policy = RetryPolicy::from_config(config);
        let per_run = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let mut results: HashMap<String, StepResult> = HashMap::new();
        let mut errors: Vec<ExecutionError> = Vec::new();
        let mut cancelled = false;

        for phase in &plan.phases {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            debug!(phase = phase.index, subtasks = phase.subtask_ids.len(), "starting phase");

            let mut set = JoinSet::new();
            for id in &phase.subtask_ids {
                let Some(subtask) = plan.subtask(id) else {
                    continue;
                };
                let blocked = subtask
                    .depends_on
                    .iter()
                    .find(|dep| !results.get(dep.as_str()).is_some_and(|r| r.is_success()));
                if let Some(dep) = blocked {
                    info!(subtask = %id, dependency = %dep, "skipping subtask");
                    results.insert(
                        id.clone(),
                        StepResult::skipped(id, format!("dependency '{dep}' did not succeed")),
                    );
                    continue;
                }
                let Some(mini) = plan.mini_plan(id) else {
                    results.insert(id.clone(), failed(id, "no plan for subtask", 0, false, 0));
                    continue;
                };

                let job = SubtaskJob {
                    tools: self.tools.clone(),
                    subtask: subtask.clone(),
                    plan: mini.clone(),
                    policy,
                    global: self.global.clone(),
                    per_run: per_run.clone(),
                    cancel: cancel.clone(),
                };
                set.spawn(job.run());
            }

            // Join barrier: the next phase starts only when this one is done.
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => {
                        errors.extend(outcome.errors);
                        results.insert(outcome.result.subtask_id.clone(), outcome.result);
                    }
                    Err(e) => warn!("subtask task panicked: {e}"),
                }
            }
        }
        if cancel.is_cancelled() {
            cancelled = true;
        }

        let results = plan
            .subtasks
            .iter()
            .map(|s| {
                results.remove(&s.id).unwrap_or_else(|| {
                    if cancelled {
                        StepResult::skipped(&s.id, "run cancelled")
                    } else {
                        failed(&s.id, "subtask did not complete", 0, false, 0)
                    }
                })
            })
            .collect::<Vec<_>>();

        let result = ExecutionResult {
            results,
            errors,
            cancelled,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            succeeded = result.count(StepStatus::Success),
            failed = result.count(StepStatus::Failed),
            skipped = result.count(StepStatus::Skipped),
            cancelled,
            "execution finished"
        );
        result
    }
}

struct SubtaskJob {
    tools: Arc<dyn ToolExecutor>,
    subtask: Subtask,
    plan: MiniPlan,
    policy: RetryPolicy,
    global: Arc<Semaphore>,
    per_run: Arc<Semaphore>,
    cancel: CancellationToken,
}

struct SubtaskOutcome {
    result: StepResult,
    errors: Vec<ExecutionError>,
}

/// Why an approach stopped.
struct ApproachFailure {
    kind: ErrorKind,
    message: String,
}

struct Approach {
    output: Vec<String>,
    attempts: u32,
    failure: Option<ApproachFailure>,
}

impl SubtaskJob {
    async fn run(self) -> SubtaskOutcome {
        let id = self.subtask.id.clone();
        let permits = tokio::select! {
            _ = self.cancel.cancelled() => None,
            p = acquire(&self.global, &self.per_run) => p,
        };
        let Some(_permits) = permits else {
            return SubtaskOutcome {
                result: StepResult::skipped(&id, "run cancelled"),
                errors: Vec::new(),
            };
        };

        let started = Instant::now();
        let mut errors = Vec::new();
        let primary = self.run_steps(&self.plan.steps, &mut errors).await;
        let mut attempts = primary.attempts;
        // A placeholder is itself the planning fallback.
        let degraded = self.plan.placeholder;

        let Some(failure) = primary.failure else {
            return SubtaskOutcome {
                result: succeeded(&id, primary.output, started, attempts, degraded),
                errors,
            };
        };

        if failure.kind == ErrorKind::Cancelled {
            let mut result = StepResult::skipped(&id, "run cancelled");
            result.attempts = attempts;
            result.duration_ms = started.elapsed().as_millis() as u64;
            return SubtaskOutcome { result, errors };
        }

        let alternative = self
            .plan
            .alternative
            .as_ref()
            .filter(|a| !a.steps.is_empty());
        let Some(alternative) = alternative else {
            warn!(subtask = %id, "subtask failed: {}", failure.message);
            return SubtaskOutcome {
                result: failed(&id, &failure.message, attempts, degraded, elapsed_ms(started)),
                errors,
            };
        };

        info!(subtask = %id, "switching to alternative: {}", alternative.description);
        let fallback = self.run_steps(&alternative.steps, &mut errors).await;
        attempts = attempts.max(fallback.attempts);

        let result = match fallback.failure {
            None => succeeded(&id, fallback.output, started, attempts, true),
            Some(f) if f.kind == ErrorKind::Cancelled => {
                let mut r = StepResult::skipped(&id, "run cancelled");
                r.attempts = attempts;
                r.used_fallback = true;
                r
            }
            Some(f) => {
                warn!(subtask = %id, "alternative failed: {}", f.message);
                failed(
                    &id,
                    &format!("{}; alternative: {}", failure.message, f.message),
                    attempts,
                    true,
                    elapsed_ms(started),
                )
            }
        };
        SubtaskOutcome { result, errors }
    }

    /// Run steps in order; the first step that exhausts its retries stops
    /// the approach.
    async fn run_steps(&self, steps: &[PlanStep], errors: &mut Vec<ExecutionError>) -> Approach {
        let mut output = Vec::with_capacity(steps.len());
        let mut attempts = 0;
        for (index, step) in steps.iter().enumerate() {
            match self.run_step(index, step, errors).await {
                Ok((text, used)) => {
                    attempts = attempts.max(used);
                    if !text.is_empty() {
                        output.push(text);
                    }
                }
                Err((failure, used)) => {
                    attempts = attempts.max(used);
                    return Approach {
                        output,
                        attempts,
                        failure: Some(failure),
                    };
                }
            }
        }
        Approach {
            output,
            attempts,
            failure: None,
        }
    }

    async fn run_step(
        &self,
        index: usize,
        step: &PlanStep,
        errors: &mut Vec<ExecutionError>,
    ) -> Result<(String, u32), (ApproachFailure, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(
                self.policy.timeout,
                self.tools.execute(&self.subtask, step),
            );
            let res = tokio::select! {
                _ = self.cancel.cancelled() => Err((ErrorKind::Cancelled, "run cancelled".to_string())),
                r = call => match r {
                    Ok(Ok(out)) => Ok(out),
                    Ok(Err(e)) => Err((classify(&e), e.to_string())),
                    Err(_) => Err((
                        ErrorKind::Timeout,
                        format!("tool timed out after {:?}", self.policy.timeout),
                    )),
                },
            };

            let (kind, message) = match res {
                Ok(out) => {
                    if !out.side_effects.is_empty() {
                        debug!(subtask = %self.subtask.id, effects = ?out.side_effects, "tool side effects");
                    }
                    return Ok((out.output, attempt));
                }
                Err(e) => e,
            };

            errors.push(ExecutionError {
                subtask_id: self.subtask.id.clone(),
                step_index: index,
                kind,
                message: message.clone(),
                attempt,
            });

            if !kind.is_retryable() || attempt >= self.policy.max_attempts {
                return Err((ApproachFailure { kind, message }, attempt));
            }

            let delay = self.policy.backoff_with_jitter(attempt);
            warn!(
                subtask = %self.subtask.id,
                step = index,
                attempt,
                %kind,
                "tool call failed, retrying in {delay:?}: {message}"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err((
                        ApproachFailure {
                            kind: ErrorKind::Cancelled,
                            message: "run cancelled".into(),
                        },
                        attempt,
                    ));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn acquire(
    global: &Arc<Semaphore>,
    per_run: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    // Per-run first, so one run cannot hoard global permits while it waits.
    let local = per_run.clone().acquire_owned().await.ok()?;
    let global = global.clone().acquire_owned().await.ok()?;
    Some((local, global))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn succeeded(id: &str, output: Vec<String>, started: Instant, attempts: u32, fallback: bool) -> StepResult {
    StepResult {
        subtask_id: id.to_string(),
        status: StepStatus::Success,
        output: output.join("\n"),
        duration_ms: elapsed_ms(started),
        attempts,
        used_fallback: fallback,
        error: None,
    }
}

fn failed(id: &str, message: &str, attempts: u32, fallback: bool, duration_ms: u64) -> StepResult {
    StepResult {
        subtask_id: id.to_string(),
        status: StepStatus::Failed,
        output: String::new(),
        duration_ms,
        attempts,
        used_fallback: fallback,
        error: Some(message.to_string()),
    }
}
