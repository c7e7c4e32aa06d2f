use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dppm_core::{DppmConfig, DppmError, MiniPlan, Subtask};
use dppm_prompts::{plan, PromptContext};

use crate::plan_parser;
use crate::router::{ModelRouter, RouterError};

/// Mini-plans for every subtask plus the planning failures that were
/// papered over with placeholders.
#[derive(Debug)]
pub struct PlanningOutcome {
    /// In subtask declaration order.
    pub plans: Vec<MiniPlan>,
    pub errors: Vec<DppmError>,
}

/// Generates one mini-plan per subtask, concurrently.
pub struct ParallelPlanner {
    router: Arc<ModelRouter>,
}

impl ParallelPlanner {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    /// Plan every subtask. A failed subtask gets a placeholder plan; only
    /// cancellation fails the batch.
    pub async fn plan_all(
        &self,
        ctx: &PromptContext,
        subtasks: &[Subtask],
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<PlanningOutcome, DppmError> {
        let cap = subtasks.len().min(config.max_planning_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let siblings = Arc::new(subtasks.to_vec());
        let timeout = config.model_timeout();
        debug!(subtasks = subtasks.len(), cap, "planning in parallel");

        let mut set = JoinSet::new();
        for (idx, subtask) in subtasks.iter().enumerate() {
            let prompt = plan::build(ctx, subtask, &siblings);
            let router = self.router.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let subtask_id = subtask.id.clone();
            let category = subtask.domain.as_str();

            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (idx, Err(DppmError::Cancelled)),
                };
                let res = match router.invoke(category, &prompt, timeout, &cancel).await {
                    Ok(resp) => plan_parser::parse_mini_plan(&subtask_id, &resp.text)
                        .map(|mut p| {
                            p.provider = Some(resp.provider);
                            p
                        })
                        .map_err(|message| DppmError::Planning {
                            subtask_id: subtask_id.clone(),
                            message,
                        }),
                    Err(RouterError::Cancelled) => Err(DppmError::Cancelled),
                    Err(e) => Err(DppmError::Planning {
                        subtask_id: subtask_id.clone(),
                        message: e.to_string(),
                    }),
                };
                (idx, res)
            });
        }

        let mut slots: Vec<Option<MiniPlan>> = vec![None; subtasks.len()];
        let mut errors = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(plan))) => slots[idx] = Some(plan),
                Ok((_, Err(DppmError::Cancelled))) => cancelled = true,
                Ok((idx, Err(e))) => {
                    warn!(subtask = %subtasks[idx].id, "planning failed, using placeholder: {e}");
                    slots[idx] = Some(MiniPlan::placeholder(&subtasks[idx].id, &e.to_string()));
                    errors.push(e);
                }
                Err(e) => warn!("planning task panicked: {e}"),
            }
        }

        if cancelled || cancel.is_cancelled() {
            return Err(DppmError::Cancelled);
        }

        let plans: Vec<MiniPlan> = slots
            .into_iter()
            .zip(subtasks)
            .map(|(slot, subtask)| {
                slot.unwrap_or_else(|| {
                    errors.push(DppmError::Planning {
                        subtask_id: subtask.id.clone(),
                        message: "planning task did not complete".into(),
                    });
                    MiniPlan::placeholder(&subtask.id, "planning task did not complete")
                })
            })
            .collect();

        Ok(PlanningOutcome { plans, errors })
    }
}
