use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dppm_core::{
    Domain, DppmConfig, DppmError, DppmResult, ExecutionResult, MergedPlan, NewExperience,
    PostExecutionReflection, PreFlightReport, RunState, Workflow,
};
use dppm_db::Database;
use dppm_prompts::{CritiqueStrategy, ExperienceHint, PromptContext};

use crate::bridge::ExecutionBridge;
use crate::decomposer::TaskDecomposer;
use crate::experience::{ExperienceStore, SimilarityStrategy};
use crate::merger::PlanMerger;
use crate::planner::ParallelPlanner;
use crate::provider::ModelProvider;
use crate::reflector::PostExecutionReflector;
use crate::risk::RiskReflector;
use crate::router::ModelRouter;
use crate::run_tracker::{ActiveRun, ActiveRunSnapshot, RunTracker};
use crate::tool::ToolExecutor;

/// Default cap on subtasks executing at once across all runs.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 16;

/// Drives one goal through decompose, plan, merge, pre-flight, execute and
/// reflect, and records what it learned.
///
/// One orchestrator serves many concurrent runs; the router history, the
/// global execution cap and the run tracker are shared between them.
pub struct Orchestrator {
    router: Arc<ModelRouter>,
    tools: Arc<dyn ToolExecutor>,
    db: Arc<dyn Database>,
    decomposer: TaskDecomposer,
    planner: ParallelPlanner,
    merger: PlanMerger,
    risk: RiskReflector,
    bridge: ExecutionBridge,
    reflector: PostExecutionReflector,
    experiences: ExperienceStore,
    tracker: Mutex<RunTracker>,
}

/// Current state of one run, as the orchestrator sees it.
struct RunHandle {
    id: String,
    state: RunState,
}

impl Orchestrator {
    pub fn new(
        providers: Vec<Arc<dyn ModelProvider>>,
        tools: Arc<dyn ToolExecutor>,
        db: Arc<dyn Database>,
    ) -> Self {
        Self::with_router(ModelRouter::new(providers), tools, db)
    }

    /// Build around a preconfigured router, e.g. one with preferences set.
    pub fn with_router(
        router: ModelRouter,
        tools: Arc<dyn ToolExecutor>,
        db: Arc<dyn Database>,
    ) -> Self {
        let router = Arc::new(router);
        Self {
            decomposer: TaskDecomposer::new(router.clone()),
            planner: ParallelPlanner::new(router.clone()),
            merger: PlanMerger,
            risk: RiskReflector::new(router.clone()).with_default_critics(),
            bridge: ExecutionBridge::new(
                tools.clone(),
                Arc::new(Semaphore::new(DEFAULT_GLOBAL_CONCURRENCY)),
            ),
            reflector: PostExecutionReflector::new(router.clone()),
            experiences: ExperienceStore::new(db.clone()),
            tracker: Mutex::new(RunTracker::new()),
            router,
            tools,
            db,
        }
    }

    pub fn with_global_concurrency(mut self, permits: usize) -> Self {
        self.bridge = ExecutionBridge::new(self.tools.clone(), Arc::new(Semaphore::new(permits.max(1))));
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityStrategy>) -> Self {
        self.experiences = self.experiences.with_similarity(similarity);
        self
    }

    pub fn with_critic(mut self, domain: Domain, critic: Arc<dyn CritiqueStrategy>) -> Self {
        self.risk = self.risk.with_critic(domain, critic);
        self
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn experiences(&self) -> &ExperienceStore {
        &self.experiences
    }

    pub fn active_runs(&self) -> Vec<ActiveRunSnapshot> {
        self.tracker().snapshot()
    }

    /// Cancel an in-flight run. Returns false if no such run is active.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.tracker().cancel(run_id)
    }

    fn tracker(&self) -> MutexGuard<'_, RunTracker> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn run_dppm(
        &self,
        goal: &str,
        owner: &str,
        config: &DppmConfig,
    ) -> Result<DppmResult, DppmError> {
        self.run_dppm_with_token(goal, owner, config, CancellationToken::new())
            .await
    }

    /// Like [`run_dppm`](Self::run_dppm), cancellable through `cancel` as
    /// well as through [`cancel`](Self::cancel).
    pub async fn run_dppm_with_token(
        &self,
        goal: &str,
        owner: &str,
        config: &DppmConfig,
        cancel: CancellationToken,
    ) -> Result<DppmResult, DppmError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(DppmError::InvalidInput("goal is empty".into()));
        }
        if owner.trim().is_empty() {
            return Err(DppmError::InvalidInput("owner is empty".into()));
        }
        config.validate()?;

        let record = self.db.create_run(owner, goal).await?;
        let mut run = RunHandle {
            id: record.id,
            state: record.state,
        };
        self.tracker().insert(ActiveRun {
            run_id: run.id.clone(),
            owner: owner.to_string(),
            goal: goal.to_string(),
            state: run.state,
            started_at: Instant::now(),
            cancel: cancel.clone(),
        });
        info!(run_id = %run.id, owner, "run started: {goal}");

        let outcome = self.drive(&mut run, goal, owner, config, &cancel).await;
        match &outcome {
            Ok(result) => {
                info!(run_id = %run.id, state = %result.state, "run finished");
            }
            Err(e) => {
                let terminal = match e {
                    DppmError::Cancelled => RunState::Cancelled,
                    _ => RunState::Failed,
                };
                error!(run_id = %run.id, "run aborted: {e}");
                self.transition(&mut run, terminal, Some(&e.to_string())).await;
            }
        }
        self.tracker().remove(&run.id);
        outcome
    }

    async fn drive(
        &self,
        run: &mut RunHandle,
        goal: &str,
        owner: &str,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<DppmResult, DppmError> {
        if config.reuse_workflows {
            match self
                .experiences
                .retrieve_workflow(owner, goal, config.workflow_match_threshold)
                .await
            {
                Ok(Some(workflow)) => {
                    return self
                        .run_workflow(run, workflow, goal, owner, config, cancel)
                        .await
                }
                Ok(None) => {}
                Err(e) => warn!(run_id = %run.id, "workflow lookup failed: {e}"),
            }
        }

        let hints = match self
            .experiences
            .retrieve_relevant_experiences(
                owner,
                goal,
                config.experience_match_threshold,
                config.experience_limit,
            )
            .await
        {
            Ok(found) => found
                .into_iter()
                .map(|e| ExperienceHint {
                    goal: e.goal,
                    succeeded: e.reflection.overall_success,
                    lessons: e.reflection.lessons,
                })
                .collect(),
            Err(e) => {
                warn!(run_id = %run.id, "experience lookup failed: {e}");
                Vec::new()
            }
        };
        let ctx = PromptContext::new(goal).with_experiences(hints);

        // 1. Decompose
        let subtasks = self.decomposer.decompose(&ctx, config, cancel).await?;

        // 2. Plan each subtask
        self.transition(run, RunState::Planning, None).await;
        let planning = self.planner.plan_all(&ctx, &subtasks, config, cancel).await?;
        for e in &planning.errors {
            warn!(run_id = %run.id, "{e}");
        }

        // 3. Merge
        self.transition(run, RunState::Merging, None).await;
        let mut plan = self.merger.merge(goal, &subtasks, planning.plans)?;

        // 4. Pre-flight critique
        let pre_flight = if config.skip_pre_flight {
            None
        } else {
            self.transition(run, RunState::PreFlight, None).await;
            match self.risk.review(&ctx, &mut plan, config, cancel).await {
                Ok(report) => Some(report),
                Err(DppmError::Cancelled) => return Err(DppmError::Cancelled),
                Err(e) => {
                    warn!(run_id = %run.id, "pre-flight skipped: {e}");
                    None
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(DppmError::Cancelled);
        }

        // 5. Execute and reflect
        self.transition(run, RunState::Executing, None).await;
        let execution = self.bridge.execute(&plan, config, cancel).await;
        self.transition(run, RunState::Reflecting, None).await;
        let reflection = self
            .reflector
            .reflect(&ctx, &plan, &execution, config, cancel)
            .await;

        // 6. Remember
        let experience_id = self
            .store_experience(run, owner, goal, &plan, &execution, &reflection)
            .await;
        let workflow_id = match (&experience_id, reflection.workflow_candidate) {
            (Some(exp), true) => self.save_workflow(run, exp).await,
            _ => None,
        };

        Ok(self
            .finish(run, plan, pre_flight, execution, reflection, workflow_id, false)
            .await)
    }

    /// Skip straight to execution with a cached plan.
    async fn run_workflow(
        &self,
        run: &mut RunHandle,
        workflow: Workflow,
        goal: &str,
        owner: &str,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> Result<DppmResult, DppmError> {
        info!(
            run_id = %run.id,
            workflow = %workflow.id,
            uses = workflow.total_uses,
            "reusing workflow"
        );
        let plan = workflow.plan.retarget(goal);
        let ctx = PromptContext::new(goal);

        self.transition(run, RunState::Executing, None).await;
        let execution = self.bridge.execute(&plan, config, cancel).await;
        self.transition(run, RunState::Reflecting, None).await;
        let reflection = self
            .reflector
            .reflect(&ctx, &plan, &execution, config, cancel)
            .await;

        if let Err(e) = self
            .experiences
            .record_workflow_use(
                &workflow.id,
                reflection.overall_success,
                config.retire_min_uses,
                config.retire_threshold,
            )
            .await
        {
            error!(run_id = %run.id, workflow = %workflow.id, "failed to record workflow use: {e}");
        }
        self.store_experience(run, owner, goal, &plan, &execution, &reflection)
            .await;

        Ok(self
            .finish(run, plan, None, execution, reflection, Some(workflow.id), true)
            .await)
    }

    async fn store_experience(
        &self,
        run: &RunHandle,
        owner: &str,
        goal: &str,
        plan: &MergedPlan,
        execution: &ExecutionResult,
        reflection: &PostExecutionReflection,
    ) -> Option<dppm_core::Experience> {
        let input = NewExperience {
            owner: owner.to_string(),
            goal: goal.to_string(),
            plan: plan.clone(),
            result: execution.clone(),
            reflection: reflection.clone(),
        };
        match self.experiences.store_experience(&input).await {
            Ok(exp) => Some(exp),
            Err(e) => {
                error!(run_id = %run.id, "failed to store experience: {e}");
                None
            }
        }
    }

    async fn save_workflow(&self, run: &RunHandle, exp: &dppm_core::Experience) -> Option<String> {
        match self.experiences.save_workflow(exp).await {
            Ok(wf) => wf.map(|wf| wf.id),
            Err(e) => {
                error!(run_id = %run.id, "failed to save workflow: {e}");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &mut RunHandle,
        plan: MergedPlan,
        pre_flight: Option<PreFlightReport>,
        execution: ExecutionResult,
        reflection: PostExecutionReflection,
        workflow_id: Option<String>,
        reused_workflow: bool,
    ) -> DppmResult {
        let terminal = if reflection.overall_success {
            RunState::Completed
        } else {
            RunState::PartialSuccess
        };
        let note = execution.cancelled.then_some("execution cancelled");
        self.transition(run, terminal, note).await;

        DppmResult {
            run_id: run.id.clone(),
            state: terminal,
            plan,
            pre_flight,
            execution_result: execution,
            post_reflection: reflection,
            workflow_id,
            reused_workflow,
        }
    }

    /// Move the run to `next`, updating the tracker and the run record.
    /// Storage failures are logged; illegal transitions are refused.
    async fn transition(&self, run: &mut RunHandle, next: RunState, error_message: Option<&str>) {
        if !run.state.can_transition_to(next) {
            warn!(run_id = %run.id, from = %run.state, to = %next, "illegal run state transition");
            return;
        }
        run.state = next;
        self.tracker().set_state(&run.id, next);
        if let Err(e) = self.db.update_run_state(&run.id, next, error_message).await {
            warn!(run_id = %run.id, state = %next, "failed to record run state: {e}");
        }
        info!(run_id = %run.id, state = %next, "run state");
    }
}
