use std::sync::Arc;

use dppm_core::{DppmConfig, DppmError, RunState, StepStatus};
use dppm_db::{Database, SqliteDatabase};
use dppm_prompts::{headers, plan::subtask_header};
use dppm_runner::provider::mock::MockProvider;
use dppm_runner::provider::ModelProvider;
use dppm_runner::tool::mock::{MockOutcome, MockToolExecutor};
use dppm_runner::Orchestrator;
use tokio_util::sync::CancellationToken;

const TWEET_GOAL: &str = "Write and post a single tweet announcing a product";

const TWEET_SUBTASKS: &str = r#"
#### SUBTASK: draft
**Title:** Draft the tweet
**Domain:** writing
**Complexity:** 3
**Depends on:** none
**Description:** Write a tweet under 280 characters announcing the product.
---
#### SUBTASK: review
**Title:** Review the draft
**Domain:** writing
**Complexity:** 2
**Depends on:** draft
---
#### SUBTASK: post
**Title:** Post the tweet
**Domain:** communication
**Complexity:** 1
**Depends on:** review
---
"#;

const RESEARCH_SUBTASKS: &str = r#"
#### SUBTASK: research_a
**Title:** Research competitor pricing
**Domain:** research
**Depends on:** none
---
#### SUBTASK: research_b
**Title:** Research customer reviews
**Domain:** research
**Depends on:** none
---
#### SUBTASK: synthesize
**Title:** Write the comparison
**Domain:** writing
**Depends on:** research_a, research_b
---
"#;

const CRITIQUE: &str = r#"
#### RISK: tweet exceeds the character limit
**Subtask:** draft
**Likelihood:** 0.2
**Impact:** 0.5
**Mitigation:** count characters before review
**Strategy:** step
---
#### RISK: reviewer unavailable
**Subtask:** review
**Likelihood:** 0.1
**Impact:** 0.4
**Mitigation:** self-review with a checklist
**Strategy:** fallback
---
#### RISK: posting API rejects the request
**Subtask:** post
**Likelihood:** 0.2
**Impact:** 0.9
**Mitigation:** verify credentials first
**Strategy:** step
---
"#;

const REFLECTION: &str = "#### NOTE: draft\n**Sentiment:** positive\nDraft landed first try.\n---\n\
                          #### LESSON: Keep announcement tweets short\n";

fn mini_plan(action: &str) -> String {
    format!("#### STEP: {action}\n**Expected:** {action} finished\n**Capability:** social\n---\n")
}

fn tweet_provider() -> MockProvider {
    MockProvider::new("mock")
        .on(headers::DECOMPOSE, TWEET_SUBTASKS)
        .on(headers::CRITIQUE, CRITIQUE)
        .on(headers::REFLECT, REFLECTION)
        .on(&subtask_header("draft"), &mini_plan("write draft"))
        .on(&subtask_header("review"), &mini_plan("review draft"))
        .on(&subtask_header("post"), &mini_plan("publish tweet"))
}

fn research_provider() -> MockProvider {
    MockProvider::new("mock")
        .on(headers::DECOMPOSE, RESEARCH_SUBTASKS)
        .on(&subtask_header("research_a"), &mini_plan("search pricing pages"))
        .on(&subtask_header("research_b"), &mini_plan("read reviews"))
        .on(&subtask_header("synthesize"), &mini_plan("write comparison"))
}

fn fast_config() -> DppmConfig {
    DppmConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..Default::default()
    }
}

struct Harness {
    orchestrator: Orchestrator,
    provider: Arc<MockProvider>,
    tools: Arc<MockToolExecutor>,
    db: Arc<dyn Database>,
}

fn harness(provider: MockProvider, tools: MockToolExecutor) -> Harness {
    let provider = Arc::new(provider);
    let tools = Arc::new(tools);
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
    let providers: Vec<Arc<dyn ModelProvider>> = vec![provider.clone()];
    let orchestrator = Orchestrator::new(providers, tools.clone(), db.clone());
    Harness {
        orchestrator,
        provider,
        tools,
        db,
    }
}

fn prompts_with(provider: &MockProvider, marker: &str) -> usize {
    provider
        .prompts()
        .iter()
        .filter(|p| p.contains(marker))
        .count()
}

#[tokio::test]
async fn linear_goal_runs_in_three_phases() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let result = h
        .orchestrator
        .run_dppm(TWEET_GOAL, "alice", &fast_config())
        .await
        .unwrap();

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.plan.phases.len(), 3);
    let order: Vec<&str> = result
        .plan
        .phases
        .iter()
        .map(|p| p.subtask_ids[0].as_str())
        .collect();
    assert_eq!(order, vec!["draft", "review", "post"]);
    assert_eq!(result.plan.critical_path, vec!["draft", "review", "post"]);

    let pre_flight = result.pre_flight.as_ref().unwrap();
    assert_eq!(pre_flight.risks.len(), 3);
    assert_eq!(pre_flight.applied_count(), 0);

    assert_eq!(result.execution_result.count(StepStatus::Success), 3);
    let calls: Vec<String> = h.tools.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls, vec!["draft", "review", "post"]);

    let reflection = &result.post_reflection;
    assert!(reflection.overall_success);
    assert!(!reflection.defaulted);
    assert_eq!(reflection.notes.len(), 3);
    assert_eq!(reflection.lessons, vec!["Keep announcement tweets short"]);

    assert!(result.workflow_id.is_some());
    assert!(!result.reused_workflow);

    let run = h.db.get_run(&result.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert!(h.orchestrator.active_runs().is_empty());
}

#[tokio::test]
async fn independent_subtasks_share_a_phase() {
    let h = harness(research_provider(), MockToolExecutor::new());
    let result = h
        .orchestrator
        .run_dppm("Compare our pricing with competitors", "alice", &fast_config())
        .await
        .unwrap();

    assert_eq!(result.plan.phases.len(), 2);
    assert_eq!(result.plan.phases[0].subtask_ids, vec!["research_a", "research_b"]);
    assert_eq!(result.plan.phases[1].subtask_ids, vec!["synthesize"]);

    let calls: Vec<String> = h.tools.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls.last().map(String::as_str), Some("synthesize"));

    // No critique or reflection replies are scripted: both degrade quietly.
    assert!(result.pre_flight.is_none());
    assert!(result.post_reflection.defaulted);
    assert_eq!(result.state, RunState::Completed);
}

#[tokio::test]
async fn step_recovers_after_two_timeouts() {
    let tools = MockToolExecutor::new().script(
        "post",
        vec![
            MockOutcome::Timeout,
            MockOutcome::Timeout,
            MockOutcome::Ok("tweet posted".into()),
        ],
    );
    let h = harness(tweet_provider(), tools);
    let config = DppmConfig {
        skip_pre_flight: true,
        ..fast_config()
    };
    let result = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    let post = result.execution_result.result("post").unwrap();
    assert_eq!(post.status, StepStatus::Success);
    assert_eq!(post.attempts, 3);
    assert!(!post.used_fallback);
    assert_eq!(post.output, "tweet posted");
    assert_eq!(result.state, RunState::Completed);
    assert!(result.pre_flight.is_none());
}

#[tokio::test]
async fn exhausted_subtask_skips_dependents_and_saves_no_workflow() {
    let tools = MockToolExecutor::new().script(
        "draft",
        vec![
            MockOutcome::Transient("service unavailable".into()),
            MockOutcome::Transient("service unavailable".into()),
            MockOutcome::Transient("service unavailable".into()),
        ],
    );
    let h = harness(tweet_provider(), tools);
    let config = DppmConfig {
        skip_pre_flight: true,
        ..fast_config()
    };
    let result = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    let exec = &result.execution_result;
    assert_eq!(exec.result("draft").unwrap().status, StepStatus::Failed);
    assert_eq!(exec.result("review").unwrap().status, StepStatus::Skipped);
    assert_eq!(exec.result("post").unwrap().status, StepStatus::Skipped);
    assert_eq!(h.tools.calls_for("post"), 0);

    assert!(!result.post_reflection.overall_success);
    assert!(!result.post_reflection.workflow_candidate);
    assert!(result.workflow_id.is_none());
    assert_eq!(result.state, RunState::PartialSuccess);

    assert!(h.db.list_workflows("alice", true).await.unwrap().is_empty());
    // The failed run is still remembered.
    assert_eq!(h.db.list_experiences("alice", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn identical_goal_reuses_saved_workflow() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let config = fast_config();

    let first = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();
    let workflow_id = first.workflow_id.clone().unwrap();
    let plan_prompts = prompts_with(&h.provider, headers::PLAN);

    let second = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();
    assert!(second.reused_workflow);
    assert_eq!(second.workflow_id.as_deref(), Some(workflow_id.as_str()));
    assert!(second.pre_flight.is_none());
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.plan.subtasks, first.plan.subtasks);

    assert_eq!(prompts_with(&h.provider, headers::DECOMPOSE), 1);
    assert_eq!(prompts_with(&h.provider, headers::PLAN), plan_prompts);
    assert_eq!(h.tools.calls_for("post"), 2);

    let workflows = h.db.list_workflows("alice", false).await.unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].total_uses, 1);
    assert_eq!(workflows[0].success_count, 1);
    assert_eq!(h.db.list_experiences("alice", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn workflows_are_scoped_to_their_owner() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let config = fast_config();
    h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    let bob = h.orchestrator.run_dppm(TWEET_GOAL, "bob", &config).await.unwrap();
    assert!(!bob.reused_workflow);
    assert_eq!(prompts_with(&h.provider, headers::DECOMPOSE), 2);
}

#[tokio::test]
async fn past_lessons_reach_the_decomposer() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let config = DppmConfig {
        reuse_workflows: false,
        ..fast_config()
    };
    h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();
    h.orchestrator
        .run_dppm("Write and post a tweet announcing a product launch", "alice", &config)
        .await
        .unwrap();

    let decompose_prompts: Vec<String> = h
        .provider
        .prompts()
        .into_iter()
        .filter(|p| p.contains(headers::DECOMPOSE))
        .collect();
    assert_eq!(decompose_prompts.len(), 2);
    assert!(!decompose_prompts[0].contains("Keep announcement tweets short"));
    assert!(decompose_prompts[1].contains("Keep announcement tweets short"));
}

#[tokio::test]
async fn unparsable_decomposition_fails_the_run() {
    let provider = MockProvider::new("mock").on(headers::DECOMPOSE, "Sure! Here is a plan.");
    let h = harness(provider, MockToolExecutor::new());
    let err = h
        .orchestrator
        .run_dppm(TWEET_GOAL, "alice", &fast_config())
        .await
        .unwrap_err();
    assert!(matches!(err, DppmError::Decomposition(_)));
    assert!(h.tools.calls().is_empty());

    let runs = h.db.list_runs("alice").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Failed);
}

#[tokio::test]
async fn planning_failure_substitutes_placeholder() {
    let provider = MockProvider::new("mock")
        .on(headers::DECOMPOSE, TWEET_SUBTASKS)
        .fail_on(&subtask_header("review"), "model overloaded")
        .on(&subtask_header("draft"), &mini_plan("write draft"))
        .on(&subtask_header("post"), &mini_plan("publish tweet"));
    let h = harness(provider, MockToolExecutor::new());
    let config = DppmConfig {
        skip_pre_flight: true,
        ..fast_config()
    };
    let result = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    let review = result.plan.mini_plan("review").unwrap();
    assert!(review.placeholder);
    // The placeholder still executes, so the chain completes.
    assert_eq!(result.plan.phases.len(), 3);
    assert_eq!(h.tools.calls_for("review"), 1);
    assert_eq!(h.tools.calls_for("post"), 1);
}

#[tokio::test]
async fn failed_planning_is_never_cached() {
    let provider = MockProvider::new("mock")
        .on(headers::DECOMPOSE, TWEET_SUBTASKS)
        .on(headers::REFLECT, REFLECTION)
        .fail_on(&subtask_header("draft"), "model overloaded")
        .fail_on(&subtask_header("review"), "model overloaded")
        .fail_on(&subtask_header("post"), "model overloaded");
    let h = harness(provider, MockToolExecutor::new());
    let config = DppmConfig {
        skip_pre_flight: true,
        ..fast_config()
    };
    let result = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    assert_eq!(result.plan.placeholder_ids().len(), 3);
    assert_eq!(result.execution_result.fallbacks_used(), 3);
    assert_eq!(result.post_reflection.fallbacks_used, 3);
    assert!(!result.post_reflection.workflow_candidate);
    assert!(result.workflow_id.is_none());
    assert!(h.db.list_workflows("alice", true).await.unwrap().is_empty());

    // Nothing was cached, so the same goal is decomposed again.
    let again = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();
    assert!(!again.reused_workflow);
    assert_eq!(prompts_with(&h.provider, headers::DECOMPOSE), 2);
}

#[tokio::test]
async fn skip_flags_bypass_both_reflections() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let config = DppmConfig {
        skip_pre_flight: true,
        skip_post_reflection: true,
        ..fast_config()
    };
    let result = h.orchestrator.run_dppm(TWEET_GOAL, "alice", &config).await.unwrap();

    assert!(result.pre_flight.is_none());
    assert!(result.post_reflection.defaulted);
    assert!(result.post_reflection.overall_success);
    assert_eq!(prompts_with(&h.provider, headers::CRITIQUE), 0);
    assert_eq!(prompts_with(&h.provider, headers::REFLECT), 0);
}

#[tokio::test]
async fn cancelled_before_execution() {
    let h = harness(tweet_provider(), MockToolExecutor::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .orchestrator
        .run_dppm_with_token(TWEET_GOAL, "alice", &fast_config(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DppmError::Cancelled));
    assert!(h.tools.calls().is_empty());

    let runs = h.db.list_runs("alice").await.unwrap();
    assert_eq!(runs[0].state, RunState::Cancelled);
    assert!(h.orchestrator.active_runs().is_empty());
}

#[tokio::test]
async fn cancelling_mid_execution_keeps_finished_results() {
    let tools = MockToolExecutor::new().script("review", vec![MockOutcome::Hang]);
    let h = Arc::new(harness(tweet_provider(), tools));
    let config = DppmConfig {
        skip_pre_flight: true,
        skip_post_reflection: true,
        ..fast_config()
    };

    let runner = h.clone();
    let task = tokio::spawn(async move {
        runner
            .orchestrator
            .run_dppm(TWEET_GOAL, "alice", &config)
            .await
    });

    // Wait until the hanging step has started, then cancel through the tracker.
    let run_id = loop {
        if h.tools.calls_for("review") > 0 {
            let active = h.orchestrator.active_runs();
            break active[0].run_id.clone();
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    };
    assert!(h.orchestrator.cancel(&run_id));

    let result = task.await.unwrap().unwrap();
    let exec = &result.execution_result;
    assert!(exec.cancelled);
    assert_eq!(exec.result("draft").unwrap().status, StepStatus::Success);
    assert_ne!(exec.result("post").unwrap().status, StepStatus::Success);
    assert_eq!(h.tools.calls_for("post"), 0);
    assert_eq!(result.state, RunState::PartialSuccess);
    assert!(result.workflow_id.is_none());
}
