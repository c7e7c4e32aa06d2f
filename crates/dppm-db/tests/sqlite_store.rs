// Exercises every Database trait method against the SQLite backend.

use std::sync::Arc;

use dppm_core::{
    CreateWorkflow, Domain, ExecutionPhase, ExecutionResult, MergedPlan, MiniPlan, NewExperience,
    PlanStep, PostExecutionReflection, RunState, StepResult, StepStatus, Subtask, WorkflowStatus,
};
use dppm_db::{Database, DbError, SqliteDatabase};

fn make_db() -> Arc<dyn Database> {
    Arc::new(SqliteDatabase::open_in_memory().unwrap())
}

fn plan(goal: &str) -> MergedPlan {
    MergedPlan {
        goal: goal.into(),
        subtasks: vec![Subtask {
            id: "draft".into(),
            title: "Draft".into(),
            description: "Draft the tweet".into(),
            domain: Domain::Writing,
            depends_on: vec![],
            complexity: 2,
            optional: false,
        }],
        mini_plans: vec![MiniPlan {
            subtask_id: "draft".into(),
            steps: vec![PlanStep::new("write draft", "draft text").with_capability("text")],
            tools: vec!["editor".into()],
            risks: vec![],
            alternative: None,
            placeholder: false,
            provider: Some("mock".into()),
        }],
        phases: vec![ExecutionPhase {
            index: 0,
            subtask_ids: vec!["draft".into()],
        }],
        tools: vec!["editor".into()],
        risks: vec![],
        total_estimated_secs: 120,
        critical_path: vec!["draft".into()],
    }
}

fn new_experience(owner: &str, goal: &str) -> NewExperience {
    NewExperience {
        owner: owner.into(),
        goal: goal.into(),
        plan: plan(goal),
        result: ExecutionResult {
            results: vec![StepResult {
                subtask_id: "draft".into(),
                status: StepStatus::Success,
                output: "done".into(),
                duration_ms: 12,
                attempts: 1,
                used_fallback: false,
                error: None,
            }],
            errors: vec![],
            cancelled: false,
            duration_ms: 12,
        },
        reflection: PostExecutionReflection {
            notes: vec![],
            lessons: vec!["keep it short".into()],
            overall_success: true,
            workflow_candidate: true,
            success_rate: 1.0,
            fallbacks_used: 0,
            defaulted: false,
        },
    }
}

#[tokio::test]
async fn experience_roundtrip() {
    let db = make_db();
    let input = new_experience("alice", "Post a launch tweet");
    let created = db.create_experience(&input).await.unwrap();
    assert_eq!(created.owner, "alice");
    assert_eq!(created.plan, input.plan);
    assert_eq!(created.result, input.result);
    assert_eq!(created.reflection.lessons, vec!["keep it short".to_string()]);

    let fetched = db.get_experience(&created.id).await.unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn experiences_are_owner_scoped() {
    let db = make_db();
    db.create_experience(&new_experience("alice", "a1")).await.unwrap();
    db.create_experience(&new_experience("alice", "a2")).await.unwrap();
    db.create_experience(&new_experience("bob", "b1")).await.unwrap();

    let alice = db.list_experiences("alice", 10).await.unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice.iter().all(|e| e.owner == "alice"));

    let limited = db.list_experiences("alice", 1).await.unwrap();
    assert_eq!(limited.len(), 1);

    assert!(db.list_experiences("carol", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_rows_are_not_found() {
    let db = make_db();
    assert!(matches!(
        db.get_experience("nope").await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(db.get_workflow("nope").await, Err(DbError::NotFound(_))));
    assert!(matches!(db.get_run("nope").await, Err(DbError::NotFound(_))));
    assert!(matches!(
        db.increment_workflow_stats("nope", true).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        db.update_run_state("nope", RunState::Planning, None).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn workflow_counters_and_retirement() {
    let db = make_db();
    let exp = db
        .create_experience(&new_experience("alice", "Post a launch tweet"))
        .await
        .unwrap();
    let wf = db
        .create_workflow(&CreateWorkflow {
            owner: "alice".into(),
            goal: "Post a launch tweet".into(),
            plan: plan("Post a launch tweet"),
            source_experience_id: Some(exp.id.clone()),
        })
        .await
        .unwrap();
    assert_eq!(wf.total_uses, 0);
    assert_eq!(wf.success_count, 0);
    assert_eq!(wf.status, WorkflowStatus::Active);
    assert_eq!(wf.source_experience_id.as_deref(), Some(exp.id.as_str()));

    let wf = db.increment_workflow_stats(&wf.id, true).await.unwrap();
    assert_eq!((wf.success_count, wf.total_uses), (1, 1));
    let wf = db.increment_workflow_stats(&wf.id, false).await.unwrap();
    assert_eq!((wf.success_count, wf.total_uses), (1, 2));

    // Below the minimum number of uses nothing is retired.
    assert!(!db.retire_workflow_if_degraded(&wf.id, 3, 0.5).await.unwrap());

    let wf = db.increment_workflow_stats(&wf.id, false).await.unwrap();
    assert_eq!((wf.success_count, wf.total_uses), (1, 3));
    assert!(db.retire_workflow_if_degraded(&wf.id, 3, 0.5).await.unwrap());
    // Already retired.
    assert!(!db.retire_workflow_if_degraded(&wf.id, 3, 0.5).await.unwrap());

    let wf = db.get_workflow(&wf.id).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Retired);
    assert!(db.list_workflows("alice", false).await.unwrap().is_empty());
    assert_eq!(db.list_workflows("alice", true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn healthy_workflow_stays_active() {
    let db = make_db();
    let wf = db
        .create_workflow(&CreateWorkflow {
            owner: "alice".into(),
            goal: "g".into(),
            plan: plan("g"),
            source_experience_id: None,
        })
        .await
        .unwrap();
    for success in [true, true, false, true] {
        db.increment_workflow_stats(&wf.id, success).await.unwrap();
    }
    assert!(!db.retire_workflow_if_degraded(&wf.id, 3, 0.5).await.unwrap());
    let wf = db.get_workflow(&wf.id).await.unwrap();
    assert!(wf.is_active());
    assert!((wf.success_rate() - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
    let db = make_db();
    let wf = db
        .create_workflow(&CreateWorkflow {
            owner: "alice".into(),
            goal: "g".into(),
            plan: plan("g"),
            source_experience_id: None,
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let db = db.clone();
        let id = wf.id.clone();
        handles.push(tokio::spawn(async move {
            db.increment_workflow_stats(&id, i % 2 == 0).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let wf = db.get_workflow(&wf.id).await.unwrap();
    assert_eq!(wf.total_uses, 20);
    assert_eq!(wf.success_count, 10);
}

#[tokio::test]
async fn run_record_lifecycle() {
    let db = make_db();
    let run = db.create_run("alice", "Post a tweet").await.unwrap();
    assert_eq!(run.state, RunState::Decomposing);
    assert!(run.error_message.is_none());

    let run = db
        .update_run_state(&run.id, RunState::Planning, None)
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Planning);

    let run = db
        .update_run_state(&run.id, RunState::Failed, Some("cycle detected"))
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_message.as_deref(), Some("cycle detected"));
    assert!(run.updated_at >= run.created_at);

    let runs = db.list_runs("alice").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run.id);
}

#[tokio::test]
async fn file_backed_database_persists() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("dppm.db");
    let id = {
        let db = SqliteDatabase::open_path(&path).unwrap();
        db.create_experience(&new_experience("alice", "persist me"))
            .await
            .unwrap()
            .id
    };
    let db = SqliteDatabase::open_path(&path).unwrap();
    let exp = db.get_experience(&id).await.unwrap();
    assert_eq!(exp.goal, "persist me");
}
