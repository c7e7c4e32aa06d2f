use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dppm_core::{
    DppmConfig, ExecutionResult, MergedPlan, PostExecutionReflection, ReflectionNote, Sentiment,
    StepResult, StepStatus,
};
use dppm_prompts::{markers, reflect, PromptContext};

use crate::router::{self, ModelRouter};

/// Success figures computed from the execution result alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeSummary {
    pub overall_success: bool,
    pub success_rate: f64,
    pub fallbacks_used: usize,
    pub workflow_candidate: bool,
}

/// Success is judged over the non-optional subtasks only.
pub fn summarize(plan: &MergedPlan, result: &ExecutionResult, config: &DppmConfig) -> OutcomeSummary {
    let required: Vec<&str> = plan
        .subtasks
        .iter()
        .filter(|s| !s.optional)
        .map(|s| s.id.as_str())
        .collect();
    let succeeded = required
        .iter()
        .filter(|id| result.result(id).is_some_and(StepResult::is_success))
        .count();

    let overall_success = succeeded == required.len();
    let success_rate = if required.is_empty() {
        1.0
    } else {
        succeeded as f64 / required.len() as f64
    };
    let fallbacks_used = result.fallbacks_used();
    // A plan with placeholders is not worth caching however it went.
    let workflow_candidate = overall_success
        && success_rate >= config.workflow_success_threshold
        && fallbacks_used <= config.max_fallbacks_for_workflow
        && plan.placeholder_ids().is_empty();

    OutcomeSummary {
        overall_success,
        success_rate,
        fallbacks_used,
        workflow_candidate,
    }
}

/// Compares outcomes against expectations and distils lessons.
pub struct PostExecutionReflector {
    router: Arc<ModelRouter>,
}

impl PostExecutionReflector {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    /// Never fails. Without a usable model answer the reflection is built
    /// locally and flagged `defaulted`.
    pub async fn reflect(
        &self,
        ctx: &PromptContext,
        plan: &MergedPlan,
        result: &ExecutionResult,
        config: &DppmConfig,
        cancel: &CancellationToken,
    ) -> PostExecutionReflection {
        let summary = summarize(plan, result, config);
        if config.skip_post_reflection {
            return default_reflection(plan, result, summary);
        }

        let prompt = reflect::build(ctx, plan, result);
        let text = match self
            .router
            .invoke(router::REFLECT, &prompt, config.model_timeout(), cancel)
            .await
        {
            Ok(resp) => resp.text,
            Err(e) => {
                warn!("reflection call failed, using default: {e}");
                return default_reflection(plan, result, summary);
            }
        };

        let (mut notes, lessons) = parse_reflection(&text);
        notes.retain(|n| plan.subtask(&n.subtask_id).is_some());
        if notes.is_empty() && lessons.is_empty() {
            warn!("reflection response had no notes or lessons, using default");
            return default_reflection(plan, result, summary);
        }

        // Fill in notes the model skipped, keeping subtask order.
        let notes = plan
            .subtasks
            .iter()
            .map(|s| {
                notes
                    .iter()
                    .find(|n| n.subtask_id == s.id)
                    .cloned()
                    .unwrap_or_else(|| status_note(&s.id, result.result(&s.id)))
            })
            .collect();

        info!(
            overall_success = summary.overall_success,
            candidate = summary.workflow_candidate,
            lessons = lessons.len(),
            "reflection done"
        );
        PostExecutionReflection {
            notes,
            lessons,
            overall_success: summary.overall_success,
            workflow_candidate: summary.workflow_candidate,
            success_rate: summary.success_rate,
            fallbacks_used: summary.fallbacks_used,
            defaulted: false,
        }
    }
}

/// Neutral notes, no lessons.
pub fn default_reflection(
    plan: &MergedPlan,
    result: &ExecutionResult,
    summary: OutcomeSummary,
) -> PostExecutionReflection {
    let notes = plan
        .subtasks
        .iter()
        .map(|s| {
            let status = result
                .result(&s.id)
                .map(|r| r.status.as_str())
                .unwrap_or("not run");
            ReflectionNote {
                subtask_id: s.id.clone(),
                sentiment: Sentiment::Neutral,
                note: status.to_string(),
            }
        })
        .collect();
    PostExecutionReflection {
        notes,
        lessons: Vec::new(),
        overall_success: summary.overall_success,
        workflow_candidate: summary.workflow_candidate,
        success_rate: summary.success_rate,
        fallbacks_used: summary.fallbacks_used,
        defaulted: true,
    }
}

fn status_note(subtask_id: &str, result: Option<&StepResult>) -> ReflectionNote {
    let (sentiment, note) = match result {
        Some(r) if r.status == StepStatus::Success && r.used_fallback => {
            (Sentiment::Neutral, "succeeded via alternative approach".to_string())
        }
        Some(r) if r.status == StepStatus::Success => (Sentiment::Positive, "succeeded".to_string()),
        Some(r) => (
            Sentiment::Negative,
            match &r.error {
                Some(e) => format!("{}: {e}", r.status),
                None => r.status.to_string(),
            },
        ),
        None => (Sentiment::Neutral, "not run".to_string()),
    };
    ReflectionNote {
        subtask_id: subtask_id.to_string(),
        sentiment,
        note,
    }
}

/// Parse note and lesson blocks. Lessons are deduplicated ignoring case.
pub fn parse_reflection(content: &str) -> (Vec<ReflectionNote>, Vec<String>) {
    let mut notes: Vec<ReflectionNote> = Vec::new();
    let mut lessons: Vec<String> = Vec::new();
    let mut current: Option<ReflectionNote> = None;

    let flush = |current: &mut Option<ReflectionNote>, notes: &mut Vec<ReflectionNote>| {
        if let Some(mut note) = current.take() {
            note.note = note.note.trim().to_string();
            if !note.subtask_id.is_empty() && !notes.iter().any(|n| n.subtask_id == note.subtask_id) {
                notes.push(note);
            }
        }
    };

    for line in content.lines() {
        let trimmed = line.trim();

        if let Some(id) = trimmed.strip_prefix(markers::NOTE) {
            flush(&mut current, &mut notes);
            current = Some(ReflectionNote {
                subtask_id: id.trim().trim_matches('`').to_string(),
                sentiment: Sentiment::Neutral,
                note: String::new(),
            });
            continue;
        }

        if let Some(lesson) = trimmed.strip_prefix(markers::LESSON) {
            flush(&mut current, &mut notes);
            let lesson = lesson.trim();
            if !lesson.is_empty() && !lessons.iter().any(|l| l.eq_ignore_ascii_case(lesson)) {
                lessons.push(lesson.to_string());
            }
            continue;
        }

        if trimmed == markers::SEPARATOR {
            flush(&mut current, &mut notes);
            continue;
        }

        let Some(note) = current.as_mut() else {
            continue;
        };
        if let Some(v) = trimmed
            .strip_prefix("**Sentiment:**")
            .or_else(|| trimmed.strip_prefix("**Sentiment: **"))
        {
            note.sentiment =
                Sentiment::parse_str(&v.trim().to_lowercase()).unwrap_or(Sentiment::Neutral);
        } else if !trimmed.is_empty() {
            if !note.note.is_empty() {
                note.note.push(' ');
            }
            note.note.push_str(trimmed);
        }
    }
    flush(&mut current, &mut notes);

    (notes, lessons)
}
