use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use dppm_core::{CreateWorkflow, Experience, NewExperience, Workflow};
use dppm_db::{Database, DbError};

/// How many recent experiences are scanned for similar goals.
const EXPERIENCE_SCAN_WINDOW: usize = 200;

/// Scores how alike two goals are, in [0, 1].
pub trait SimilarityStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard index over lowercase alphanumeric tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenJaccard;

impl TokenJaccard {
    fn tokens(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    }
}

impl SimilarityStrategy for TokenJaccard {
    fn name(&self) -> &str {
        "token-jaccard"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = Self::tokens(a);
        let b = Self::tokens(b);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let inter = a.intersection(&b).count();
        let union = a.union(&b).count();
        inter as f64 / union as f64
    }
}

/// Experience log and workflow cache on top of a [`Database`].
pub struct ExperienceStore {
    db: Arc<dyn Database>,
    similarity: Arc<dyn SimilarityStrategy>,
}

impl ExperienceStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            similarity: Arc::new(TokenJaccard),
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityStrategy>) -> Self {
        self.similarity = similarity;
        self
    }

    pub async fn store_experience(&self, input: &NewExperience) -> Result<Experience, DbError> {
        let exp = self.db.create_experience(input).await?;
        debug!(experience = %exp.id, owner = %exp.owner, "experience stored");
        Ok(exp)
    }

    /// The owner's past experiences whose goal scores at least `threshold`,
    /// best first, at most `limit`.
    pub async fn retrieve_relevant_experiences(
        &self,
        owner: &str,
        goal: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Experience>, DbError> {
        let recent = self
            .db
            .list_experiences(owner, EXPERIENCE_SCAN_WINDOW)
            .await?;
        let mut scored: Vec<(f64, Experience)> = recent
            .into_iter()
            .map(|e| (self.similarity.similarity(goal, &e.goal), e))
            .filter(|(score, _)| *score >= threshold)
            .collect();
        // Stable: equally similar experiences stay newest first.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(limit);
        debug!(
            strategy = self.similarity.name(),
            found = scored.len(),
            "relevant experiences"
        );
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    /// Save the experience's plan as a reusable workflow. Plans that still
    /// contain placeholder steps are refused with `None`.
    pub async fn save_workflow(&self, experience: &Experience) -> Result<Option<Workflow>, DbError> {
        let placeholders = experience.plan.placeholder_ids();
        if !placeholders.is_empty() {
            warn!(
                experience = %experience.id,
                placeholders = ?placeholders,
                "not caching a plan with placeholder subtasks"
            );
            return Ok(None);
        }
        let wf = self
            .db
            .create_workflow(&CreateWorkflow {
                owner: experience.owner.clone(),
                goal: experience.goal.clone(),
                plan: experience.plan.clone(),
                source_experience_id: Some(experience.id.clone()),
            })
            .await?;
        info!(workflow = %wf.id, goal = %wf.goal, "workflow saved");
        Ok(Some(wf))
    }

    /// Best active workflow whose goal scores at least `threshold`.
    pub async fn retrieve_workflow(
        &self,
        owner: &str,
        goal: &str,
        threshold: f64,
    ) -> Result<Option<Workflow>, DbError> {
        let workflows = self.db.list_workflows(owner, false).await?;
        let mut best: Option<(f64, Workflow)> = None;
        for wf in workflows.into_iter().filter(Workflow::is_active) {
            let score = self.similarity.similarity(goal, &wf.goal);
            if score < threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, wf));
            }
        }
        if let Some((score, ref wf)) = best {
            debug!(workflow = %wf.id, score, "workflow matched");
        }
        Ok(best.map(|(_, wf)| wf))
    }

    /// Count one reuse and retire the workflow if it has degraded.
    pub async fn record_workflow_use(
        &self,
        workflow_id: &str,
        success: bool,
        min_uses: i64,
        retire_threshold: f64,
    ) -> Result<Workflow, DbError> {
        let wf = self.db.increment_workflow_stats(workflow_id, success).await?;
        if self
            .db
            .retire_workflow_if_degraded(workflow_id, min_uses, retire_threshold)
            .await?
        {
            info!(
                workflow = %workflow_id,
                success_rate = wf.success_rate(),
                "workflow retired"
            );
            return self.db.get_workflow(workflow_id).await;
        }
        Ok(wf)
    }

    pub async fn list_experiences(&self, owner: &str, limit: usize) -> Result<Vec<Experience>, DbError> {
        self.db.list_experiences(owner, limit).await
    }

    pub async fn list_workflows(
        &self,
        owner: &str,
        include_retired: bool,
    ) -> Result<Vec<Workflow>, DbError> {
        self.db.list_workflows(owner, include_retired).await
    }
}
