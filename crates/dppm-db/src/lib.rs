#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use dppm_core::{
    CreateWorkflow, DppmError, Experience, NewExperience, RunRecord, RunState, Workflow,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DbError> for DppmError {
    fn from(e: DbError) -> Self {
        DppmError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Database file. Defaults to `dppm.db` under [`data_dir`].
    pub sqlite_path: Option<String>,
}

/// `$XDG_DATA_HOME/dppm`, falling back to `~/.local/share/dppm`.
pub fn data_dir() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from(".")
    };
    base.join("dppm")
}

/// Persistence for experiences, workflows and run bookkeeping.
///
/// Experiences are write-once. Workflow counters only move through
/// [`Database::increment_workflow_stats`], which is a single atomic update.
#[async_trait]
pub trait Database: Send + Sync {
    // -- Experiences --
    async fn create_experience(&self, input: &NewExperience) -> Result<Experience, DbError>;
    async fn get_experience(&self, id: &str) -> Result<Experience, DbError>;
    /// Most recent first.
    async fn list_experiences(&self, owner: &str, limit: usize)
        -> Result<Vec<Experience>, DbError>;

    // -- Workflows --
    async fn create_workflow(&self, input: &CreateWorkflow) -> Result<Workflow, DbError>;
    async fn get_workflow(&self, id: &str) -> Result<Workflow, DbError>;
    async fn list_workflows(
        &self,
        owner: &str,
        include_retired: bool,
    ) -> Result<Vec<Workflow>, DbError>;
    async fn increment_workflow_stats(&self, id: &str, success: bool)
        -> Result<Workflow, DbError>;
    /// Retire the workflow if it has at least `min_uses` recorded uses and a
    /// success rate below `threshold`. Returns whether it was retired.
    async fn retire_workflow_if_degraded(
        &self,
        id: &str,
        min_uses: i64,
        threshold: f64,
    ) -> Result<bool, DbError>;

    // -- Runs --
    async fn create_run(&self, owner: &str, goal: &str) -> Result<RunRecord, DbError>;
    async fn get_run(&self, id: &str) -> Result<RunRecord, DbError>;
    async fn list_runs(&self, owner: &str) -> Result<Vec<RunRecord>, DbError>;
    async fn update_run_state(
        &self,
        id: &str,
        state: RunState,
        error_message: Option<&str>,
    ) -> Result<RunRecord, DbError>;
}
