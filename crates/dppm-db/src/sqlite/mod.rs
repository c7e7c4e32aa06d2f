pub(crate) mod migrations;
pub mod queries;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use serde::de::DeserializeOwned;

use dppm_core::{CreateWorkflow, Experience, NewExperience, RunRecord, RunState, Workflow};

use crate::{Database, DbConfig, DbError};

/// Converts `rusqlite::Result<T>` into `Result<T, DbError>` so query modules
/// can use `.to_db()?`.
pub(crate) trait SqliteResultExt<T> {
    fn to_db(self) -> Result<T, DbError>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn to_db(self) -> Result<T, DbError> {
        self.map_err(map_sqlite_err)
    }
}

#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(config: &DbConfig) -> Result<Self, DbError> {
        let path = config
            .sqlite_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::data_dir().join("dppm.db"));
        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).to_db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().to_db()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DbError::Internal("lock poisoned".into()))?;
        f(&conn)
    }

    fn run_migrations(&self) -> Result<(), DbError> {
        self.with_conn(migrations::run)
    }
}

pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Map "no rows" to `NotFound(what)`, everything else to `Internal`.
pub(crate) fn not_found_or_internal(what: String) -> impl FnOnce(rusqlite::Error) -> DbError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(what),
        other => DbError::Internal(other.to_string()),
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|e| DbError::Internal(e.to_string()))
}

/// Decode a JSON text column inside a row mapper.
pub(crate) fn json_column<T: DeserializeOwned>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl Database for SqliteDatabase {
    // -- Experiences --
    async fn create_experience(&self, input: &NewExperience) -> Result<Experience, DbError> {
        let db = self.clone();
        let input = input.clone();
        tokio::task::spawn_blocking(move || db.create_experience_sync(&input))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn get_experience(&self, id: &str) -> Result<Experience, DbError> {
        let db = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.get_experience_sync(&id))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn list_experiences(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, DbError> {
        let db = self.clone();
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || db.list_experiences_sync(&owner, limit))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }

    // -- Workflows --
    async fn create_workflow(&self, input: &CreateWorkflow) -> Result<Workflow, DbError> {
        let db = self.clone();
        let input = input.clone();
        tokio::task::spawn_blocking(move || db.create_workflow_sync(&input))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn get_workflow(&self, id: &str) -> Result<Workflow, DbError> {
        let db = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.get_workflow_sync(&id))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn list_workflows(
        &self,
        owner: &str,
        include_retired: bool,
    ) -> Result<Vec<Workflow>, DbError> {
        let db = self.clone();
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || db.list_workflows_sync(&owner, include_retired))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn increment_workflow_stats(
        &self,
        id: &str,
        success: bool,
    ) -> Result<Workflow, DbError> {
        let db = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.increment_workflow_stats_sync(&id, success))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn retire_workflow_if_degraded(
        &self,
        id: &str,
        min_uses: i64,
        threshold: f64,
    ) -> Result<bool, DbError> {
        let db = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            db.retire_workflow_if_degraded_sync(&id, min_uses, threshold)
        })
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?
    }

    // -- Runs --
    async fn create_run(&self, owner: &str, goal: &str) -> Result<RunRecord, DbError> {
        let db = self.clone();
        let owner = owner.to_string();
        let goal = goal.to_string();
        tokio::task::spawn_blocking(move || db.create_run_sync(&owner, &goal))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn get_run(&self, id: &str) -> Result<RunRecord, DbError> {
        let db = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.get_run_sync(&id))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn list_runs(&self, owner: &str) -> Result<Vec<RunRecord>, DbError> {
        let db = self.clone();
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || db.list_runs_sync(&owner))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
    async fn update_run_state(
        &self,
        id: &str,
        state: RunState,
        error_message: Option<&str>,
    ) -> Result<RunRecord, DbError> {
        let db = self.clone();
        let id = id.to_string();
        let error_message = error_message.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || {
            db.update_run_state_sync(&id, state, error_message.as_deref())
        })
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?
    }
}
