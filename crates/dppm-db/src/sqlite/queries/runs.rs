use chrono::Utc;
use rusqlite::{params, Row};

use dppm_core::{RunRecord, RunState};

use super::super::{not_found_or_internal, SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    let state_str: String = row.get("state")?;
    Ok(RunRecord {
        id: row.get("id")?,
        owner: row.get("owner")?,
        goal: row.get("goal")?,
        state: RunState::parse_str(&state_str).unwrap_or(RunState::Failed),
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl SqliteDatabase {
    pub fn create_run_sync(&self, owner: &str, goal: &str) -> Result<RunRecord, DbError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO runs (id, owner, goal, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, owner, goal, RunState::Decomposing.as_str(), now],
            )
            .to_db()?;
            conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
                .to_db()
        })
    }

    pub fn get_run_sync(&self, id: &str) -> Result<RunRecord, DbError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
                .map_err(not_found_or_internal(format!("run {id}")))
        })
    }

    pub fn list_runs_sync(&self, owner: &str) -> Result<Vec<RunRecord>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM runs WHERE owner = ?1 ORDER BY created_at DESC")
                .to_db()?;
            let rows = stmt
                .query_map(params![owner], row_to_run)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(rows)
        })
    }

    pub fn update_run_state_sync(
        &self,
        id: &str,
        state: RunState,
        error_message: Option<&str>,
    ) -> Result<RunRecord, DbError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE runs SET state = ?1, error_message = COALESCE(?2, error_message),
                                     updated_at = ?3
                     WHERE id = ?4",
                    params![state.as_str(), error_message, Utc::now(), id],
                )
                .to_db()?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("run {id}")));
            }
            conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
                .to_db()
        })
    }
}
