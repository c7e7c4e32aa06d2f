use chrono::Utc;
use rusqlite::{params, Row};

use dppm_core::{Experience, NewExperience};

use super::super::{json_column, not_found_or_internal, to_json, SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_experience(row: &Row) -> rusqlite::Result<Experience> {
    Ok(Experience {
        id: row.get("id")?,
        owner: row.get("owner")?,
        goal: row.get("goal")?,
        plan: json_column(row, "plan")?,
        result: json_column(row, "result")?,
        reflection: json_column(row, "reflection")?,
        created_at: row.get("created_at")?,
    })
}

impl SqliteDatabase {
    pub fn create_experience_sync(&self, input: &NewExperience) -> Result<Experience, DbError> {
        let plan = to_json(&input.plan)?;
        let result = to_json(&input.result)?;
        let reflection = to_json(&input.reflection)?;
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO experiences (id, owner, goal, plan, result, reflection, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, input.owner, input.goal, plan, result, reflection, now],
            )
            .to_db()?;
            conn.query_row(
                "SELECT * FROM experiences WHERE id = ?1",
                params![id],
                row_to_experience,
            )
            .to_db()
        })
    }

    pub fn get_experience_sync(&self, id: &str) -> Result<Experience, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM experiences WHERE id = ?1",
                params![id],
                row_to_experience,
            )
            .map_err(not_found_or_internal(format!("experience {id}")))
        })
    }

    pub fn list_experiences_sync(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<Experience>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM experiences WHERE owner = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .to_db()?;
            let rows = stmt
                .query_map(params![owner, limit as i64], row_to_experience)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(rows)
        })
    }
}
