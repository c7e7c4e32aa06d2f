use chrono::Utc;
use rusqlite::{params, Row};

use dppm_core::{CreateWorkflow, Workflow, WorkflowStatus};

use super::super::{json_column, not_found_or_internal, to_json, SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_workflow(row: &Row) -> rusqlite::Result<Workflow> {
    let status_str: String = row.get("status")?;
    Ok(Workflow {
        id: row.get("id")?,
        owner: row.get("owner")?,
        goal: row.get("goal")?,
        plan: json_column(row, "plan")?,
        success_count: row.get("success_count")?,
        total_uses: row.get("total_uses")?,
        status: WorkflowStatus::parse_str(&status_str).unwrap_or(WorkflowStatus::Retired),
        source_experience_id: row.get("source_experience_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl SqliteDatabase {
    pub fn create_workflow_sync(&self, input: &CreateWorkflow) -> Result<Workflow, DbError> {
        let plan = to_json(&input.plan)?;
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO workflows (id, owner, goal, plan, source_experience_id,
                                        created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, input.owner, input.goal, plan, input.source_experience_id, now],
            )
            .to_db()?;
            conn.query_row(
                "SELECT * FROM workflows WHERE id = ?1",
                params![id],
                row_to_workflow,
            )
            .to_db()
        })
    }

    pub fn get_workflow_sync(&self, id: &str) -> Result<Workflow, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM workflows WHERE id = ?1",
                params![id],
                row_to_workflow,
            )
            .map_err(not_found_or_internal(format!("workflow {id}")))
        })
    }

    pub fn list_workflows_sync(
        &self,
        owner: &str,
        include_retired: bool,
    ) -> Result<Vec<Workflow>, DbError> {
        self.with_conn(|conn| {
            let sql = if include_retired {
                "SELECT * FROM workflows WHERE owner = ?1 ORDER BY updated_at DESC"
            } else {
                "SELECT * FROM workflows WHERE owner = ?1 AND status = 'active'
                 ORDER BY updated_at DESC"
            };
            let mut stmt = conn.prepare(sql).to_db()?;
            let rows = stmt
                .query_map(params![owner], row_to_workflow)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(rows)
        })
    }

    /// Bump `total_uses`, and `success_count` when `success`, in one statement.
    pub fn increment_workflow_stats_sync(
        &self,
        id: &str,
        success: bool,
    ) -> Result<Workflow, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE workflows
                 SET total_uses = total_uses + 1,
                     success_count = success_count + ?1,
                     updated_at = ?2
                 WHERE id = ?3
                 RETURNING *",
                params![i64::from(success), Utc::now(), id],
                row_to_workflow,
            )
            .map_err(not_found_or_internal(format!("workflow {id}")))
        })
    }

    pub fn retire_workflow_if_degraded_sync(
        &self,
        id: &str,
        min_uses: i64,
        threshold: f64,
    ) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE workflows SET status = 'retired', updated_at = ?1
                     WHERE id = ?2
                       AND status = 'active'
                       AND total_uses >= ?3
                       AND CAST(success_count AS REAL) / total_uses < ?4",
                    params![Utc::now(), id, min_uses.max(1), threshold],
                )
                .to_db()?;
            Ok(changed > 0)
        })
    }
}
