use rusqlite::Connection;

use super::SqliteResultExt;
use crate::DbError;

pub fn run(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS experiences (
            id          TEXT PRIMARY KEY,
            owner       TEXT NOT NULL,
            goal        TEXT NOT NULL,
            plan        TEXT NOT NULL,
            result      TEXT NOT NULL,
            reflection  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_experiences_owner
            ON experiences(owner, created_at);

        CREATE TABLE IF NOT EXISTS workflows (
            id                   TEXT PRIMARY KEY,
            owner                TEXT NOT NULL,
            goal                 TEXT NOT NULL,
            plan                 TEXT NOT NULL,
            success_count        INTEGER NOT NULL DEFAULT 0,
            total_uses           INTEGER NOT NULL DEFAULT 0,
            status               TEXT NOT NULL DEFAULT 'active'
                                     CHECK(status IN ('active', 'retired')),
            source_experience_id TEXT REFERENCES experiences(id) ON DELETE SET NULL,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_workflows_owner
            ON workflows(owner, status);

        CREATE TABLE IF NOT EXISTS runs (
            id             TEXT PRIMARY KEY,
            owner          TEXT NOT NULL,
            goal           TEXT NOT NULL,
            state          TEXT NOT NULL,
            error_message  TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_runs_owner ON runs(owner, created_at);
        ",
    )
    .to_db()?;
    Ok(())
}
