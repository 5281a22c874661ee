use rusqlite::Connection;

use crate::error::Result;

/// Initialise task and finding tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS project_tasks (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            working_dir             TEXT    NOT NULL,
            title                   TEXT    NOT NULL,
            description             TEXT    NOT NULL,
            task_type               TEXT    NOT NULL,
            priority                INTEGER NOT NULL DEFAULT 0,   -- 0..100
            status                  TEXT    NOT NULL DEFAULT 'backlog',
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL,
            started_at              TEXT,
            completed_at            TEXT,
            attempt_count           INTEGER NOT NULL DEFAULT 0,
            last_error              TEXT,
            discovered_from_task_id INTEGER,
            discovery_reason        TEXT,
            extra                   TEXT    NOT NULL DEFAULT '{}'  -- JSON (TaskExtra)
        );
        -- Claim query: type + status filtered, ordered by priority/created_at.
        CREATE INDEX IF NOT EXISTS idx_tasks_claim
            ON project_tasks(task_type, status, priority DESC, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_title
            ON project_tasks(task_type, title COLLATE NOCASE);

        CREATE TABLE IF NOT EXISTS exploration_findings (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id        INTEGER NOT NULL REFERENCES project_tasks(id),
            user_id        TEXT    NOT NULL,
            finding        TEXT    NOT NULL,
            source_context TEXT,
            confidence     REAL    NOT NULL,
            worth_sharing  INTEGER NOT NULL DEFAULT 0,
            share_message  TEXT,
            created_at     TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_findings_task
            ON exploration_findings(task_id);",
    )?;
    Ok(())
}
