use rusqlite::Connection;

use crate::error::Result;

/// Initialise the notification tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notifications (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                TEXT    NOT NULL,
            target_medium          TEXT    NOT NULL,
            target_location        TEXT    NOT NULL,
            message                TEXT    NOT NULL,
            priority               TEXT    NOT NULL,  -- alert | conversation
            priority_rank          INTEGER NOT NULL,  -- queue ordering key
            routing_reasoning      TEXT    NOT NULL,
            status                 TEXT    NOT NULL DEFAULT 'pending',
            created_at             TEXT    NOT NULL,
            delivered_at           TEXT,
            error_message          TEXT,
            acknowledged           INTEGER NOT NULL DEFAULT 0,
            acknowledged_at        TEXT,
            parent_notification_id INTEGER REFERENCES notifications(id)
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_pending
            ON notifications(target_medium, status, created_at);
        CREATE INDEX IF NOT EXISTS idx_notifications_ack
            ON notifications(acknowledged, user_id, created_at);

        CREATE TABLE IF NOT EXISTS notification_context (
            notification_id  INTEGER PRIMARY KEY REFERENCES notifications(id),
            trigger_type     TEXT,
            trigger_id       TEXT,
            trigger_data     TEXT,   -- JSON
            context_snapshot TEXT    -- JSON
        );",
    )?;
    Ok(())
}
