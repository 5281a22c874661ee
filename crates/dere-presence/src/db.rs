use rusqlite::Connection;

use crate::error::Result;

/// Initialise the presence table. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS presence (
            medium             TEXT NOT NULL,
            user_id            TEXT NOT NULL,
            available_channels TEXT NOT NULL,   -- JSON list of {id, name, type, ...}
            last_heartbeat     TEXT NOT NULL,   -- RFC3339
            PRIMARY KEY (medium, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_presence_user
            ON presence(user_id, last_heartbeat DESC);",
    )?;
    Ok(())
}
