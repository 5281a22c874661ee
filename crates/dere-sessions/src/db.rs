use rusqlite::Connection;

use crate::error::Result;

/// Initialise session, conversation and context-cache tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            working_dir        TEXT    NOT NULL,
            medium             TEXT    NOT NULL DEFAULT 'cli',
            user_id            TEXT,
            personality        TEXT,
            start_time         INTEGER NOT NULL,   -- unix seconds
            end_time           INTEGER,            -- set => session immutable
            claude_session_id  TEXT,               -- opaque provider resume token
            is_locked          INTEGER NOT NULL DEFAULT 0,
            sandbox_mode       INTEGER NOT NULL DEFAULT 0,
            name               TEXT,
            mission_id         INTEGER,
            continued_from     INTEGER,
            summary            TEXT,
            summary_updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_dir
            ON sessions(working_dir, start_time DESC);
        CREATE INDEX IF NOT EXISTS idx_sessions_medium_user
            ON sessions(medium, user_id);

        CREATE TABLE IF NOT EXISTS conversations (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   INTEGER NOT NULL REFERENCES sessions(id),
            prompt       TEXT    NOT NULL,
            message_type TEXT    NOT NULL,         -- user | assistant | system
            timestamp    INTEGER NOT NULL,         -- unix seconds
            created_at   TEXT    NOT NULL,         -- RFC3339
            medium       TEXT,
            user_id      TEXT,
            ttft_ms      INTEGER,
            response_ms  INTEGER,
            thinking_ms  INTEGER,
            tool_uses    INTEGER NOT NULL DEFAULT 0,
            tool_names   TEXT                      -- JSON array of strings
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_session
            ON conversations(session_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, timestamp DESC);

        CREATE TABLE IF NOT EXISTS conversation_blocks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            ordinal         INTEGER NOT NULL,
            block_type      TEXT    NOT NULL,      -- text | thinking | tool_use | tool_result
            tool_use_id     TEXT,
            tool_name       TEXT,
            tool_input      TEXT,                  -- JSON
            text            TEXT,
            is_error        INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_blocks_conversation
            ON conversation_blocks(conversation_id, ordinal);

        CREATE TABLE IF NOT EXISTS context_cache (
            session_id       INTEGER PRIMARY KEY,
            context_text     TEXT NOT NULL,
            context_metadata TEXT,                 -- JSON list of entity descriptors
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );",
    )?;
    Ok(())
}
