use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use dere_core::types::MessageRole;

use crate::error::{Result, SessionError};
use crate::types::{
    BlockType, CachedContext, Conversation, ConversationBlock, ConversationMetrics, FindOrCreate,
    NewSession, Session,
};

/// Thread-safe store for sessions, conversation turns and the context cache.
///
/// Wraps a single SQLite connection in a `Mutex` — sufficient for a
/// single-node daemon; swap in a pool if that ever changes.
pub struct SessionStore {
    db: Mutex<Connection>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SessionStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Insert a new session row and return its id.
    #[instrument(skip(self, new), fields(working_dir = %new.working_dir, medium = %new.medium))]
    pub fn create(&self, new: &NewSession) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions
             (working_dir, medium, user_id, personality, start_time, name,
              sandbox_mode, mission_id, continued_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                new.working_dir,
                new.medium,
                new.user_id,
                new.personality,
                now_unix(),
                new.name,
                new.sandbox_mode,
                new.mission_id,
                new.continued_from,
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(session_id = id, "session created");
        Ok(id)
    }

    /// Resume the latest session for `working_dir` when it is young enough,
    /// otherwise create a fresh one linked to its predecessor.
    ///
    /// The lookup is keyed by working directory alone — the same project
    /// continues across media, so Alice switching from the CLI to Discord
    /// picks up where she left off. `max_age_hours = None` resumes the
    /// latest session regardless of age.
    #[instrument(skip(self), fields(working_dir, medium))]
    pub fn find_or_create(
        &self,
        working_dir: &str,
        personality: Option<&str>,
        medium: &str,
        max_age_hours: Option<i64>,
        user_id: Option<&str>,
    ) -> Result<FindOrCreate> {
        let db = self.db.lock().unwrap();

        // Latest session for this working_dir, ignoring age.
        let latest: Option<(i64, i64, Option<String>)> = db
            .query_row(
                "SELECT id, start_time, claude_session_id FROM sessions
                 WHERE working_dir = ?1
                 ORDER BY start_time DESC LIMIT 1",
                [working_dir],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((id, start_time, claude_session_id)) = &latest {
            let fresh_enough = match max_age_hours {
                None => true,
                Some(hours) => *start_time >= now_unix() - hours * 3600,
            };
            if fresh_enough {
                debug!(session_id = id, "resuming existing session");
                return Ok(FindOrCreate {
                    session_id: *id,
                    resumed: true,
                    claude_session_id: claude_session_id.clone(),
                });
            }
        }

        db.execute(
            "INSERT INTO sessions
             (working_dir, medium, user_id, personality, start_time, continued_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                working_dir,
                medium,
                user_id,
                personality,
                now_unix(),
                latest.as_ref().map(|(id, _, _)| *id),
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(session_id = id, "session created (continuity)");
        Ok(FindOrCreate {
            session_id: id,
            resumed: false,
            claude_session_id: None,
        })
    }

    /// Retrieve a session by id, returning `None` if it does not exist.
    pub fn get(&self, id: i64) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, working_dir, medium, user_id, personality, start_time,
                    end_time, claude_session_id, is_locked, sandbox_mode, name,
                    mission_id, continued_from, summary
             FROM sessions WHERE id = ?1",
            [id],
            row_to_session,
        )
        .optional()
        .map_err(SessionError::Database)
    }

    /// Store the provider resume token captured from the first init event.
    /// Idempotent — re-storing the same token is a no-op.
    #[instrument(skip(self, token))]
    pub fn set_claude_session_id(&self, id: i64, token: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET claude_session_id = ?1 WHERE id = ?2",
            rusqlite::params![token, id],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound { id });
        }
        debug!(session_id = id, "claude session id stored");
        Ok(())
    }

    /// Mark a session as locked — its runner is gone, no further queries.
    #[instrument(skip(self))]
    pub fn lock(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("UPDATE sessions SET is_locked = 1 WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(SessionError::NotFound { id });
        }
        info!(session_id = id, "session locked");
        Ok(())
    }

    /// Close a session. `end_time` set makes the row immutable by contract.
    #[instrument(skip(self))]
    pub fn end(&self, id: i64, when: i64, summary: Option<&str>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = if let Some(summary) = summary {
            db.execute(
                "UPDATE sessions SET end_time = ?1, summary = ?2, summary_updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![when, summary, chrono::Utc::now().to_rfc3339(), id],
            )?
        } else {
            db.execute(
                "UPDATE sessions SET end_time = ?1 WHERE id = ?2",
                rusqlite::params![when, id],
            )?
        };
        if changed == 0 {
            return Err(SessionError::NotFound { id });
        }
        info!(session_id = id, "session ended");
        Ok(())
    }

    /// Set the display name (generated from the first exchange or user-chosen).
    pub fn set_name(&self, id: i64, name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET name = ?1 WHERE id = ?2",
            rusqlite::params![name, id],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound { id });
        }
        Ok(())
    }

    /// Append one conversation turn, atomically with its blocks.
    ///
    /// Returns the new conversation id. Ended sessions reject appends.
    #[instrument(skip(self, prompt, metrics, blocks), fields(session_id, role = role.as_str()))]
    pub fn append_conversation(
        &self,
        session_id: i64,
        prompt: &str,
        role: MessageRole,
        timestamp: i64,
        medium: Option<&str>,
        user_id: Option<&str>,
        metrics: Option<&ConversationMetrics>,
        blocks: &[ConversationBlock],
    ) -> Result<i64> {
        let mut db = self.db.lock().unwrap();

        let ended: Option<i64> = db
            .query_row(
                "SELECT end_time FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(SessionError::NotFound { id: session_id })?;
        if ended.is_some() {
            return Err(SessionError::Ended { id: session_id });
        }

        let tx = db.transaction()?;
        let tool_names_json = metrics
            .filter(|m| !m.tool_names.is_empty())
            .map(|m| serde_json::to_string(&m.tool_names).unwrap_or_default());
        tx.execute(
            "INSERT INTO conversations
             (session_id, prompt, message_type, timestamp, created_at, medium, user_id,
              ttft_ms, response_ms, thinking_ms, tool_uses, tool_names)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                session_id,
                prompt,
                role.as_str(),
                timestamp,
                chrono::Utc::now().to_rfc3339(),
                medium,
                user_id,
                metrics.and_then(|m| m.ttft_ms),
                metrics.and_then(|m| m.response_ms),
                metrics.and_then(|m| m.thinking_ms),
                metrics.map(|m| m.tool_uses).unwrap_or(0),
                tool_names_json,
            ],
        )?;
        let conversation_id = tx.last_insert_rowid();

        for block in blocks {
            tx.execute(
                "INSERT INTO conversation_blocks
                 (conversation_id, ordinal, block_type, tool_use_id, tool_name,
                  tool_input, text, is_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    conversation_id,
                    block.ordinal,
                    block.block_type.as_str(),
                    block.tool_use_id,
                    block.tool_name,
                    block
                        .tool_input
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap_or_default()),
                    block.text,
                    block.is_error,
                ],
            )?;
        }
        tx.commit()?;
        Ok(conversation_id)
    }

    /// Most recent turns for a session, newest first.
    pub fn history(&self, session_id: i64, limit: usize) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, prompt, message_type, timestamp, created_at,
                    medium, user_id, ttft_ms, response_ms, thinking_ms, tool_uses, tool_names
             FROM conversations
             WHERE session_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_id, limit as i64],
            row_to_conversation,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Ordered blocks for an assistant turn.
    pub fn blocks(&self, conversation_id: i64) -> Result<Vec<ConversationBlock>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT ordinal, block_type, tool_use_id, tool_name, tool_input, text, is_error
             FROM conversation_blocks
             WHERE conversation_id = ?1
             ORDER BY ordinal",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            let block_type: String = row.get(1)?;
            let tool_input: Option<String> = row.get(4)?;
            Ok(ConversationBlock {
                ordinal: row.get(0)?,
                block_type: block_type.parse().unwrap_or(BlockType::Text),
                tool_use_id: row.get(2)?,
                tool_name: row.get(3)?,
                tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
                text: row.get(5)?,
                is_error: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Unix timestamp of the most recent message in a session.
    pub fn last_message_time(&self, session_id: i64) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT timestamp FROM conversations
             WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT 1",
            [session_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(SessionError::Database)
    }

    /// Unix timestamp of the most recent message from a user, across sessions.
    /// Drives the idle gate of the engagement decider.
    pub fn last_interaction_time(&self, user_id: &str) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT timestamp FROM conversations
             WHERE user_id = ?1 ORDER BY timestamp DESC LIMIT 1",
            [user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(SessionError::Database)
    }

    /// Recent conversation content for summary generation:
    /// turns newer than `since_unix`, oldest first, capped at `limit`.
    pub fn recent_content(
        &self,
        session_id: i64,
        since_unix: i64,
        limit: usize,
    ) -> Result<Vec<(MessageRole, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_type, prompt FROM conversations
             WHERE session_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let mut rows: Vec<(MessageRole, String)> = stmt
            .query_map(
                rusqlite::params![session_id, since_unix, limit as i64],
                |row| {
                    let role: String = row.get(0)?;
                    let prompt: String = row.get(1)?;
                    Ok((role, prompt))
                },
            )?
            .filter_map(|r| r.ok())
            .filter_map(|(role, prompt)| role.parse().ok().map(|r| (r, prompt)))
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// Insert or refresh the cached context bundle for a session.
    pub fn context_cache_upsert(
        &self,
        session_id: i64,
        text: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO context_cache (session_id, context_text, context_metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                context_text = excluded.context_text,
                context_metadata = excluded.context_metadata,
                updated_at = excluded.updated_at",
            rusqlite::params![
                session_id,
                text,
                metadata.map(|v| serde_json::to_string(v).unwrap_or_default()),
                now,
            ],
        )?;
        Ok(())
    }

    /// Cached context if refreshed within `max_age_minutes`, else `None`.
    pub fn context_cache_get_if_fresh(
        &self,
        session_id: i64,
        max_age_minutes: i64,
    ) -> Result<Option<CachedContext>> {
        let db = self.db.lock().unwrap();
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(max_age_minutes);
        db.query_row(
            "SELECT session_id, context_text, context_metadata, created_at, updated_at
             FROM context_cache
             WHERE session_id = ?1 AND updated_at >= ?2",
            rusqlite::params![session_id, cutoff.to_rfc3339()],
            |row| {
                let metadata: Option<String> = row.get(2)?;
                Ok(CachedContext {
                    session_id: row.get(0)?,
                    context_text: row.get(1)?,
                    context_metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(SessionError::Database)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        working_dir: row.get(1)?,
        medium: row.get(2)?,
        user_id: row.get(3)?,
        personality: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        claude_session_id: row.get(7)?,
        is_locked: row.get(8)?,
        sandbox_mode: row.get(9)?,
        name: row.get(10)?,
        mission_id: row.get(11)?,
        continued_from: row.get(12)?,
        summary: row.get(13)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let role: String = row.get(3)?;
    let tool_names: Option<String> = row.get(12)?;
    let ttft_ms: Option<i64> = row.get(8)?;
    let response_ms: Option<i64> = row.get(9)?;
    let thinking_ms: Option<i64> = row.get(10)?;
    let tool_uses: i64 = row.get(11)?;

    let metrics = if ttft_ms.is_some() || response_ms.is_some() || tool_uses > 0 {
        Some(ConversationMetrics {
            ttft_ms,
            response_ms,
            thinking_ms,
            tool_uses,
            tool_names: tool_names
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        prompt: row.get(2)?,
        message_type: role.parse().unwrap_or(MessageRole::User),
        timestamp: row.get(4)?,
        created_at: row.get(5)?,
        medium: row.get(6)?,
        user_id: row.get(7)?,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> SessionStore {
        let conn = Connection::open_in_memory().expect("in-memory db");
        init_db(&conn).expect("schema");
        SessionStore::new(conn)
    }

    #[test]
    fn find_or_create_resumes_within_age() {
        let store = store();
        let first = store
            .find_or_create("/tmp/proj", Some("tsun"), "cli", Some(24), None)
            .unwrap();
        assert!(!first.resumed);

        let second = store
            .find_or_create("/tmp/proj", Some("tsun"), "cli", Some(24), None)
            .unwrap();
        assert!(second.resumed);
        assert_eq!(second.session_id, first.session_id);
    }

    #[test]
    fn find_or_create_no_age_always_resumes() {
        let store = store();
        let first = store
            .find_or_create("/tmp/proj", None, "discord", None, Some("alice"))
            .unwrap();
        let second = store
            .find_or_create("/tmp/proj", None, "discord", None, Some("alice"))
            .unwrap();
        assert!(second.resumed);
        assert_eq!(second.session_id, first.session_id);
    }

    #[test]
    fn session_continuity_crosses_media() {
        let store = store();
        let cli = store
            .find_or_create("/tmp/proj", None, "cli", Some(24), None)
            .unwrap();
        // The same working directory resumes even from a different medium.
        let discord = store
            .find_or_create("/tmp/proj", None, "discord", Some(24), None)
            .unwrap();
        assert!(discord.resumed);
        assert_eq!(cli.session_id, discord.session_id);
    }

    #[test]
    fn resume_returns_stored_claude_session_id() {
        let store = store();
        let created = store
            .find_or_create("/tmp/proj", None, "cli", Some(24), None)
            .unwrap();
        store
            .set_claude_session_id(created.session_id, "resume-token-1")
            .unwrap();

        let resumed = store
            .find_or_create("/tmp/proj", None, "cli", Some(24), None)
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.claude_session_id.as_deref(), Some("resume-token-1"));
    }

    #[test]
    fn ended_session_rejects_appends() {
        let store = store();
        let id = store.create(&NewSession {
            working_dir: "/tmp".into(),
            medium: "cli".into(),
            ..Default::default()
        });
        let id = id.unwrap();
        store.end(id, now_unix(), None).unwrap();

        let err = store
            .append_conversation(id, "hi", MessageRole::User, now_unix(), None, None, None, &[])
            .unwrap_err();
        assert!(matches!(err, SessionError::Ended { .. }));
    }

    #[test]
    fn blocks_round_trip_in_order() {
        let store = store();
        let id = store
            .create(&NewSession {
                working_dir: "/tmp".into(),
                medium: "agent_api".into(),
                ..Default::default()
            })
            .unwrap();

        let blocks = vec![
            ConversationBlock::thinking(0, "hmm"),
            ConversationBlock {
                ordinal: 1,
                block_type: BlockType::ToolUse,
                tool_use_id: Some("tu_1".into()),
                tool_name: Some("Read".into()),
                tool_input: Some(serde_json::json!({"path": "/etc/hosts"})),
                text: None,
                is_error: false,
            },
            ConversationBlock::text(2, "done"),
        ];
        let conv_id = store
            .append_conversation(
                id,
                "done",
                MessageRole::Assistant,
                now_unix(),
                Some("agent_api"),
                None,
                Some(&ConversationMetrics {
                    tool_uses: 1,
                    tool_names: vec!["Read".into()],
                    ..Default::default()
                }),
                &blocks,
            )
            .unwrap();

        let loaded = store.blocks(conv_id).unwrap();
        assert_eq!(loaded, blocks);
    }

    #[test]
    fn stale_context_cache_is_not_returned() {
        let store = store();
        let id = store
            .create(&NewSession {
                working_dir: "/tmp".into(),
                medium: "cli".into(),
                ..Default::default()
            })
            .unwrap();
        store.context_cache_upsert(id, "entities: rust", None).unwrap();

        assert!(store.context_cache_get_if_fresh(id, 30).unwrap().is_some());
        // Max age of zero minutes makes the just-written row stale.
        assert!(store.context_cache_get_if_fresh(id, 0).unwrap().is_none());
    }

    #[test]
    fn last_interaction_time_tracks_latest_turn() {
        let store = store();
        let id = store
            .create(&NewSession {
                working_dir: "/tmp".into(),
                medium: "cli".into(),
                user_id: Some("alice".into()),
                ..Default::default()
            })
            .unwrap();

        assert!(store.last_interaction_time("alice").unwrap().is_none());
        store
            .append_conversation(
                id,
                "hello",
                MessageRole::User,
                1_700_000_000,
                Some("cli"),
                Some("alice"),
                None,
                &[],
            )
            .unwrap();
        assert_eq!(
            store.last_interaction_time("alice").unwrap(),
            Some(1_700_000_000)
        );
    }
}
