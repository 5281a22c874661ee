use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::error::{PresenceError, Result};
use crate::types::{ChannelInfo, PresenceEntry};

/// Registry of reachable chat media per user.
///
/// Adapters register on startup, heartbeat every 30 s, and unregister on
/// shutdown. A row whose heartbeat is older than the stale window is offline
/// and must never be offered to routing.
pub struct PresenceRegistry {
    db: Mutex<Connection>,
}

impl PresenceRegistry {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Upsert a presence row — last `register` wins on channels.
    #[instrument(skip(self, channels), fields(medium, user_id, channels = channels.len()))]
    pub fn register(&self, medium: &str, user_id: &str, channels: &[ChannelInfo]) -> Result<()> {
        let json = serde_json::to_string(channels)
            .map_err(|e| PresenceError::InvalidChannels(e.to_string()))?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO presence (medium, user_id, available_channels, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(medium, user_id) DO UPDATE SET
                available_channels = excluded.available_channels,
                last_heartbeat = excluded.last_heartbeat",
            rusqlite::params![medium, user_id, json, Utc::now().to_rfc3339()],
        )?;
        info!(medium, user_id, "presence registered");
        Ok(())
    }

    /// Refresh the heartbeat. Unknown rows are ignored — the adapter is
    /// expected to re-register after a daemon restart.
    pub fn heartbeat(&self, medium: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE presence SET last_heartbeat = ?1 WHERE medium = ?2 AND user_id = ?3",
            rusqlite::params![Utc::now().to_rfc3339(), medium, user_id],
        )?;
        if changed == 0 {
            debug!(medium, user_id, "heartbeat for unknown presence row");
        }
        Ok(())
    }

    /// Remove the presence row on clean adapter shutdown.
    #[instrument(skip(self))]
    pub fn unregister(&self, medium: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM presence WHERE medium = ?1 AND user_id = ?2",
            rusqlite::params![medium, user_id],
        )?;
        info!(medium, user_id, "presence unregistered");
        Ok(())
    }

    /// All media for a user whose heartbeat is within `stale_seconds`.
    ///
    /// Routing must only choose destinations from this list.
    pub fn list_online(&self, user_id: &str, stale_seconds: i64) -> Result<Vec<PresenceEntry>> {
        let cutoff = (Utc::now() - Duration::seconds(stale_seconds)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT medium, user_id, available_channels, last_heartbeat
             FROM presence
             WHERE user_id = ?1 AND last_heartbeat > ?2
             ORDER BY medium",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, cutoff], |row| {
            let channels_json: String = row.get(2)?;
            Ok(PresenceEntry {
                medium: row.get(0)?,
                user_id: row.get(1)?,
                available_channels: serde_json::from_str::<Vec<ChannelInfo>>(&channels_json)
                    .unwrap_or_default(),
                last_heartbeat: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Periodic sweep deleting rows with heartbeats older than `stale_seconds`.
    /// Returns the number of rows removed.
    pub fn sweep_stale(&self, stale_seconds: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::seconds(stale_seconds)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let removed = db.execute("DELETE FROM presence WHERE last_heartbeat <= ?1", [cutoff])?;
        if removed > 0 {
            info!(removed, "stale presence rows swept");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn registry() -> PresenceRegistry {
        let conn = Connection::open_in_memory().expect("in-memory db");
        init_db(&conn).expect("schema");
        PresenceRegistry::new(conn)
    }

    fn dm_channel(id: &str) -> ChannelInfo {
        ChannelInfo {
            id: id.to_string(),
            name: None,
            channel_type: Some("dm".to_string()),
            extra: Default::default(),
        }
    }

    #[test]
    fn register_then_list_online() {
        let registry = registry();
        registry
            .register("discord", "alice", &[dm_channel("123")])
            .unwrap();

        let online = registry.list_online("alice", 60).unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].medium, "discord");
        assert_eq!(online[0].available_channels[0].id, "123");
    }

    #[test]
    fn last_register_wins_on_channels() {
        let registry = registry();
        registry
            .register("discord", "alice", &[dm_channel("123")])
            .unwrap();
        registry
            .register("discord", "alice", &[dm_channel("456")])
            .unwrap();

        let online = registry.list_online("alice", 60).unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].available_channels.len(), 1);
        assert_eq!(online[0].available_channels[0].id, "456");
    }

    #[test]
    fn stale_rows_are_excluded_from_list_online() {
        let registry = registry();
        registry
            .register("discord", "alice", &[dm_channel("123")])
            .unwrap();

        // Stale window of zero seconds makes the fresh heartbeat already stale.
        let online = registry.list_online("alice", 0).unwrap();
        assert!(online.is_empty());
    }

    #[test]
    fn unregister_removes_row() {
        let registry = registry();
        registry
            .register("obsidian", "alice", &[dm_channel("vault")])
            .unwrap();
        registry.unregister("obsidian", "alice").unwrap();
        assert!(registry.list_online("alice", 60).unwrap().is_empty());
    }

    #[test]
    fn sweep_removes_only_stale_rows() {
        let registry = registry();
        registry
            .register("discord", "alice", &[dm_channel("123")])
            .unwrap();
        assert_eq!(registry.sweep_stale(60).unwrap(), 0);
        assert_eq!(registry.sweep_stale(-1).unwrap(), 1);
    }

    #[test]
    fn heartbeat_without_registration_is_a_noop() {
        let registry = registry();
        registry.heartbeat("discord", "ghost").unwrap();
        assert!(registry.list_online("ghost", 60).unwrap().is_empty());
    }
}
