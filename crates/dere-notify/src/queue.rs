use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, instrument, warn};

use dere_core::types::Priority;

use crate::error::{NotifyError, Result};
use crate::types::{NewNotification, Notification, NotificationStatus, TriggerContext};

/// At-least-once delivery queue for proactive messages.
///
/// Adapters pull with `pending(medium)`, deliver, then call `mark_delivered`
/// or `mark_failed`. An adapter crashing between send and mark re-delivers —
/// adapters should be idempotent where their medium allows.
pub struct NotificationQueue {
    db: Mutex<Connection>,
}

impl NotificationQueue {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Enqueue a notification (status `pending`), atomically with its
    /// trigger context when present. Returns the new id.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, medium = %new.target_medium))]
    pub fn create(&self, new: &NewNotification) -> Result<i64> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO notifications
             (user_id, target_medium, target_location, message, priority, priority_rank,
              routing_reasoning, status, created_at, parent_notification_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)",
            rusqlite::params![
                new.user_id,
                new.target_medium,
                new.target_location,
                new.message,
                new.priority.as_str(),
                new.priority.rank(),
                new.routing_reasoning,
                Utc::now().to_rfc3339(),
                new.parent_notification_id,
            ],
        )?;
        let id = tx.last_insert_rowid();

        if !new.context.is_empty() {
            tx.execute(
                "INSERT INTO notification_context
                 (notification_id, trigger_type, trigger_id, trigger_data, context_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id,
                    new.context.trigger_type,
                    new.context.trigger_id,
                    new.context
                        .trigger_data
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap_or_default()),
                    new.context
                        .context_snapshot
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap_or_default()),
                ],
            )?;
        }
        tx.commit()?;

        let preview: String = new.message.chars().take(100).collect();
        info!(
            notification_id = id,
            medium = %new.target_medium,
            location = %new.target_location,
            priority = %new.priority,
            %preview,
            "notification queued"
        );
        Ok(id)
    }

    /// Pending notifications for a medium, ordered `(priority desc, created_at asc)`.
    pub fn pending(&self, medium: &str) -> Result<Vec<Notification>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, target_medium, target_location, message, priority,
                    routing_reasoning, status, created_at, delivered_at, error_message,
                    acknowledged, acknowledged_at, parent_notification_id
             FROM notifications
             WHERE target_medium = ?1 AND status = 'pending'
             ORDER BY priority_rank DESC, created_at ASC",
        )?;
        let rows = stmt.query_map([medium], row_to_notification)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Mark delivery success. Idempotent — only pending rows transition,
    /// and the first delivery timestamp sticks.
    #[instrument(skip(self))]
    pub fn mark_delivered(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE notifications SET status = 'delivered', delivered_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if changed > 0 {
            info!(notification_id = id, "notification delivered");
        } else {
            let exists: Option<i64> = db
                .query_row("SELECT id FROM notifications WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(NotifyError::NotFound { id });
            }
        }
        Ok(())
    }

    /// Mark delivery failure. Failed rows are left for inspection — retries
    /// only happen through fresh engagement decisions.
    #[instrument(skip(self, error))]
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE notifications
             SET status = 'failed', error_message = ?1, delivered_at = ?2
             WHERE id = ?3",
            rusqlite::params![error, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(NotifyError::NotFound { id });
        }
        warn!(notification_id = id, error, "notification delivery failed");
        Ok(())
    }

    /// Record that the user responded on the medium. Idempotent — the first
    /// acknowledgment timestamp is preserved.
    #[instrument(skip(self))]
    pub fn acknowledge(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE notifications SET acknowledged = 1, acknowledged_at = ?1
             WHERE id = ?2 AND acknowledged = 0",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if changed > 0 {
            info!(notification_id = id, "notification acknowledged");
        } else {
            // Distinguish "already acknowledged" from "does not exist".
            let exists: Option<i64> = db
                .query_row("SELECT id FROM notifications WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(NotifyError::NotFound { id });
            }
        }
        Ok(())
    }

    /// Most recent notifications for a user, newest first. Feeds the
    /// responsiveness signal.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, target_medium, target_location, message, priority,
                    routing_reasoning, status, created_at, delivered_at, error_message,
                    acknowledged, acknowledged_at, parent_notification_id
             FROM notifications
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![user_id, limit as i64],
            row_to_notification,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delivered-but-unacknowledged notifications since `since` (RFC3339),
    /// newest first. Escalation chains root at the first of these.
    pub fn recent_unacknowledged(&self, user_id: &str, since: &str) -> Result<Vec<Notification>> {
        chrono::DateTime::parse_from_rfc3339(since)
            .map_err(|e| NotifyError::InvalidTimestamp(format!("{since}: {e}")))?;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, target_medium, target_location, message, priority,
                    routing_reasoning, status, created_at, delivered_at, error_message,
                    acknowledged, acknowledged_at, parent_notification_id
             FROM notifications
             WHERE user_id = ?1 AND created_at >= ?2
               AND status = 'delivered' AND acknowledged = 0
             ORDER BY created_at DESC
             LIMIT 10",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, since], row_to_notification)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Retrieve a single notification.
    pub fn get(&self, id: i64) -> Result<Option<Notification>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user_id, target_medium, target_location, message, priority,
                    routing_reasoning, status, created_at, delivered_at, error_message,
                    acknowledged, acknowledged_at, parent_notification_id
             FROM notifications WHERE id = ?1",
            [id],
            row_to_notification,
        )
        .optional()
        .map_err(NotifyError::Database)
    }

    /// Attached trigger context, if any.
    pub fn context(&self, id: i64) -> Result<Option<TriggerContext>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT trigger_type, trigger_id, trigger_data, context_snapshot
             FROM notification_context WHERE notification_id = ?1",
            [id],
            |row| {
                let trigger_data: Option<String> = row.get(2)?;
                let snapshot: Option<String> = row.get(3)?;
                Ok(TriggerContext {
                    trigger_type: row.get(0)?,
                    trigger_id: row.get(1)?,
                    trigger_data: trigger_data.and_then(|s| serde_json::from_str(&s).ok()),
                    context_snapshot: snapshot.and_then(|s| serde_json::from_str(&s).ok()),
                })
            },
        )
        .optional()
        .map_err(NotifyError::Database)
    }

    /// Walk `parent_notification_id` links up to the chain root.
    ///
    /// Escalation must stop as soon as any ancestor is acknowledged.
    pub fn chain_root(&self, id: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let mut current = id;
        // Parent links form a DAG rooted at the first pending notification;
        // the hop cap guards against accidental cycles in hand-edited data.
        for _ in 0..64 {
            let parent: Option<i64> = db
                .query_row(
                    "SELECT parent_notification_id FROM notifications WHERE id = ?1",
                    [current],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(NotifyError::NotFound { id: current })?;
            match parent {
                Some(p) => current = p,
                None => return Ok(current),
            }
        }
        Ok(current)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let priority: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        target_medium: row.get(2)?,
        target_location: row.get(3)?,
        message: row.get(4)?,
        priority: priority.parse().unwrap_or(Priority::Conversation),
        routing_reasoning: row.get(6)?,
        status: status.parse().unwrap_or(NotificationStatus::Pending),
        created_at: row.get(8)?,
        delivered_at: row.get(9)?,
        error_message: row.get(10)?,
        acknowledged: row.get(11)?,
        acknowledged_at: row.get(12)?,
        parent_notification_id: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn queue() -> NotificationQueue {
        let conn = Connection::open_in_memory().expect("in-memory db");
        init_db(&conn).expect("schema");
        NotificationQueue::new(conn)
    }

    fn notification(priority: Priority, message: &str) -> NewNotification {
        NewNotification {
            user_id: "alice".into(),
            target_medium: "discord".into(),
            target_location: "123".into(),
            message: message.into(),
            priority,
            routing_reasoning: "test".into(),
            parent_notification_id: None,
            context: TriggerContext::default(),
        }
    }

    #[test]
    fn pending_orders_alerts_before_conversations() {
        let queue = queue();
        queue
            .create(&notification(Priority::Conversation, "chat?"))
            .unwrap();
        queue
            .create(&notification(Priority::Alert, "3 overdue tasks"))
            .unwrap();
        queue
            .create(&notification(Priority::Conversation, "still there?"))
            .unwrap();

        let pending = queue.pending("discord").unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].message, "3 overdue tasks");
        // Same priority keeps insertion order.
        assert_eq!(pending[1].message, "chat?");
        assert_eq!(pending[2].message, "still there?");
    }

    #[test]
    fn delivered_rows_leave_the_pending_queue() {
        let queue = queue();
        let id = queue.create(&notification(Priority::Alert, "ping")).unwrap();
        queue.mark_delivered(id).unwrap();
        assert!(queue.pending("discord").unwrap().is_empty());

        let row = queue.get(id).unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Delivered);
        assert!(row.delivered_at.is_some());
    }

    #[test]
    fn mark_delivered_is_idempotent() {
        let queue = queue();
        let id = queue.create(&notification(Priority::Alert, "ping")).unwrap();
        queue.mark_delivered(id).unwrap();
        let first = queue.get(id).unwrap().unwrap().delivered_at;

        queue.mark_delivered(id).unwrap();
        let second = queue.get(id).unwrap().unwrap().delivered_at;
        assert_eq!(first, second);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let queue = queue();
        let id = queue.create(&notification(Priority::Alert, "ping")).unwrap();
        queue.mark_delivered(id).unwrap();
        queue.acknowledge(id).unwrap();
        let first = queue.get(id).unwrap().unwrap().acknowledged_at;

        queue.acknowledge(id).unwrap();
        let second = queue.get(id).unwrap().unwrap().acknowledged_at;
        assert_eq!(first, second);
    }

    #[test]
    fn acknowledge_unknown_id_errors() {
        let queue = queue();
        assert!(matches!(
            queue.acknowledge(999),
            Err(NotifyError::NotFound { id: 999 })
        ));
    }

    #[test]
    fn recent_unacknowledged_filters_status_and_ack() {
        let queue = queue();
        let delivered = queue.create(&notification(Priority::Alert, "a")).unwrap();
        let acked = queue.create(&notification(Priority::Alert, "b")).unwrap();
        let _pending = queue.create(&notification(Priority::Alert, "c")).unwrap();

        queue.mark_delivered(delivered).unwrap();
        queue.mark_delivered(acked).unwrap();
        queue.acknowledge(acked).unwrap();

        let rows = queue
            .recent_unacknowledged("alice", "2000-01-01T00:00:00+00:00")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, delivered);
    }

    #[test]
    fn chain_root_walks_parent_links() {
        let queue = queue();
        let root = queue.create(&notification(Priority::Alert, "first")).unwrap();
        let mut child = notification(Priority::Alert, "second");
        child.parent_notification_id = Some(root);
        let child_id = queue.create(&child).unwrap();
        let mut grandchild = notification(Priority::Alert, "third");
        grandchild.parent_notification_id = Some(child_id);
        let grandchild_id = queue.create(&grandchild).unwrap();

        assert_eq!(queue.chain_root(grandchild_id).unwrap(), root);
        assert_eq!(queue.chain_root(root).unwrap(), root);
    }

    #[test]
    fn context_round_trips() {
        let queue = queue();
        let mut new = notification(Priority::Conversation, "hello");
        new.context = TriggerContext {
            trigger_type: Some("ambient_mission".into()),
            trigger_id: None,
            trigger_data: None,
            context_snapshot: Some(serde_json::json!({"activity": {"app": "firefox"}})),
        };
        let id = queue.create(&new).unwrap();

        let ctx = queue.context(id).unwrap().unwrap();
        assert_eq!(ctx.trigger_type.as_deref(), Some("ambient_mission"));
        assert_eq!(
            ctx.context_snapshot.unwrap()["activity"]["app"],
            serde_json::json!("firefox")
        );
    }

    #[test]
    fn invalid_since_timestamp_is_rejected() {
        let queue = queue();
        assert!(queue.recent_unacknowledged("alice", "not-a-time").is_err());
    }
}
