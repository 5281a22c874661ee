use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, instrument};

use crate::error::{CuriosityError, Result};
use crate::types::{
    CuriosityType, ExplorationResult, Finding, ProjectTask, TaskExtra, TaskStatus,
};

const CURIOSITY: &str = "curiosity";

/// Store for the curiosity backlog and its exploration findings.
///
/// SQLite has no `FOR UPDATE SKIP LOCKED`; the single-statement
/// `UPDATE … WHERE id IN (SELECT …) RETURNING` claim is atomic on this
/// connection, which is the only exploration worker by construction.
pub struct CuriosityStore {
    db: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, working_dir, title, description, task_type, priority, status, \
     created_at, updated_at, started_at, completed_at, attempt_count, last_error, \
     discovered_from_task_id, discovery_reason, extra";

impl CuriosityStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Latest non-terminal curiosity task matching `title` case-insensitively.
    pub fn find_active_by_title(&self, title: &str) -> Result<Option<ProjectTask>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM project_tasks
                 WHERE task_type = ?1 AND lower(title) = lower(?2)
                   AND status NOT IN ('done', 'cancelled')
                 ORDER BY created_at DESC LIMIT 1"
            ),
            rusqlite::params![CURIOSITY, title],
            row_to_task,
        )
        .optional()
        .map_err(CuriosityError::Database)
    }

    /// True when any curiosity task with this title exists, terminal or not.
    pub fn title_exists(&self, title: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let found: Option<i64> = db
            .query_row(
                "SELECT id FROM project_tasks
                 WHERE task_type = ?1 AND lower(title) = lower(?2) LIMIT 1",
                rusqlite::params![CURIOSITY, title],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, description, extra), fields(title))]
    pub fn insert_task(
        &self,
        working_dir: &str,
        title: &str,
        description: &str,
        priority: i64,
        status: TaskStatus,
        discovered_from_task_id: Option<i64>,
        discovery_reason: Option<&str>,
        extra: &TaskExtra,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO project_tasks
             (working_dir, title, description, task_type, priority, status,
              created_at, updated_at, discovered_from_task_id, discovery_reason, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                working_dir,
                title,
                description,
                CURIOSITY,
                priority,
                status.as_str(),
                now,
                discovered_from_task_id,
                discovery_reason,
                serde_json::to_string(extra).unwrap_or_else(|_| "{}".to_string()),
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(task_id = id, priority, "curiosity task created");
        Ok(id)
    }

    /// Bump an existing task on re-trigger. Priority never decreases.
    pub fn bump_task(&self, id: i64, priority: i64, extra: &TaskExtra) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE project_tasks
             SET priority = max(priority, ?1), extra = ?2, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![
                priority,
                serde_json::to_string(extra).unwrap_or_else(|_| "{}".to_string()),
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(CuriosityError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Any ready curiosity work waiting?
    pub fn has_pending(&self) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let found: Option<i64> = db
            .query_row(
                "SELECT id FROM project_tasks
                 WHERE task_type = ?1 AND status = 'ready' LIMIT 1",
                [CURIOSITY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Atomically claim the highest-priority ready task: transition to
    /// in_progress, stamp started_at, count the attempt.
    pub fn claim_next(&self) -> Result<Option<ProjectTask>> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        db.query_row(
            &format!(
                "UPDATE project_tasks
                 SET status = 'in_progress', started_at = ?1, updated_at = ?1,
                     attempt_count = attempt_count + 1
                 WHERE id IN (
                     SELECT id FROM project_tasks
                     WHERE task_type = ?2 AND status = 'ready'
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1
                 )
                 RETURNING {TASK_COLUMNS}"
            ),
            rusqlite::params![now, CURIOSITY],
            row_to_task,
        )
        .optional()
        .map_err(CuriosityError::Database)
    }

    pub fn get(&self, id: i64) -> Result<Option<ProjectTask>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM project_tasks WHERE id = ?1"),
            [id],
            row_to_task,
        )
        .optional()
        .map_err(CuriosityError::Database)
    }

    /// All pending curiosity tasks (optionally one user's) for limit
    /// enforcement.
    pub fn pending_tasks(&self, user_id: Option<&str>) -> Result<Vec<ProjectTask>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM project_tasks
             WHERE task_type = ?1 AND status IN ('backlog', 'ready', 'blocked')"
        ))?;
        let rows = stmt.query_map([CURIOSITY], row_to_task)?;
        let mut tasks: Vec<ProjectTask> = rows.filter_map(|r| r.ok()).collect();
        if let Some(user_id) = user_id {
            tasks.retain(|t| t.extra.user_id.as_deref() == Some(user_id));
        }
        Ok(tasks)
    }

    /// Cancel a task as pruned by the backlog bounds.
    pub fn prune_task(&self, id: i64, reason: &str) -> Result<()> {
        let mut task = self.get(id)?.ok_or(CuriosityError::TaskNotFound { id })?;
        let now = Utc::now().to_rfc3339();
        task.extra.pruned_at = Some(now.clone());
        if task.extra.pruned_reason.is_none() {
            task.extra.pruned_reason = Some(reason.to_string());
        }

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE project_tasks
             SET status = 'cancelled', last_error = 'pruned by backlog limits',
                 extra = ?1, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![
                serde_json::to_string(&task.extra).unwrap_or_else(|_| "{}".to_string()),
                now,
                id,
            ],
        )?;
        Ok(())
    }

    /// Reset in_progress curiosity tasks whose attempt crashed: anything
    /// started more than `grace_hours` ago goes back to ready. Run at
    /// startup, after which the normal claim cycle picks them up again.
    pub fn reset_stalled(&self, grace_hours: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::hours(grace_hours)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let reset = db.execute(
            "UPDATE project_tasks
             SET status = 'ready', last_error = 'reset after stalled attempt', updated_at = ?1
             WHERE task_type = ?2 AND status = 'in_progress' AND started_at <= ?3",
            rusqlite::params![Utc::now().to_rfc3339(), CURIOSITY, cutoff],
        )?;
        if reset > 0 {
            info!(reset, "stalled curiosity tasks returned to ready");
        }
        Ok(reset)
    }

    /// Write back an exploration outcome.
    ///
    /// Success marks the task done with merged findings; failure re-marks it
    /// ready so a later pass can retry, recording the error.
    pub fn persist_result(
        &self,
        task_id: i64,
        result: Option<&ExplorationResult>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut task = self
            .get(task_id)?
            .ok_or(CuriosityError::TaskNotFound { id: task_id })?;
        let now = Utc::now().to_rfc3339();

        match result {
            Some(result) => {
                task.extra.findings = merge_findings(&task.extra.findings, &result.findings);
                task.extra.exploration_count += 1;
                task.extra.last_explored_at = Some(now.clone());
                task.extra.satisfaction_level =
                    task.extra.satisfaction_level.max(result.confidence);
                task.extra.last_exploration_result = Some(result.clone());

                let db = self.db.lock().unwrap();
                db.execute(
                    "UPDATE project_tasks
                     SET status = 'done', completed_at = ?1, updated_at = ?1,
                         last_error = NULL, extra = ?2
                     WHERE id = ?3",
                    rusqlite::params![
                        now,
                        serde_json::to_string(&task.extra).unwrap_or_else(|_| "{}".to_string()),
                        task_id,
                    ],
                )?;
            }
            None => {
                let db = self.db.lock().unwrap();
                db.execute(
                    "UPDATE project_tasks
                     SET status = 'ready', updated_at = ?1, last_error = ?2
                     WHERE id = ?3",
                    rusqlite::params![
                        now,
                        error_message.unwrap_or("exploration failed"),
                        task_id,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Insert findings that are not already recorded for this task.
    pub fn store_findings(
        &self,
        task: &ProjectTask,
        user_id: &str,
        result: &ExplorationResult,
    ) -> Result<usize> {
        let unique: Vec<&String> = {
            let mut seen = std::collections::HashSet::new();
            result
                .findings
                .iter()
                .filter(|f| !f.trim().is_empty() && seen.insert(f.trim().to_string()))
                .collect()
        };
        if unique.is_empty() {
            return Ok(0);
        }

        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;
        for finding in unique {
            let exists: Option<i64> = db
                .query_row(
                    "SELECT id FROM exploration_findings
                     WHERE task_id = ?1 AND finding = ?2 LIMIT 1",
                    rusqlite::params![task.id, finding],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }
            db.execute(
                "INSERT INTO exploration_findings
                 (task_id, user_id, finding, source_context, confidence,
                  worth_sharing, share_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    task.id,
                    user_id,
                    finding,
                    task.extra.source_context,
                    result.confidence,
                    result.worth_sharing,
                    result.share_message,
                    now,
                ],
            )?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn findings_for_task(&self, task_id: i64) -> Result<Vec<Finding>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, task_id, user_id, finding, source_context, confidence,
                    worth_sharing, share_message, created_at
             FROM exploration_findings WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            Ok(Finding {
                id: row.get(0)?,
                task_id: row.get(1)?,
                user_id: row.get(2)?,
                finding: row.get(3)?,
                source_context: row.get(4)?,
                confidence: row.get(5)?,
                worth_sharing: row.get(6)?,
                share_message: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record graph fact ids for promoted findings.
    pub fn record_promotions(&self, task_id: i64, fact_ids: &[String]) -> Result<()> {
        let mut task = self
            .get(task_id)?
            .ok_or(CuriosityError::TaskNotFound { id: task_id })?;
        for id in fact_ids {
            if !task.extra.promoted_fact_ids.contains(id) {
                task.extra.promoted_fact_ids.push(id.clone());
            }
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE project_tasks SET extra = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![
                serde_json::to_string(&task.extra).unwrap_or_else(|_| "{}".to_string()),
                Utc::now().to_rfc3339(),
                task_id,
            ],
        )?;
        Ok(())
    }

    /// Spawn a research-chain follow-up, deduped by title across all
    /// curiosity tasks.
    pub fn spawn_follow_up(&self, parent: &ProjectTask, question: &str) -> Result<Option<i64>> {
        if self.title_exists(question)? {
            return Ok(None);
        }
        let extra = TaskExtra {
            curiosity_type: Some(CuriosityType::ResearchChain),
            source_context: Some(parent.title.clone()),
            trigger_reason: Some("follow_up_from_exploration".to_string()),
            user_id: parent.extra.user_id.clone(),
            trigger_count: 1,
            last_triggered_at: Some(Utc::now().to_rfc3339()),
            ..Default::default()
        };
        let id = self.insert_task(
            &parent.working_dir,
            question,
            &format!("Follow-up from exploration of '{}'", parent.title),
            crate::priority::to_task_priority(
                crate::priority::compute_priority(
                    &crate::types::CuriositySignal::new(
                        CuriosityType::ResearchChain,
                        question,
                        parent.title.clone(),
                        "follow_up_from_exploration",
                        0.4,
                    ),
                    0,
                    1.0,
                )
                .0,
            ),
            TaskStatus::Ready,
            Some(parent.id),
            Some("research_chain"),
            &extra,
        )?;
        Ok(Some(id))
    }
}

fn merge_findings(existing: &[String], new: &[String]) -> Vec<String> {
    let mut merged = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for item in existing.iter().chain(new.iter()) {
        let normalized = item.trim();
        if normalized.is_empty() || !seen.insert(normalized.to_string()) {
            continue;
        }
        merged.push(normalized.to_string());
    }
    merged
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectTask> {
    let status: String = row.get(6)?;
    let extra_json: String = row.get(15)?;
    Ok(ProjectTask {
        id: row.get(0)?,
        working_dir: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        task_type: row.get(4)?,
        priority: row.get(5)?,
        status: status.parse().unwrap_or(TaskStatus::Backlog),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        attempt_count: row.get(11)?,
        last_error: row.get(12)?,
        discovered_from_task_id: row.get(13)?,
        discovery_reason: row.get(14)?,
        extra: serde_json::from_str(&extra_json).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CuriosityStore {
        let conn = Connection::open_in_memory().expect("in-memory db");
        crate::db::init_db(&conn).expect("schema");
        CuriosityStore::new(conn)
    }

    fn insert_ready(store: &CuriosityStore, title: &str, priority: i64) -> i64 {
        store
            .insert_task(
                "/tmp",
                title,
                "d",
                priority,
                TaskStatus::Ready,
                None,
                None,
                &TaskExtra::default(),
            )
            .unwrap()
    }

    #[test]
    fn claim_takes_highest_priority_first() {
        let store = store();
        insert_ready(&store, "low", 10);
        let high = insert_ready(&store, "high", 90);

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, high);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.started_at.is_some());

        // The claimed task is no longer claimable.
        let next = store.claim_next().unwrap().unwrap();
        assert_eq!(next.title, "low");
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn stalled_in_progress_tasks_reset_to_ready() {
        let store = store();
        insert_ready(&store, "topic", 50);
        store.claim_next().unwrap();

        // Grace of zero hours treats the fresh claim as stalled.
        assert_eq!(store.reset_stalled(0).unwrap(), 1);
        let reclaimed = store.claim_next().unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn persist_success_merges_findings_and_completes() {
        let store = store();
        let id = insert_ready(&store, "topic", 50);
        store.claim_next().unwrap();

        let result = ExplorationResult {
            findings: vec!["a".into(), "b".into(), "a".into()],
            confidence: 0.85,
            follow_up_questions: vec![],
            worth_sharing: true,
            share_message: None,
        };
        store.persist_result(id, Some(&result), None).unwrap();

        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.extra.findings, vec!["a", "b"]);
        assert_eq!(task.extra.exploration_count, 1);
        assert!((task.extra.satisfaction_level - 0.85).abs() < 1e-9);

        // Second exploration with lower confidence keeps the higher level.
        let weaker = ExplorationResult {
            findings: vec!["b".into(), "c".into()],
            confidence: 0.3,
            ..result
        };
        store.persist_result(id, Some(&weaker), None).unwrap();
        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.extra.findings, vec!["a", "b", "c"]);
        assert!((task.extra.satisfaction_level - 0.85).abs() < 1e-9);
    }

    #[test]
    fn persist_failure_remarks_ready_with_error() {
        let store = store();
        let id = insert_ready(&store, "topic", 50);
        store.claim_next().unwrap();
        store
            .persist_result(id, None, Some("failed to parse exploration output"))
            .unwrap();

        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(
            task.last_error.as_deref(),
            Some("failed to parse exploration output")
        );
    }

    #[test]
    fn findings_are_deduped_across_explorations() {
        let store = store();
        let id = insert_ready(&store, "topic", 50);
        let task = store.claim_next().unwrap().unwrap();

        let result = ExplorationResult {
            findings: vec!["fact one".into(), "fact two".into()],
            confidence: 0.9,
            follow_up_questions: vec![],
            worth_sharing: false,
            share_message: None,
        };
        assert_eq!(store.store_findings(&task, "alice", &result).unwrap(), 2);
        assert_eq!(store.store_findings(&task, "alice", &result).unwrap(), 0);
        assert_eq!(store.findings_for_task(id).unwrap().len(), 2);
    }

    #[test]
    fn follow_ups_dedupe_by_title() {
        let store = store();
        let id = insert_ready(&store, "origin", 60);
        let parent = store.get(id).unwrap().unwrap();

        let first = store.spawn_follow_up(&parent, "why is it so?").unwrap();
        assert!(first.is_some());
        let dup = store.spawn_follow_up(&parent, "Why is it so?").unwrap();
        assert!(dup.is_none());

        let spawned = store.get(first.unwrap()).unwrap().unwrap();
        assert_eq!(spawned.discovered_from_task_id, Some(id));
        assert_eq!(
            spawned.extra.curiosity_type,
            Some(CuriosityType::ResearchChain)
        );
    }

    #[test]
    fn title_lookup_is_case_insensitive_and_skips_terminal() {
        let store = store();
        let id = insert_ready(&store, "Purple Things", 40);
        assert!(store.find_active_by_title("purple things").unwrap().is_some());

        store.claim_next().unwrap();
        store
            .persist_result(
                id,
                Some(&ExplorationResult {
                    findings: vec![],
                    confidence: 0.5,
                    follow_up_questions: vec![],
                    worth_sharing: false,
                    share_message: None,
                }),
                None,
            )
            .unwrap();
        // Done tasks are treated as absent so the topic can come back.
        assert!(store.find_active_by_title("purple things").unwrap().is_none());
    }
}
