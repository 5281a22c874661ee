use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use dere_core::types::MessageRole;

use crate::backlog::CuriosityStore;
use crate::error::Result;
use crate::priority::{compute_priority, repeat_bonus, to_task_priority};
use crate::types::{CuriositySignal, ProjectTask, TaskExtra, TaskStatus};

use super::corrections::detect_correction;
use super::emotions::detect_emotional_peak;
use super::entities::{detect_unfamiliar_entities, EntityNode};
use super::knowledge_gap::detect_knowledge_gap;
use super::unfinished_thread::detect_unfinished_thread;

const MAX_PENDING: usize = 100;
const MAX_PER_TYPE: usize = 25;
const PRUNE_SCORE_THRESHOLD: i64 = 15; // 0.15 on the 0..100 scale

/// A conversation turn as seen by the trigger collector. The caller supplies
/// adjacent turns — the collector does not read conversation history itself.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub prompt: String,
    pub role: MessageRole,
    pub conversation_id: i64,
    pub working_dir: String,
    pub user_id: Option<String>,
    pub personality: Option<String>,
    pub speaker_name: Option<String>,
    pub is_command: bool,
    pub entities: Vec<EntityNode>,
    pub previous_assistant: Option<String>,
    pub previous_user: Option<String>,
}

/// Runs every detector over a conversation turn and upserts the resulting
/// curiosity tasks, enforcing backlog bounds on each pass.
pub struct TriggerCollector {
    store: Arc<CuriosityStore>,
}

impl TriggerCollector {
    pub fn new(store: Arc<CuriosityStore>) -> Self {
        Self { store }
    }

    /// Process one turn. Returns the number of newly created tasks.
    #[instrument(skip(self, turn), fields(role = turn.role.as_str(), conversation_id = turn.conversation_id))]
    pub fn process(&self, turn: &TurnContext) -> Result<usize> {
        let text = turn.prompt.trim();
        if text.is_empty() || text.chars().count() < 6 {
            return Ok(0);
        }
        if turn.role == MessageRole::User && turn.is_command {
            return Ok(0);
        }

        let signals = self.collect_signals(turn, text);
        if signals.is_empty() {
            return Ok(0);
        }

        self.enforce_backlog_limits(turn.user_id.as_deref())?;

        let mut created = 0;
        let mut seen_topics: HashSet<String> = HashSet::new();
        for signal in &signals {
            let normalized = normalize_topic(&signal.topic);
            if !seen_topics.insert(normalized) {
                continue;
            }

            info!(
                curiosity_type = signal.curiosity_type.as_str(),
                topic = %signal.topic,
                reason = %signal.trigger_reason,
                "curiosity trigger"
            );
            created += self.upsert_task(signal, turn)?;
        }

        if created > 0 {
            info!(created, total_signals = signals.len(), "curiosity triggers stored");
        }
        Ok(created)
    }

    fn collect_signals(&self, turn: &TurnContext, text: &str) -> Vec<CuriositySignal> {
        let mut signals = Vec::new();
        match turn.role {
            MessageRole::User => {
                signals.extend(detect_unfamiliar_entities(
                    text,
                    &turn.entities,
                    turn.speaker_name.as_deref(),
                    turn.personality.as_deref(),
                ));
                if let Some(signal) =
                    detect_correction(text, turn.previous_assistant.as_deref())
                {
                    signals.push(signal);
                }
                if let Some(signal) = detect_emotional_peak(text) {
                    signals.push(signal);
                }
                if let Some(signal) =
                    detect_unfinished_thread(text, turn.previous_assistant.as_deref())
                {
                    signals.push(signal);
                }
            }
            MessageRole::Assistant => {
                if let Some(signal) = detect_knowledge_gap(text, turn.previous_user.as_deref()) {
                    signals.push(signal);
                }
            }
            MessageRole::System => {}
        }
        signals
    }

    /// Upsert keyed by lowercase title. Terminal tasks are treated as absent
    /// so an old topic can resurface as a fresh task.
    fn upsert_task(&self, signal: &CuriositySignal, turn: &TurnContext) -> Result<usize> {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.store.find_active_by_title(&signal.topic)? {
            let trigger_count = existing.extra.trigger_count + 1;
            let recency = recency_factor(&existing, signal.curiosity_type.ttl_days());
            let (mut score, mut factors) =
                compute_priority(signal, existing.extra.exploration_count, recency);
            let bonus = repeat_bonus(trigger_count);
            score = (score + bonus).min(1.0);
            factors.insert("repeat_bonus".into(), bonus.into());

            let mut extra = merged_extra(existing.extra.clone(), signal, turn, &now);
            extra.trigger_count = trigger_count;
            extra.priority_factors = factors;

            self.store
                .bump_task(existing.id, to_task_priority(score), &extra)?;
            info!(
                task_id = existing.id,
                curiosity_type = signal.curiosity_type.as_str(),
                triggers = trigger_count,
                "curiosity task re-triggered"
            );
            return Ok(0);
        }

        let (score, factors) = compute_priority(signal, 0, 1.0);
        let mut extra = merged_extra(TaskExtra::default(), signal, turn, &now);
        extra.trigger_count = 1;
        extra.priority_factors = factors;

        self.store.insert_task(
            &turn.working_dir,
            &signal.topic,
            &format!("Curiosity trigger: {}", signal.trigger_reason),
            to_task_priority(score),
            TaskStatus::Ready,
            None,
            None,
            &extra,
        )?;
        Ok(1)
    }

    /// Backlog bounds, enforced per insert pass:
    /// decayed low-value tasks prune out, then total and per-type caps drop
    /// the lowest-priority overflow.
    fn enforce_backlog_limits(&self, user_id: Option<&str>) -> Result<()> {
        let tasks = self.store.pending_tasks(user_id)?;
        if tasks.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut to_cancel: HashSet<i64> = HashSet::new();

        for task in &tasks {
            let ttl_days = task
                .curiosity_type()
                .map(|t| t.ttl_days())
                .unwrap_or(14.0);
            if task_age_days(task, now) > ttl_days && task.priority < PRUNE_SCORE_THRESHOLD {
                to_cancel.insert(task.id);
            }
        }

        let mut remaining: Vec<&ProjectTask> =
            tasks.iter().filter(|t| !to_cancel.contains(&t.id)).collect();
        if remaining.len() > MAX_PENDING {
            let overflow = remaining.len() - MAX_PENDING;
            for task in lowest_priority(&remaining).into_iter().take(overflow) {
                to_cancel.insert(task.id);
            }
            remaining.retain(|t| !to_cancel.contains(&t.id));
        }

        let mut by_type: std::collections::HashMap<&str, Vec<&ProjectTask>> =
            std::collections::HashMap::new();
        for task in &remaining {
            let key = task
                .curiosity_type()
                .map(|t| t.as_str())
                .unwrap_or("unknown");
            by_type.entry(key).or_default().push(task);
        }
        for bucket in by_type.values() {
            if bucket.len() <= MAX_PER_TYPE {
                continue;
            }
            let overflow = bucket.len() - MAX_PER_TYPE;
            for task in lowest_priority(bucket).into_iter().take(overflow) {
                to_cancel.insert(task.id);
            }
        }

        for id in to_cancel {
            self.store.prune_task(id, "backlog_limits")?;
        }
        Ok(())
    }
}

fn lowest_priority<'a>(tasks: &[&'a ProjectTask]) -> Vec<&'a ProjectTask> {
    let mut sorted: Vec<&ProjectTask> = tasks.to_vec();
    sorted.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    sorted
}

fn task_age_days(task: &ProjectTask, now: chrono::DateTime<Utc>) -> f64 {
    let reference = task
        .extra
        .last_triggered_at
        .as_deref()
        .unwrap_or(&task.created_at);
    match chrono::DateTime::parse_from_rfc3339(reference) {
        Ok(at) => (now - at.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0,
        Err(_) => 0.0,
    }
}

fn recency_factor(task: &ProjectTask, ttl_days: f64) -> f64 {
    let age = task_age_days(task, Utc::now());
    (1.0 - age / ttl_days).max(0.0)
}

fn normalize_topic(topic: &str) -> String {
    topic.trim().to_lowercase()
}

fn merged_extra(
    mut extra: TaskExtra,
    signal: &CuriositySignal,
    turn: &TurnContext,
    now: &str,
) -> TaskExtra {
    extra.curiosity_type = Some(signal.curiosity_type);
    extra.source_context = Some(signal.source_context.clone());
    extra.trigger_reason = Some(signal.trigger_reason.clone());
    extra.last_triggered_at = Some(now.to_string());
    extra.user_id = turn.user_id.clone();
    extra.conversation_id = Some(turn.conversation_id);
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn collector() -> (TriggerCollector, Arc<CuriosityStore>) {
        let conn = Connection::open_in_memory().expect("in-memory db");
        crate::db::init_db(&conn).expect("schema");
        let store = Arc::new(CuriosityStore::new(conn));
        (TriggerCollector::new(store.clone()), store)
    }

    fn user_turn(prompt: &str) -> TurnContext {
        TurnContext {
            prompt: prompt.to_string(),
            role: MessageRole::User,
            conversation_id: 1,
            working_dir: "/tmp".to_string(),
            user_id: Some("alice".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn emotional_message_creates_ready_task() {
        let (collector, store) = collector();
        let created = collector.process(&user_turn("I LOVE purple!!")).unwrap();
        assert_eq!(created, 1);

        let task = store.find_active_by_title("I LOVE purple!!").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.priority, 66);
        assert_eq!(task.extra.trigger_count, 1);
        assert_eq!(
            task.extra.curiosity_type,
            Some(crate::types::CuriosityType::EmotionalPeak)
        );
    }

    #[test]
    fn retrigger_bumps_count_and_never_lowers_priority() {
        let (collector, store) = collector();
        collector.process(&user_turn("I LOVE purple!!")).unwrap();
        let before = store.find_active_by_title("i love purple!!").unwrap().unwrap();

        let created = collector.process(&user_turn("I LOVE purple!!")).unwrap();
        assert_eq!(created, 0);
        let after = store.find_active_by_title("i love purple!!").unwrap().unwrap();
        assert_eq!(after.extra.trigger_count, 2);
        assert!(after.priority >= before.priority);
        assert!(after.extra.priority_factors.contains_key("repeat_bonus"));
    }

    #[test]
    fn commands_and_short_messages_are_skipped() {
        let (collector, _) = collector();
        let mut turn = user_turn("/remind me to buy purple paint, I love it!!");
        turn.is_command = true;
        assert_eq!(collector.process(&turn).unwrap(), 0);
        assert_eq!(collector.process(&user_turn("hey")).unwrap(), 0);
    }

    #[test]
    fn assistant_turns_only_run_the_knowledge_gap_detector() {
        let (collector, store) = collector();
        let turn = TurnContext {
            prompt: "I'm not sure about the history of that protocol".to_string(),
            role: MessageRole::Assistant,
            conversation_id: 2,
            working_dir: "/tmp".to_string(),
            previous_user: Some("tell me about gopher".to_string()),
            ..Default::default()
        };
        assert_eq!(collector.process(&turn).unwrap(), 1);
        let task = store
            .find_active_by_title("the history of that protocol")
            .unwrap()
            .unwrap();
        assert_eq!(
            task.extra.curiosity_type,
            Some(crate::types::CuriosityType::KnowledgeGap)
        );
    }

    #[test]
    fn duplicate_topics_in_one_turn_collapse() {
        let (collector, _) = collector();
        // Emotional peak and correction can both yield the same full-text topic.
        let mut turn = user_turn("No, I love it, it's actually amazing!!");
        turn.previous_assistant = Some("You seemed unhappy with it?".to_string());
        let created = collector.process(&turn).unwrap();
        assert!(created >= 1);
    }

    #[test]
    fn per_type_cap_prunes_lowest_priority_overflow() {
        let (collector, store) = collector();
        // Fill beyond the per-type cap with ascending priorities.
        for i in 0..(MAX_PER_TYPE + 5) {
            store
                .insert_task(
                    "/tmp",
                    &format!("topic {i}"),
                    "d",
                    i as i64,
                    TaskStatus::Ready,
                    None,
                    None,
                    &TaskExtra {
                        curiosity_type: Some(crate::types::CuriosityType::UnfamiliarEntity),
                        user_id: Some("alice".to_string()),
                        trigger_count: 1,
                        last_triggered_at: Some(Utc::now().to_rfc3339()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        collector.process(&user_turn("I LOVE purple!!")).unwrap();

        let pending = store.pending_tasks(Some("alice")).unwrap();
        let entity_tasks = pending
            .iter()
            .filter(|t| {
                t.extra.curiosity_type == Some(crate::types::CuriosityType::UnfamiliarEntity)
            })
            .count();
        assert_eq!(entity_tasks, MAX_PER_TYPE);
    }
}
