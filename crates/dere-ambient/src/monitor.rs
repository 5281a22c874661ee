use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use dere_agent::service::EmotionSource;
use dere_core::config::AmbientConfig;
use dere_core::types::Priority;
use dere_curiosity::explorer::parse_mission_output;
use dere_curiosity::mission::MissionRunner;
use dere_curiosity::Explorer;
use dere_notify::types::{NewNotification, TriggerContext};
use dere_notify::NotificationQueue;

use crate::activity::{ActivitySnapshot, ActivitySource};
use crate::analyzer::{ContextAnalyzer, TaskSource};
use crate::fsm::{
    ActivityData, AmbientFsm, AmbientState, BondData, EmotionData, SignalInputs, TaskData,
};

const ESCALATION_LOOKBACK_HOURS: i64 = 12;
const MISSION_CONFIDENCE_FLOOR: f64 = 0.5;

/// Relationship-state collaborator feeding the bond signal.
#[async_trait]
pub trait BondSource: Send + Sync {
    async fn bond(&self) -> BondData;
}

/// Structured answer expected from an ambient mission.
#[derive(Debug, Deserialize)]
struct MissionDecision {
    #[serde(default)]
    send: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    confidence: f64,
}

/// Cloneable handle for feeding external events into the monitor's FSM —
/// acknowledgment arrival in particular.
#[derive(Clone)]
pub struct AmbientHandle {
    fsm: Option<Arc<Mutex<AmbientFsm>>>,
}

impl AmbientHandle {
    pub fn record_acknowledgment(&self) {
        if let Some(fsm) = &self.fsm {
            fsm.lock().unwrap().record_acknowledgment();
        }
    }

    pub fn state(&self) -> Option<AmbientState> {
        self.fsm.as_ref().map(|f| f.lock().unwrap().state)
    }
}

/// Tracks how long the user has continuously been in the same window.
///
/// The streak key is `(app, title)`, so a title change resets the streak —
/// switching browser tabs counts as switching activity.
#[derive(Default)]
struct ActivityStreak {
    key: Option<(String, String)>,
    seconds: f64,
    updated_at: Option<DateTime<Utc>>,
}

impl ActivityStreak {
    /// Fold the latest snapshot in. The returned snapshot carries the
    /// streak as its duration so downstream signals see continuity, not
    /// just the lookback window.
    fn update(
        &mut self,
        activity: Option<ActivitySnapshot>,
        now: DateTime<Utc>,
    ) -> Option<ActivitySnapshot> {
        let Some(mut activity) = activity else {
            self.key = None;
            self.seconds = 0.0;
            self.updated_at = Some(now);
            return None;
        };

        let app = activity.app.trim().to_string();
        let title = activity.title.trim().to_string();
        if app.is_empty() && title.is_empty() {
            self.key = None;
            self.seconds = 0.0;
            self.updated_at = Some(now);
            return Some(activity);
        }

        let key = (app, title);
        if self.key.as_ref() == Some(&key) {
            if let Some(updated_at) = self.updated_at {
                let delta = (now - updated_at).num_seconds();
                if delta > 0 {
                    self.seconds += delta as f64;
                }
            }
        } else {
            self.key = Some(key);
            self.seconds = activity.duration_seconds;
        }
        self.updated_at = Some(now);

        activity.duration_seconds = self.seconds;
        Some(activity)
    }
}

/// Clamp the activity lookback to [10 min, activity_lookback_hours].
fn clamp_lookback_minutes(
    last_check_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    fallback_minutes: u64,
    max_hours: u64,
) -> u64 {
    let max_lookback = (max_hours * 60).max(10);
    let delta = match last_check_at {
        Some(at) => ((now - at).num_seconds() / 60).max(0) as u64,
        None => fallback_minutes,
    };
    delta.clamp(10, max_lookback)
}

/// Single long-running ambient loop for one user.
///
/// Per iteration: refresh activity and streaks, evaluate FSM transitions,
/// then either explore a curiosity task or consider proactive engagement.
/// Per-iteration errors are logged, never fatal.
pub struct AmbientMonitor {
    config: AmbientConfig,
    fsm: Option<Arc<Mutex<AmbientFsm>>>,
    analyzer: ContextAnalyzer,
    activity: Arc<dyn ActivitySource>,
    missions: Arc<dyn MissionRunner>,
    notifications: Arc<NotificationQueue>,
    explorer: Option<Arc<Explorer>>,
    emotion: Option<Arc<dyn EmotionSource>>,
    tasks: Option<Arc<dyn TaskSource>>,
    bond: Option<Arc<dyn BondSource>>,

    last_check_at: Option<DateTime<Utc>>,
    streak: ActivityStreak,
    last_exploration_at: Option<DateTime<Utc>>,
    exploration_day: Option<NaiveDate>,
    explorations_today: u32,
}

impl AmbientMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AmbientConfig,
        analyzer: ContextAnalyzer,
        activity: Arc<dyn ActivitySource>,
        missions: Arc<dyn MissionRunner>,
        notifications: Arc<NotificationQueue>,
        explorer: Option<Arc<Explorer>>,
        emotion: Option<Arc<dyn EmotionSource>>,
        tasks: Option<Arc<dyn TaskSource>>,
        bond: Option<Arc<dyn BondSource>>,
    ) -> Self {
        let fsm = if config.fsm_enabled {
            info!("ambient FSM initialized");
            Some(Arc::new(Mutex::new(AmbientFsm::from_config(&config))))
        } else {
            info!("ambient FSM disabled, using fixed intervals");
            None
        };

        if config.exploring.enabled && explorer.is_none() {
            warn!("ambient exploration enabled but no explorer configured");
        }

        Self {
            config,
            fsm,
            analyzer,
            activity,
            missions,
            notifications,
            explorer,
            emotion,
            tasks,
            bond,
            last_check_at: None,
            streak: ActivityStreak::default(),
            last_exploration_at: None,
            exploration_day: None,
            explorations_today: 0,
        }
    }

    /// Handle for wiring external signals (acknowledgments) into the FSM.
    pub fn handle(&self) -> AmbientHandle {
        AmbientHandle {
            fsm: self.fsm.clone(),
        }
    }

    /// Main loop. Runs until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("ambient monitoring disabled in config");
            return;
        }

        info!(
            idle_threshold_minutes = self.config.idle_threshold_minutes,
            min_notification_interval_minutes = self.config.min_notification_interval_minutes,
            "ambient monitor starting"
        );

        if self.config.startup_delay_seconds > 0 {
            info!(
                delay = self.config.startup_delay_seconds,
                "delaying first ambient check"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.startup_delay_seconds)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        self.validate_dependencies().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("ambient monitor: running periodic check");
            if let Err(e) = self.check_and_engage().await {
                error!(error = %e, "error in ambient check");
            }

            let interval_seconds = match &self.fsm {
                Some(fsm) => {
                    let fsm = fsm.lock().unwrap();
                    let secs = fsm.next_interval_seconds();
                    info!(
                        state = fsm.state.as_str(),
                        minutes = secs / 60.0,
                        "ambient FSM sleep"
                    );
                    secs
                }
                None => (self.config.check_interval_minutes * 60) as f64,
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(interval_seconds)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("ambient monitor stopped");
    }

    /// Check collaborators once at startup. Warn, never fail-close.
    async fn validate_dependencies(&self) {
        if self.activity.current_activity(1).await.is_none() {
            warn!(
                "activity watcher not returning events — monitor will continue \
                 with limited signals"
            );
        } else {
            info!("activity watcher connected");
        }
    }

    async fn check_and_engage(&mut self) -> crate::error::Result<()> {
        let now = Utc::now();
        let lookback_minutes = clamp_lookback_minutes(
            self.last_check_at,
            now,
            self.config.check_interval_minutes,
            self.config.activity_lookback_hours,
        );
        let raw_activity = self.activity.current_activity(lookback_minutes).await;
        let current_activity = self.streak.update(raw_activity, now);
        self.last_check_at = Some(now);

        if self.fsm.is_some() {
            self.evaluate_fsm(&current_activity).await;
        }

        if self
            .maybe_run_exploration(now, lookback_minutes, &current_activity)
            .await?
        {
            return Ok(());
        }

        // A suppressed machine stays quiet no matter what the decider would
        // say; only a positive signal score lets it back into Monitoring.
        if self.fsm_state() == Some(AmbientState::Suppressed) {
            info!("state is suppressed, skipping engagement");
            return Ok(());
        }

        // Hard minimum interval between notifications, regardless of FSM
        // timing. Escalations do not restart this clock anywhere else.
        if let Some(fsm) = &self.fsm {
            let last = fsm.lock().unwrap().last_notification_time;
            if let Some(last) = last {
                let min_interval =
                    Duration::from_secs(self.config.min_notification_interval_minutes * 60);
                if last.elapsed() < min_interval {
                    let remaining = (min_interval - last.elapsed()).as_secs() / 60;
                    info!(remaining_minutes = remaining, "minimum interval not elapsed");
                    return Ok(());
                }
            }
        }

        let decision = self.analyzer.should_engage(current_activity.as_ref()).await;
        if !decision.should_engage {
            info!("ambient check complete: no engagement needed");
            return Ok(());
        }

        let mut snapshot = decision.context_snapshot.clone();
        let previous = self.notifications.recent_unacknowledged(
            &self.config.user_id,
            &(now - chrono::Duration::hours(ESCALATION_LOOKBACK_HOURS)).to_rfc3339(),
        )?;
        if !previous.is_empty() {
            snapshot["previous_notifications"] = json!(previous
                .iter()
                .map(|n| json!({"id": n.id, "message": n.message, "created_at": n.created_at}))
                .collect::<Vec<_>>());
        }

        let Some((message, priority, confidence)) = self.run_ambient_mission(&snapshot).await
        else {
            info!("ambient mission produced no actionable output");
            return Ok(());
        };
        info!(%priority, confidence, "ambient mission wants to reach out");

        // Routing already ran inside should_engage, against reachable
        // presence only; the decision carries the destination.
        let (Some(target_medium), Some(target_location)) =
            (decision.target_medium, decision.target_location)
        else {
            info!("engagement decision carried no destination, skipping");
            return Ok(());
        };

        // Escalations chain to the root of the most recent unacknowledged
        // notification so the UI can thread them.
        let parent_notification_id = match previous.first() {
            Some(prior) => Some(self.notifications.chain_root(prior.id)?),
            None => None,
        };

        self.notifications.create(&NewNotification {
            user_id: self.config.user_id.clone(),
            target_medium,
            target_location,
            message,
            priority,
            routing_reasoning: decision
                .routing_reasoning
                .unwrap_or_else(|| "ambient mission".to_string()),
            parent_notification_id,
            context: TriggerContext {
                trigger_type: Some("ambient_mission".to_string()),
                trigger_id: None,
                trigger_data: None,
                context_snapshot: Some(snapshot),
            },
        })?;

        if let Some(fsm) = &self.fsm {
            fsm.lock().unwrap().record_notification_sent();
        }
        Ok(())
    }

    /// Gather signal inputs and apply any warranted FSM transition.
    async fn evaluate_fsm(&mut self, activity: &Option<ActivitySnapshot>) {
        let activity_data = activity
            .as_ref()
            .map(|a| ActivityData {
                app_name: a.app.clone(),
                duration_seconds: a.duration_seconds,
            })
            .unwrap_or_default();

        let emotion_data = match &self.emotion {
            Some(emotion) => {
                let state = emotion.state().await;
                EmotionData {
                    emotion_type: state
                        .get("emotion_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("neutral")
                        .to_string(),
                    intensity: state.get("intensity").and_then(|v| v.as_f64()).unwrap_or(0.0),
                }
            }
            None => EmotionData::default(),
        };

        let acks = match self.notifications.recent(&self.config.user_id, 5) {
            Ok(recent) => recent.iter().map(|n| n.acknowledged).collect(),
            Err(e) => {
                warn!(error = %e, "failed to load notification history for signals");
                Vec::new()
            }
        };

        let tasks = match &self.tasks {
            Some(tasks) => tasks.task_context().await,
            None => TaskData::default(),
        };
        let bond = match &self.bond {
            Some(bond) => bond.bond().await,
            None => BondData::default(),
        };

        let inputs = SignalInputs {
            activity: activity_data,
            emotion: emotion_data,
            recent_notification_acks: acks,
            tasks,
            current_hour: chrono::Local::now().hour(),
            bond,
        };

        if let Some(fsm) = &self.fsm {
            let mut fsm = fsm.lock().unwrap();
            fsm.resolve_engaged();
            if let Some(new_state) = fsm.should_transition(&inputs) {
                fsm.transition_to(new_state, "signal evaluation");
            }
        }
    }

    /// The exploration gate. Returns true when an exploration ran (the
    /// iteration is then done — engagement waits for the next tick).
    async fn maybe_run_exploration(
        &mut self,
        now: DateTime<Utc>,
        lookback_minutes: u64,
        current_activity: &Option<ActivitySnapshot>,
    ) -> crate::error::Result<bool> {
        let Some(explorer) = self.explorer.clone() else {
            return Ok(false);
        };
        if !self.config.exploring.enabled {
            return Ok(false);
        }

        if let Some(state) = self.fsm_state() {
            if matches!(state, AmbientState::Engaged | AmbientState::Escalating) {
                return Ok(false);
            }
        }

        // Daily budget resets at local midnight.
        let today = chrono::Local::now().date_naive();
        if self.exploration_day != Some(today) {
            self.exploration_day = Some(today);
            self.explorations_today = 0;
        }

        if self.explorations_today >= self.config.exploring.max_explorations_per_day {
            self.exit_exploring(AmbientState::Idle, "daily exploration limit reached");
            return Ok(false);
        }

        if !explorer.has_pending_curiosities()? {
            self.exit_exploring(AmbientState::Idle, "no curiosity backlog");
            return Ok(false);
        }

        let max_hours = self.config.exploring.max_hours_between_explorations;
        let force_exploration = if max_hours > 0.0 {
            match self.last_exploration_at {
                // Cold start: no exploration history, force the first one.
                None => {
                    info!("forcing exploration: first run (no history)");
                    true
                }
                Some(last) => {
                    let hours_since = (now - last).num_seconds() as f64 / 3600.0;
                    if hours_since >= max_hours {
                        info!(hours_since, threshold = max_hours, "forcing exploration");
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            false
        };

        if !force_exploration {
            if let Some(idle) = self.analyzer.minutes_idle() {
                if idle < self.config.exploring.min_idle_minutes as f64 {
                    self.exit_exploring(AmbientState::Monitoring, "user active");
                    return Ok(false);
                }
            }

            let is_away = match current_activity {
                None => true,
                Some(_) => self.activity.is_afk(lookback_minutes).await,
            };
            if !is_away {
                self.exit_exploring(AmbientState::Monitoring, "user active");
                return Ok(false);
            }
        }

        if self.fsm_state() != Some(AmbientState::Exploring) {
            let reason = if force_exploration {
                "time threshold reached"
            } else {
                "idle and backlog available"
            };
            if let Some(fsm) = &self.fsm {
                fsm.lock().unwrap().transition_to(AmbientState::Exploring, reason);
            }
        }

        let Some(outcome) = explorer.explore_next().await? else {
            self.exit_exploring(AmbientState::Idle, "no claimable curiosity tasks");
            return Ok(false);
        };

        self.explorations_today += 1;
        self.last_exploration_at = Some(now);

        if let Some(result) = &outcome.result {
            if result.worth_sharing && result.confidence >= 0.8 {
                info!(
                    task_id = outcome.task_id,
                    "exploration produced a high-confidence shareable finding"
                );
            }
        }
        Ok(true)
    }

    async fn run_ambient_mission(
        &self,
        snapshot: &serde_json::Value,
    ) -> Option<(String, Priority, f64)> {
        let prompt = format!(
            "You are an ambient agent. Use the context to decide if there is a high-signal, \
             actionable message to send. If there is nothing useful, respond with send=false.\n\n\
             Respond with a JSON object: {{\"send\": bool, \"message\": \"...\", \
             \"priority\": \"alert\"|\"conversation\", \"confidence\": 0.0-1.0}}\n\n\
             Context:\n{snapshot}\n"
        );

        let output = match self.missions.run("", &prompt).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "ambient mission failed");
                return None;
            }
        };

        let decision: MissionDecision =
            serde_json::from_value(parse_mission_output(&output)?).ok()?;
        if !decision.send {
            return None;
        }
        let message = decision.message.filter(|m| !m.trim().is_empty())?;
        if decision.confidence < MISSION_CONFIDENCE_FLOOR {
            info!(
                confidence = decision.confidence,
                "mission confidence below floor, not sending"
            );
            return None;
        }
        let priority = decision
            .priority
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(Priority::Conversation);
        Some((message, priority, decision.confidence))
    }

    fn fsm_state(&self) -> Option<AmbientState> {
        self.fsm.as_ref().map(|f| f.lock().unwrap().state)
    }

    fn exit_exploring(&self, to: AmbientState, reason: &str) {
        if self.fsm_state() == Some(AmbientState::Exploring) {
            if let Some(fsm) = &self.fsm {
                fsm.lock().unwrap().transition_to(to, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MessageRouter;
    use dere_agent::personality::PersonalityLoader;
    use dere_agent::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
    use dere_presence::types::ChannelInfo;
    use dere_presence::PresenceRegistry;
    use dere_sessions::SessionStore;
    use rusqlite::Connection;

    struct ScriptedProvider {
        answer: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.answer.clone(),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    struct ScriptedMissions {
        answer: String,
    }

    #[async_trait]
    impl MissionRunner for ScriptedMissions {
        async fn run(&self, _working_dir: &str, _prompt: &str) -> Result<String, String> {
            Ok(self.answer.clone())
        }
    }

    struct FixedActivity;

    #[async_trait]
    impl ActivitySource for FixedActivity {
        async fn current_activity(&self, _lookback_minutes: u64) -> Option<ActivitySnapshot> {
            Some(ActivitySnapshot {
                app: "firefox".to_string(),
                title: "reading".to_string(),
                duration_seconds: 120.0,
                window_seconds: 120.0,
                last_seen: None,
            })
        }

        async fn is_afk(&self, _lookback_minutes: u64) -> bool {
            false
        }
    }

    fn notification_queue() -> Arc<NotificationQueue> {
        let conn = Connection::open_in_memory().unwrap();
        dere_notify::db::init_db(&conn).unwrap();
        Arc::new(NotificationQueue::new(conn))
    }

    fn monitor_with(answer: &str) -> (AmbientMonitor, Arc<NotificationQueue>) {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            answer: answer.to_string(),
        });

        let presence_conn = Connection::open_in_memory().unwrap();
        dere_presence::db::init_db(&presence_conn).unwrap();
        let presence = PresenceRegistry::new(presence_conn);
        presence
            .register(
                "discord",
                "default_user",
                &[ChannelInfo {
                    id: "123".to_string(),
                    name: None,
                    channel_type: Some("dm".to_string()),
                    extra: Default::default(),
                }],
            )
            .unwrap();
        let presence = Arc::new(presence);

        let session_conn = Connection::open_in_memory().unwrap();
        dere_sessions::db::init_db(&session_conn).unwrap();
        let store = Arc::new(SessionStore::new(session_conn));

        let router = Arc::new(MessageRouter::new(
            presence,
            provider.clone(),
            "test-model".to_string(),
        ));
        let mut config = AmbientConfig::default();
        config.min_notification_interval_minutes = 0;

        let analyzer = ContextAnalyzer::new(
            config.clone(),
            store,
            provider.clone(),
            Arc::new(PersonalityLoader::with_dir("/nonexistent")),
            router.clone(),
            None,
            None,
            None,
            "test-model".to_string(),
        );

        let notifications = notification_queue();
        let monitor = AmbientMonitor::new(
            config,
            analyzer,
            Arc::new(FixedActivity),
            Arc::new(ScriptedMissions {
                answer: answer.to_string(),
            }),
            notifications.clone(),
            None,
            None,
            None,
            None,
        );
        (monitor, notifications)
    }

    #[tokio::test]
    async fn engagement_creates_notification_and_transitions_to_engaged() {
        // One scripted object answers the engagement, mission, and routing
        // calls — each consumer reads only its own fields.
        let answer = "{\"should_engage\": true, \"send\": true, \
                      \"message\": \"You have 3 overdue tasks.\", \"priority\": \"alert\", \
                      \"confidence\": 0.9, \"medium\": \"discord\", \"location\": \"123\", \
                      \"reasoning\": \"direct ping\"}";
        let (mut monitor, notifications) = monitor_with(answer);

        monitor.check_and_engage().await.unwrap();

        let pending = notifications.pending("discord").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "You have 3 overdue tasks.");
        assert_eq!(pending[0].priority, Priority::Alert);
        assert_eq!(pending[0].target_location, "123");

        let handle = monitor.handle();
        assert_eq!(handle.state(), Some(AmbientState::Engaged));

        let ctx = notifications.context(pending[0].id).unwrap().unwrap();
        assert_eq!(ctx.trigger_type.as_deref(), Some("ambient_mission"));
        assert!(ctx.context_snapshot.is_some());
    }

    #[tokio::test]
    async fn low_confidence_mission_sends_nothing() {
        let answer = "{\"should_engage\": true, \"send\": true, \
                      \"message\": \"eh\", \"priority\": \"conversation\", \
                      \"confidence\": 0.3, \"medium\": \"discord\", \"location\": \"123\"}";
        let (mut monitor, notifications) = monitor_with(answer);

        monitor.check_and_engage().await.unwrap();
        assert!(notifications.pending("discord").unwrap().is_empty());
        assert_eq!(monitor.handle().state(), Some(AmbientState::Monitoring));
    }

    #[tokio::test]
    async fn min_interval_gates_repeat_notifications() {
        let answer = "{\"should_engage\": true, \"send\": true, \
                      \"message\": \"ping\", \"priority\": \"alert\", \
                      \"confidence\": 0.9, \"medium\": \"discord\", \"location\": \"123\"}";
        let (mut monitor, notifications) = monitor_with(answer);
        monitor.config.min_notification_interval_minutes = 120;

        monitor.check_and_engage().await.unwrap();
        assert_eq!(notifications.pending("discord").unwrap().len(), 1);

        // Second pass inside the minimum interval: gate holds.
        monitor.check_and_engage().await.unwrap();
        assert_eq!(notifications.pending("discord").unwrap().len(), 1);
    }

    #[test]
    fn streak_accumulates_for_same_window_and_resets_on_title_change() {
        let mut streak = ActivityStreak::default();
        let t0 = Utc::now();

        let snap = |title: &str, duration: f64| {
            Some(ActivitySnapshot {
                app: "firefox".to_string(),
                title: title.to_string(),
                duration_seconds: duration,
                window_seconds: duration,
                last_seen: None,
            })
        };

        let first = streak.update(snap("docs", 60.0), t0).unwrap();
        assert_eq!(first.duration_seconds, 60.0);

        let later = t0 + chrono::Duration::seconds(300);
        let second = streak.update(snap("docs", 30.0), later).unwrap();
        assert_eq!(second.duration_seconds, 360.0);

        // Title churn resets the streak and seeds from the window duration.
        let third = streak.update(snap("news", 45.0), later).unwrap();
        assert_eq!(third.duration_seconds, 45.0);

        // Absence clears everything.
        assert!(streak.update(None, later).is_none());
        let fourth = streak.update(snap("news", 10.0), later).unwrap();
        assert_eq!(fourth.duration_seconds, 10.0);
    }

    #[test]
    fn lookback_clamps_between_ten_minutes_and_max_hours() {
        let now = Utc::now();
        assert_eq!(clamp_lookback_minutes(None, now, 30, 6), 30);
        assert_eq!(
            clamp_lookback_minutes(Some(now - chrono::Duration::minutes(2)), now, 30, 6),
            10
        );
        assert_eq!(
            clamp_lookback_minutes(Some(now - chrono::Duration::hours(20)), now, 30, 6),
            360
        );
    }
}
