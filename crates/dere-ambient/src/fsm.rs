use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use dere_core::config::AmbientConfig;

/// States of the ambient notification state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbientState {
    /// User recently engaged, long wait.
    Idle,
    /// Actively watching for an opportunity.
    Monitoring,
    /// Just sent a notification.
    Engaged,
    /// User ignored a notification, backing off.
    Cooldown,
    /// Unacknowledged and context is critical.
    Escalating,
    /// User clearly busy or focused.
    Suppressed,
    /// Doing autonomous exploration work.
    Exploring,
}

impl AmbientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmbientState::Idle => "idle",
            AmbientState::Monitoring => "monitoring",
            AmbientState::Engaged => "engaged",
            AmbientState::Cooldown => "cooldown",
            AmbientState::Escalating => "escalating",
            AmbientState::Suppressed => "suppressed",
            AmbientState::Exploring => "exploring",
        }
    }
}

/// Interval ranges (min, max) in minutes for each state.
#[derive(Debug, Clone)]
pub struct StateIntervals {
    pub idle: [u64; 2],
    pub monitoring: [u64; 2],
    pub engaged: u64,
    pub cooldown: [u64; 2],
    pub escalating: [u64; 2],
    pub suppressed: [u64; 2],
    pub exploring: [u64; 2],
}

impl Default for StateIntervals {
    fn default() -> Self {
        Self {
            idle: [60, 120],
            monitoring: [15, 30],
            engaged: 5,
            cooldown: [45, 90],
            escalating: [30, 60],
            suppressed: [90, 180],
            exploring: [5, 10],
        }
    }
}

/// Weights for signal fusion. Must sum to at most 1.0 (checked at config
/// load), keeping the fused score inside [-1, +1].
#[derive(Debug, Clone, Copy)]
pub struct SignalWeights {
    pub activity: f64,
    pub emotion: f64,
    pub responsiveness: f64,
    pub temporal: f64,
    pub task: f64,
    pub bond: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            activity: 0.25,
            emotion: 0.20,
            responsiveness: 0.15,
            temporal: 0.15,
            task: 0.10,
            bond: 0.15,
        }
    }
}

/// What the user is doing right now, as far as the activity watcher knows.
#[derive(Debug, Clone, Default)]
pub struct ActivityData {
    pub app_name: String,
    pub duration_seconds: f64,
}

/// Current emotional read on the user.
#[derive(Debug, Clone)]
pub struct EmotionData {
    pub emotion_type: String,
    pub intensity: f64,
}

impl Default for EmotionData {
    fn default() -> Self {
        Self {
            emotion_type: "neutral".to_string(),
            intensity: 0.0,
        }
    }
}

/// Task pressure snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskData {
    pub overdue_count: u32,
    pub due_soon_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondTrend {
    #[default]
    Stable,
    Rising,
    Falling,
    Distant,
}

/// Relationship state: higher affection means more initiative.
#[derive(Debug, Clone, Copy)]
pub struct BondData {
    pub affection_level: f64,
    pub trend: BondTrend,
    pub streak_days: u32,
}

impl Default for BondData {
    fn default() -> Self {
        Self {
            affection_level: 50.0,
            trend: BondTrend::Stable,
            streak_days: 0,
        }
    }
}

/// All signal inputs for one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct SignalInputs {
    pub activity: ActivityData,
    pub emotion: EmotionData,
    /// Acknowledged flags of the most recent notifications, newest first.
    pub recent_notification_acks: Vec<bool>,
    pub tasks: TaskData,
    pub current_hour: u32,
    pub bond: BondData,
}

/// Finite state machine driving ambient notification timing.
///
/// Transitions are hysteresis-based: the fused signal score has to cross a
/// per-state threshold before the machine moves, so a single noisy sample
/// never flips behavior.
pub struct AmbientFsm {
    pub state: AmbientState,
    intervals: StateIntervals,
    weights: SignalWeights,

    /// Monotonic time of the last outbound notification.
    pub last_notification_time: Option<Instant>,
    pub notification_attempts: u32,
    pub last_acknowledgment_time: Option<Instant>,
}

impl AmbientFsm {
    pub fn new(intervals: StateIntervals, weights: SignalWeights) -> Self {
        Self {
            state: AmbientState::Monitoring,
            intervals,
            weights,
            last_notification_time: None,
            notification_attempts: 0,
            last_acknowledgment_time: None,
        }
    }

    pub fn from_config(config: &AmbientConfig) -> Self {
        Self::new(
            StateIntervals {
                idle: config.fsm_idle_interval,
                monitoring: config.fsm_monitoring_interval,
                engaged: config.fsm_engaged_interval,
                cooldown: config.fsm_cooldown_interval,
                escalating: config.fsm_escalating_interval,
                suppressed: config.fsm_suppressed_interval,
                exploring: config.exploring.interval_minutes,
            },
            SignalWeights {
                activity: config.fsm_weight_activity,
                emotion: config.fsm_weight_emotion,
                responsiveness: config.fsm_weight_responsiveness,
                temporal: config.fsm_weight_temporal,
                task: config.fsm_weight_task,
                bond: config.fsm_weight_bond,
            },
        )
    }

    /// Seconds until the next check, drawn uniformly from the current
    /// state's minute range (fixed for Engaged).
    pub fn next_interval_seconds(&self) -> f64 {
        let range = match self.state {
            AmbientState::Idle => self.intervals.idle,
            AmbientState::Monitoring => self.intervals.monitoring,
            AmbientState::Engaged => return (self.intervals.engaged * 60) as f64,
            AmbientState::Cooldown => self.intervals.cooldown,
            AmbientState::Escalating => self.intervals.escalating,
            AmbientState::Suppressed => self.intervals.suppressed,
            AmbientState::Exploring => self.intervals.exploring,
        };
        let minutes = if range[0] == range[1] {
            range[0] as f64
        } else {
            rand::thread_rng().gen_range(range[0] as f64..range[1] as f64)
        };
        minutes * 60.0
    }

    pub fn transition_to(&mut self, new_state: AmbientState, reason: &str) {
        let old_state = self.state;
        self.state = new_state;
        info!(
            from = old_state.as_str(),
            to = new_state.as_str(),
            reason,
            "ambient state transition"
        );
    }

    /// Activity continuity and focus: deep work suppresses, communication
    /// apps invite engagement.
    pub fn evaluate_activity_signal(&self, activity: &ActivityData) -> f64 {
        let app = activity.app_name.to_lowercase();
        let duration_min = activity.duration_seconds / 60.0;

        if ["code", "vim", "nvim", "intellij", "pycharm", "vscode"]
            .iter()
            .any(|k| app.contains(k))
        {
            return if duration_min > 30.0 { -0.8 } else { -0.4 };
        }
        if ["zoom", "teams", "meet", "slack"].iter().any(|k| app.contains(k)) {
            return -0.6;
        }
        if ["mail", "thunderbird", "outlook"].iter().any(|k| app.contains(k)) {
            return 0.3;
        }
        if ["firefox", "chrome", "browser"].iter().any(|k| app.contains(k)) {
            return 0.1;
        }
        if ["terminal", "ghostty", "alacritty"].iter().any(|k| app.contains(k)) {
            return if duration_min > 20.0 { -0.3 } else { 0.0 };
        }
        0.0
    }

    /// Distress suppresses; interest and joy invite engagement.
    pub fn evaluate_emotion_signal(&self, emotion: &EmotionData) -> f64 {
        match emotion.emotion_type.as_str() {
            "distress" | "anger" | "fear" | "disappointment" => {
                if emotion.intensity > 60.0 {
                    -0.7
                } else {
                    -0.3
                }
            }
            "interest" | "joy" | "satisfaction" | "gratification" => {
                if emotion.intensity > 50.0 {
                    0.6
                } else {
                    0.3
                }
            }
            _ => 0.0,
        }
    }

    /// Acknowledgment rate over recent notifications.
    pub fn evaluate_responsiveness_signal(&self, acks: &[bool]) -> f64 {
        if acks.is_empty() {
            return 0.0;
        }
        let rate = acks.iter().filter(|a| **a).count() as f64 / acks.len() as f64;
        if rate > 0.7 {
            0.5
        } else if rate < 0.3 {
            -0.5
        } else {
            0.0
        }
    }

    /// Time-of-day appropriateness: nights are off limits.
    pub fn evaluate_temporal_signal(&self, hour: u32) -> f64 {
        if !(8..23).contains(&hour) {
            -0.8
        } else if (9..17).contains(&hour) {
            0.3
        } else if (17..22).contains(&hour) {
            0.2
        } else {
            0.0
        }
    }

    /// Task urgency: a pile of overdue work is a strong reason to speak up.
    pub fn evaluate_task_signal(&self, tasks: &TaskData) -> f64 {
        if tasks.overdue_count > 5 {
            0.9
        } else if tasks.overdue_count > 2 {
            0.6
        } else if tasks.due_soon_count > 3 {
            0.4
        } else {
            0.0
        }
    }

    /// Bond level: high affection means eager to engage, low means
    /// withdrawn and protective.
    pub fn evaluate_bond_signal(&self, bond: &BondData) -> f64 {
        let mut signal: f64 = match bond.affection_level {
            a if a >= 80.0 => 0.7,
            a if a >= 65.0 => 0.4,
            a if a >= 50.0 => 0.1,
            a if a >= 35.0 => -0.2,
            a if a >= 20.0 => -0.5,
            _ => -0.8,
        };

        signal += match bond.trend {
            BondTrend::Rising => 0.15,
            BondTrend::Falling => -0.1,
            BondTrend::Distant => -0.2,
            BondTrend::Stable => 0.0,
        };

        if bond.streak_days >= 7 {
            signal += 0.1;
        } else if bond.streak_days >= 3 {
            signal += 0.05;
        }

        signal.clamp(-1.0, 1.0)
    }

    /// Weighted sum of all signals, in [-1, +1].
    pub fn fuse(&self, inputs: &SignalInputs) -> f64 {
        self.weights.activity * self.evaluate_activity_signal(&inputs.activity)
            + self.weights.emotion * self.evaluate_emotion_signal(&inputs.emotion)
            + self.weights.responsiveness
                * self.evaluate_responsiveness_signal(&inputs.recent_notification_acks)
            + self.weights.temporal * self.evaluate_temporal_signal(inputs.current_hour)
            + self.weights.task * self.evaluate_task_signal(&inputs.tasks)
            + self.weights.bond * self.evaluate_bond_signal(&inputs.bond)
    }

    /// Evaluate signals and return the warranted transition, if any.
    ///
    /// Engaged resolves externally on acknowledgment; Exploring is entered
    /// and exited by the monitor based on idleness and backlog.
    pub fn should_transition(&self, inputs: &SignalInputs) -> Option<AmbientState> {
        let score = self.fuse(inputs);
        let task_signal = self.evaluate_task_signal(&inputs.tasks);

        match self.state {
            AmbientState::Monitoring => {
                if score < -0.5 {
                    return Some(AmbientState::Suppressed);
                }
                None
            }
            AmbientState::Cooldown => {
                if score > 0.3 {
                    return Some(AmbientState::Monitoring);
                }
                if task_signal > 0.7 {
                    return Some(AmbientState::Escalating);
                }
                None
            }
            AmbientState::Suppressed => {
                if score > 0.0 {
                    return Some(AmbientState::Monitoring);
                }
                None
            }
            AmbientState::Escalating => {
                if self.notification_attempts > 3 {
                    return Some(AmbientState::Suppressed);
                }
                None
            }
            AmbientState::Engaged | AmbientState::Idle | AmbientState::Exploring => None,
        }
    }

    /// Resolve the Engaged state against acknowledgment arrival.
    ///
    /// Called once per monitor tick: an acknowledged notification returns to
    /// Monitoring; one ignored past the engaged interval backs off into
    /// Cooldown.
    pub fn resolve_engaged(&mut self) {
        if self.state != AmbientState::Engaged {
            return;
        }
        let Some(sent) = self.last_notification_time else {
            self.transition_to(AmbientState::Monitoring, "no notification outstanding");
            return;
        };
        let acked = self
            .last_acknowledgment_time
            .is_some_and(|ack| ack > sent);
        if acked {
            self.transition_to(AmbientState::Monitoring, "notification acknowledged");
        } else if sent.elapsed().as_secs() >= self.intervals.engaged * 60 {
            self.transition_to(AmbientState::Cooldown, "notification not acknowledged");
        }
    }

    /// External acknowledgment arrival: the user noticed us.
    pub fn record_acknowledgment(&mut self) {
        self.last_acknowledgment_time = Some(Instant::now());
        self.notification_attempts = 0;
        if matches!(self.state, AmbientState::Engaged | AmbientState::Escalating) {
            self.transition_to(AmbientState::Monitoring, "notification acknowledged");
        }
    }

    /// A notification went out: hold in Engaged for the fixed short interval.
    pub fn record_notification_sent(&mut self) {
        self.last_notification_time = Some(Instant::now());
        self.notification_attempts += 1;
        self.transition_to(AmbientState::Engaged, "notification sent");
    }
}
