use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Daemon-wide constants shared by the gateway and background services
pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const EVENT_BUFFER_SIZE: usize = 500; // per-session event ring capacity
pub const PERMISSION_TIMEOUT_SECS: u64 = 300; // tool permission waits 5 minutes
pub const SANDBOX_IDLE_TIMEOUT_SECS: u64 = 1800; // idle sandbox sessions are reaped
pub const SANDBOX_CLEANUP_INTERVAL_SECS: u64 = 60; // reaper cadence
pub const SANDBOX_READY_TIMEOUT_SECS: u64 = 30; // container must signal ready
pub const PRESENCE_STALE_SECS: i64 = 60; // heartbeats older than this are offline
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // expected adapter heartbeat cadence

/// Top-level config (`~/.config/dere/config.toml` + `DERE_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DereConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub ambient: AmbientConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
}

impl Default for DereConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            providers: ProvidersConfig::default(),
            sandbox: SandboxConfig::default(),
            ambient: AmbientConfig::default(),
            context: ContextConfig::default(),
            weather: WeatherConfig::default(),
        }
    }
}

/// Address other processes (CLI, Discord/Obsidian adapters) use to reach us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_url")]
    pub url: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: default_daemon_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default model for interactive sessions.
    #[serde(default = "default_model")]
    pub model: String,
    /// Cheaper model used for autonomous missions (ambient checks, exploration).
    #[serde(default = "default_mission_model")]
    pub mission_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            mission_model: default_mission_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

/// Sandboxed session runner settings — container image and resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_sandbox_memory")]
    pub memory_limit: String,
    #[serde(default = "default_sandbox_cpus")]
    pub cpu_limit: f64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_sandbox_image(),
            memory_limit: default_sandbox_memory(),
            cpu_limit: default_sandbox_cpus(),
        }
    }
}

/// Ambient monitoring — the FSM, engagement gating and exploration budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_personality")]
    pub personality: String,
    /// Skip engagement while the user interacted with us within this window.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_minutes: u64,
    #[serde(default = "default_activity_lookback")]
    pub activity_lookback_hours: u64,
    /// Hard floor between outbound notifications, regardless of FSM state.
    #[serde(default = "default_min_notification_interval")]
    pub min_notification_interval_minutes: u64,
    #[serde(default)]
    pub startup_delay_seconds: u64,
    /// Fallback cadence when the FSM is disabled.
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,

    #[serde(default = "bool_true")]
    pub fsm_enabled: bool,
    #[serde(default = "default_idle_interval")]
    pub fsm_idle_interval: [u64; 2],
    #[serde(default = "default_monitoring_interval")]
    pub fsm_monitoring_interval: [u64; 2],
    #[serde(default = "default_engaged_interval")]
    pub fsm_engaged_interval: u64,
    #[serde(default = "default_cooldown_interval")]
    pub fsm_cooldown_interval: [u64; 2],
    #[serde(default = "default_escalating_interval")]
    pub fsm_escalating_interval: [u64; 2],
    #[serde(default = "default_suppressed_interval")]
    pub fsm_suppressed_interval: [u64; 2],

    #[serde(default = "default_weight_activity")]
    pub fsm_weight_activity: f64,
    #[serde(default = "default_weight_emotion")]
    pub fsm_weight_emotion: f64,
    #[serde(default = "default_weight_responsiveness")]
    pub fsm_weight_responsiveness: f64,
    #[serde(default = "default_weight_temporal")]
    pub fsm_weight_temporal: f64,
    #[serde(default = "default_weight_task")]
    pub fsm_weight_task: f64,
    #[serde(default = "default_weight_bond")]
    pub fsm_weight_bond: f64,

    #[serde(default)]
    pub exploring: ExploringConfig,
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_id: default_user_id(),
            personality: default_personality(),
            idle_threshold_minutes: default_idle_threshold(),
            activity_lookback_hours: default_activity_lookback(),
            min_notification_interval_minutes: default_min_notification_interval(),
            startup_delay_seconds: 0,
            check_interval_minutes: default_check_interval(),
            fsm_enabled: true,
            fsm_idle_interval: default_idle_interval(),
            fsm_monitoring_interval: default_monitoring_interval(),
            fsm_engaged_interval: default_engaged_interval(),
            fsm_cooldown_interval: default_cooldown_interval(),
            fsm_escalating_interval: default_escalating_interval(),
            fsm_suppressed_interval: default_suppressed_interval(),
            fsm_weight_activity: default_weight_activity(),
            fsm_weight_emotion: default_weight_emotion(),
            fsm_weight_responsiveness: default_weight_responsiveness(),
            fsm_weight_temporal: default_weight_temporal(),
            fsm_weight_task: default_weight_task(),
            fsm_weight_bond: default_weight_bond(),
            exploring: ExploringConfig::default(),
        }
    }
}

/// Autonomous exploration during user idle time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploringConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_min_idle")]
    pub min_idle_minutes: u64,
    #[serde(default = "default_exploring_interval")]
    pub interval_minutes: [u64; 2],
    #[serde(default = "default_max_explorations")]
    pub max_explorations_per_day: u32,
    #[serde(default = "default_max_daily_cost")]
    pub max_daily_cost_usd: f64,
    /// Force an exploration after this many hours without one. 0 disables.
    #[serde(default)]
    pub max_hours_between_explorations: f64,
}

impl Default for ExploringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_idle_minutes: default_min_idle(),
            interval_minutes: default_exploring_interval(),
            max_explorations_per_day: default_max_explorations(),
            max_daily_cost_usd: default_max_daily_cost(),
            max_hours_between_explorations: 0.0,
        }
    }
}

/// Which environmental context blocks get injected into system prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "bool_true")]
    pub time: bool,
    #[serde(default)]
    pub weather: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            time: true,
            weather: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WeatherConfig {
    pub location: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_daemon_url() -> String {
    format!("http://{}:{}", DEFAULT_BIND, DEFAULT_PORT)
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_mission_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_sandbox_image() -> String {
    "dere-sandbox:latest".to_string()
}
fn default_sandbox_memory() -> String {
    "2g".to_string()
}
fn default_sandbox_cpus() -> f64 {
    2.0
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.local/share/dere/dere.db", home)
}
fn default_user_id() -> String {
    "default_user".to_string()
}
fn default_personality() -> String {
    "tsun".to_string()
}
fn default_idle_threshold() -> u64 {
    60
}
fn default_activity_lookback() -> u64 {
    6
}
fn default_min_notification_interval() -> u64 {
    120
}
fn default_check_interval() -> u64 {
    30
}
fn default_idle_interval() -> [u64; 2] {
    [60, 120]
}
fn default_monitoring_interval() -> [u64; 2] {
    [15, 30]
}
fn default_engaged_interval() -> u64 {
    5
}
fn default_cooldown_interval() -> [u64; 2] {
    [45, 90]
}
fn default_escalating_interval() -> [u64; 2] {
    [30, 60]
}
fn default_suppressed_interval() -> [u64; 2] {
    [90, 180]
}
fn default_weight_activity() -> f64 {
    0.25
}
fn default_weight_emotion() -> f64 {
    0.20
}
fn default_weight_responsiveness() -> f64 {
    0.15
}
fn default_weight_temporal() -> f64 {
    0.15
}
fn default_weight_task() -> f64 {
    0.10
}
fn default_weight_bond() -> f64 {
    0.15
}
fn default_min_idle() -> u64 {
    30
}
fn default_exploring_interval() -> [u64; 2] {
    [5, 10]
}
fn default_max_explorations() -> u32 {
    20
}
fn default_max_daily_cost() -> f64 {
    0.50
}

impl DereConfig {
    /// Load config from a TOML file with DERE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.config/dere/config.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DereConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DERE_").split("_"))
            .extract()
            .map_err(|e| crate::error::DereError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup-time invariant checks. Violations are fatal (never mid-loop).
    pub fn validate(&self) -> crate::error::Result<()> {
        let a = &self.ambient;
        let weight_sum = a.fsm_weight_activity
            + a.fsm_weight_emotion
            + a.fsm_weight_responsiveness
            + a.fsm_weight_temporal
            + a.fsm_weight_task
            + a.fsm_weight_bond;
        if weight_sum > 1.0 + f64::EPSILON {
            return Err(crate::error::DereError::Config(format!(
                "ambient FSM signal weights sum to {weight_sum:.3}, must be <= 1.0"
            )));
        }
        for (name, range) in [
            ("fsm_idle_interval", a.fsm_idle_interval),
            ("fsm_monitoring_interval", a.fsm_monitoring_interval),
            ("fsm_cooldown_interval", a.fsm_cooldown_interval),
            ("fsm_escalating_interval", a.fsm_escalating_interval),
            ("fsm_suppressed_interval", a.fsm_suppressed_interval),
            ("exploring.interval_minutes", a.exploring.interval_minutes),
        ] {
            if range[0] > range[1] {
                return Err(crate::error::DereError::Config(format!(
                    "{name}: min {} exceeds max {}",
                    range[0], range[1]
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.config/dere/config.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = DereConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_weights_sum_below_one() {
        let a = AmbientConfig::default();
        let sum = a.fsm_weight_activity
            + a.fsm_weight_emotion
            + a.fsm_weight_responsiveness
            + a.fsm_weight_temporal
            + a.fsm_weight_task
            + a.fsm_weight_bond;
        assert!(sum <= 1.0 + f64::EPSILON);
    }

    #[test]
    fn overweighted_fsm_is_rejected() {
        let mut config = DereConfig::default();
        config.ambient.fsm_weight_activity = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_interval_is_rejected() {
        let mut config = DereConfig::default();
        config.ambient.fsm_monitoring_interval = [30, 15];
        assert!(config.validate().is_err());
    }
}
