use serde::{Deserialize, Serialize};

/// What kind of conversational moment sparked a curiosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuriosityType {
    UnfamiliarEntity,
    Correction,
    EmotionalPeak,
    UnfinishedThread,
    KnowledgeGap,
    ResearchChain,
}

impl CuriosityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CuriosityType::UnfamiliarEntity => "unfamiliar_entity",
            CuriosityType::Correction => "correction",
            CuriosityType::EmotionalPeak => "emotional_peak",
            CuriosityType::UnfinishedThread => "unfinished_thread",
            CuriosityType::KnowledgeGap => "knowledge_gap",
            CuriosityType::ResearchChain => "research_chain",
        }
    }

    /// TTL before an untouched curiosity of this type decays out of the
    /// backlog. Corrections go stale fastest.
    pub fn ttl_days(&self) -> f64 {
        match self {
            CuriosityType::Correction => 7.0,
            _ => 14.0,
        }
    }
}

impl std::str::FromStr for CuriosityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unfamiliar_entity" => Ok(CuriosityType::UnfamiliarEntity),
            "correction" => Ok(CuriosityType::Correction),
            "emotional_peak" => Ok(CuriosityType::EmotionalPeak),
            "unfinished_thread" => Ok(CuriosityType::UnfinishedThread),
            "knowledge_gap" => Ok(CuriosityType::KnowledgeGap),
            "research_chain" => Ok(CuriosityType::ResearchChain),
            other => Err(format!("unknown curiosity type: {other}")),
        }
    }
}

/// One detected trigger: something worth exploring on the user's behalf.
#[derive(Debug, Clone)]
pub struct CuriositySignal {
    pub curiosity_type: CuriosityType,
    pub topic: String,
    pub source_context: String,
    pub trigger_reason: String,
    /// [0, 1] — how much the user seems to care.
    pub user_interest: f64,
    /// [0, 1] — how much the assistant seems not to know.
    pub knowledge_gap: f64,
    pub metadata: serde_json::Value,
}

impl CuriositySignal {
    pub fn new(
        curiosity_type: CuriosityType,
        topic: impl Into<String>,
        source_context: impl Into<String>,
        trigger_reason: impl Into<String>,
        user_interest: f64,
    ) -> Self {
        Self {
            curiosity_type,
            topic: topic.into(),
            source_context: source_context.into(),
            trigger_reason: trigger_reason.into(),
            user_interest,
            knowledge_gap: 0.0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Lifecycle of a work/curiosity task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    Done,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Pending = still occupying backlog capacity.
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Backlog | TaskStatus::Ready | TaskStatus::Blocked)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "ready" => Ok(TaskStatus::Ready),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Typed view of the task `extra` JSON column. Serialized only at the
/// storage boundary; in-process code works with this struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curiosity_type: Option<CuriosityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<String>,
    #[serde(default)]
    pub priority_factors: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub trigger_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub exploration_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_explored_at: Option<String>,
    #[serde(default)]
    pub satisfaction_level: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exploration_result: Option<ExplorationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pruned_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pruned_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub promoted_fact_ids: Vec<String>,
}

/// A unit of work; curiosity tasks carry `task_type = "curiosity"`.
#[derive(Debug, Clone)]
pub struct ProjectTask {
    pub id: i64,
    pub working_dir: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    /// 0–100, monotonically non-decreasing across re-triggers.
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub discovered_from_task_id: Option<i64>,
    pub discovery_reason: Option<String>,
    pub extra: TaskExtra,
}

impl ProjectTask {
    pub fn curiosity_type(&self) -> Option<CuriosityType> {
        self.extra.curiosity_type
    }
}

/// Parsed output of one exploration mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationResult {
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub worth_sharing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_message: Option<String>,
}

/// What one `explore_next` pass did.
#[derive(Debug, Clone)]
pub struct ExplorationOutcome {
    pub task_id: i64,
    pub result: Option<ExplorationResult>,
    pub error_message: Option<String>,
}

/// A factual nugget produced by exploration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub task_id: i64,
    pub user_id: String,
    pub finding: String,
    pub source_context: Option<String>,
    pub confidence: f64,
    pub worth_sharing: bool,
    pub share_message: Option<String>,
    pub created_at: String,
}
