use serde::{Deserialize, Serialize};

use dere_core::types::MessageRole;

/// A persisted conversation session with the LLM.
///
/// `end_time` set means the session is closed and immutable. `is_locked`
/// means the backing sandbox container is gone — history is readable but no
/// further queries are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub working_dir: String,
    pub medium: String,
    pub user_id: Option<String>,
    pub personality: Option<String>,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub claude_session_id: Option<String>,
    pub is_locked: bool,
    pub sandbox_mode: bool,
    pub name: Option<String>,
    pub mission_id: Option<i64>,
    pub continued_from: Option<i64>,
    pub summary: Option<String>,
}

/// Fields for inserting a new session row.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub working_dir: String,
    pub medium: String,
    pub user_id: Option<String>,
    pub personality: Option<String>,
    pub name: Option<String>,
    pub sandbox_mode: bool,
    pub mission_id: Option<i64>,
    pub continued_from: Option<i64>,
}

/// Result of `find_or_create`: either a resumed session or a fresh one.
#[derive(Debug, Clone, Serialize)]
pub struct FindOrCreate {
    pub session_id: i64,
    pub resumed: bool,
    pub claude_session_id: Option<String>,
}

/// One turn of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: i64,
    pub prompt: String,
    pub message_type: MessageRole,
    /// Unix seconds.
    pub timestamp: i64,
    pub created_at: String,
    pub medium: Option<String>,
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ConversationMetrics>,
}

/// LLM latency and tool accounting attached to assistant turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub ttft_ms: Option<i64>,
    pub response_ms: Option<i64>,
    pub thinking_ms: Option<i64>,
    pub tool_uses: i64,
    pub tool_names: Vec<String>,
}

/// The streamed shape of an assistant turn, reconstructed in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBlock {
    pub ordinal: i64,
    pub block_type: BlockType,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub text: Option<String>,
    pub is_error: bool,
}

impl ConversationBlock {
    pub fn text(ordinal: i64, text: impl Into<String>) -> Self {
        Self {
            ordinal,
            block_type: BlockType::Text,
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
            text: Some(text.into()),
            is_error: false,
        }
    }

    pub fn thinking(ordinal: i64, text: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Thinking,
            ..Self::text(ordinal, text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Thinking => "thinking",
            BlockType::ToolUse => "tool_use",
            BlockType::ToolResult => "tool_result",
        }
    }
}

impl std::str::FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(BlockType::Text),
            "thinking" => Ok(BlockType::Thinking),
            "tool_use" => Ok(BlockType::ToolUse),
            "tool_result" => Ok(BlockType::ToolResult),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

/// A cached retrieval bundle for a session, bounded by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedContext {
    pub session_id: i64,
    pub context_text: String,
    pub context_metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}
