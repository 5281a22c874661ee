use serde::{Deserialize, Serialize};

/// A streaming event emitted to agent clients.
///
/// Every event sent to a client carries a monotonic `seq` assigned by the
/// session's ring buffer, so reconnecting clients can replay what they missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(flatten)]
    pub body: AgentEventBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Unix milliseconds at emit time.
    pub timestamp: i64,
}

impl AgentEvent {
    pub fn new(body: AgentEventBody) -> Self {
        Self {
            body,
            seq: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Wire shape: `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEventBody {
    SessionReady {
        session_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        is_locked: bool,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },
    Done {
        response_text: String,
        tool_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        timings: Option<Timings>,
    },
    Cancelled {
        message: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Per-request latency accounting surfaced in the `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub time_to_first_token_ms: i64,
    pub response_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_ms: Option<i64>,
}

pub fn error_event(message: impl Into<String>, recoverable: bool) -> AgentEvent {
    AgentEvent::new(AgentEventBody::Error {
        message: message.into(),
        recoverable,
    })
}

pub fn cancelled_event() -> AgentEvent {
    AgentEvent::new(AgentEventBody::Cancelled {
        message: "Query cancelled by user".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_and_data() {
        let mut event = AgentEvent::new(AgentEventBody::Text {
            text: "hi".to_string(),
        });
        event.seq = Some(7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["data"]["text"], "hi");
        assert_eq!(json["seq"], 7);
    }

    #[test]
    fn permission_request_round_trips() {
        let event = AgentEvent::new(AgentEventBody::PermissionRequest {
            request_id: "r1".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"cmd": "rm"}),
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, event.body);
    }
}
