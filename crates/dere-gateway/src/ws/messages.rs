use serde::{Deserialize, Serialize};

use dere_agent::SessionConfig;

/// Client → server envelope on `/agent/ws`.
///
/// Wire: `{"type": "query", "prompt": "..."}` and friends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    NewSession {
        config: WireSessionConfig,
    },
    ResumeSession {
        session_id: i64,
        #[serde(default)]
        last_seq: Option<u64>,
    },
    Query {
        prompt: String,
    },
    UpdateConfig {
        config: WireSessionConfig,
    },
    Cancel,
    PermissionResponse {
        request_id: String,
        allowed: bool,
        #[serde(default)]
        deny_message: Option<String>,
    },
    Ping,
    Close,
}

/// Session configuration as clients send it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSessionConfig {
    pub working_dir: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default = "bool_true")]
    pub include_context: bool,
    #[serde(default)]
    pub sandbox_mode: bool,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

fn bool_true() -> bool {
    true
}

impl From<WireSessionConfig> for SessionConfig {
    fn from(wire: WireSessionConfig) -> Self {
        SessionConfig {
            working_dir: wire.working_dir,
            personality: wire.personality,
            user_id: wire.user_id,
            model: wire.model,
            allowed_tools: wire.allowed_tools,
            include_context: wire.include_context,
            sandbox_mode: wire.sandbox_mode,
            session_name: wire.session_name,
            thinking_budget: wire.thinking_budget,
            // Interactive sessions always prompt for tool permissions.
            auto_approve: false,
            mission_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_envelope_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "query", "prompt": "hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Query { prompt } if prompt == "hello"));
    }

    #[test]
    fn resume_with_last_seq_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "resume_session", "session_id": 7, "last_seq": 42}"#)
                .unwrap();
        match msg {
            ClientMessage::ResumeSession {
                session_id,
                last_seq,
            } => {
                assert_eq!(session_id, 7);
                assert_eq!(last_seq, Some(42));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "frobnicate"}"#).is_err());
    }
}
