//! Wire-compatibility tests for the agent event envelope.
//!
//! Clients (CLI, Obsidian shim, web UI) parse these shapes byte-for-byte;
//! any change here is a breaking protocol change.

use dere_agent::events::{AgentEvent, AgentEventBody, Timings};

fn wire(event: &AgentEvent) -> serde_json::Value {
    serde_json::to_value(event).unwrap()
}

#[test]
fn text_event_shape() {
    let mut event = AgentEvent::new(AgentEventBody::Text {
        text: "hello".into(),
    });
    event.seq = Some(3);
    let value = wire(&event);

    assert_eq!(value["type"], "text");
    assert_eq!(value["data"]["text"], "hello");
    assert_eq!(value["seq"], 3);
    assert!(value["timestamp"].is_i64());
}

#[test]
fn tool_use_event_shape() {
    let event = AgentEvent::new(AgentEventBody::ToolUse {
        id: "tu_1".into(),
        name: "Read".into(),
        input: serde_json::json!({"path": "/etc/hosts"}),
    });
    let value = wire(&event);

    assert_eq!(value["type"], "tool_use");
    assert_eq!(value["data"]["id"], "tu_1");
    assert_eq!(value["data"]["name"], "Read");
    assert_eq!(value["data"]["input"]["path"], "/etc/hosts");
}

#[test]
fn permission_request_event_shape() {
    let event = AgentEvent::new(AgentEventBody::PermissionRequest {
        request_id: "req-9".into(),
        tool_name: "Bash".into(),
        tool_input: serde_json::json!({"cmd": "rm"}),
    });
    let value = wire(&event);

    assert_eq!(value["type"], "permission_request");
    assert_eq!(value["data"]["request_id"], "req-9");
    assert_eq!(value["data"]["tool_name"], "Bash");
}

#[test]
fn done_event_carries_timings() {
    let event = AgentEvent::new(AgentEventBody::Done {
        response_text: "all set".into(),
        tool_count: 2,
        timings: Some(Timings {
            time_to_first_token_ms: 120,
            response_time_ms: 900,
            thinking_ms: Some(300),
        }),
    });
    let value = wire(&event);

    assert_eq!(value["type"], "done");
    assert_eq!(value["data"]["response_text"], "all set");
    assert_eq!(value["data"]["tool_count"], 2);
    assert_eq!(value["data"]["timings"]["time_to_first_token_ms"], 120);
    assert_eq!(value["data"]["timings"]["thinking_ms"], 300);
}

#[test]
fn error_event_marks_recoverability() {
    let event = AgentEvent::new(AgentEventBody::Error {
        message: "boom".into(),
        recoverable: true,
    });
    let value = wire(&event);

    assert_eq!(value["type"], "error");
    assert_eq!(value["data"]["recoverable"], true);
}

#[test]
fn seq_is_omitted_until_assigned() {
    let event = AgentEvent::new(AgentEventBody::Cancelled {
        message: "Query cancelled by user".into(),
    });
    let value = wire(&event);
    assert!(value.get("seq").is_none());
}

#[test]
fn events_round_trip() {
    let bodies = vec![
        AgentEventBody::SessionReady {
            session_id: 12,
            name: Some("weekend trip".into()),
            is_locked: false,
        },
        AgentEventBody::Thinking {
            text: "hmm".into(),
        },
        AgentEventBody::ToolResult {
            tool_use_id: "tu_1".into(),
            name: "Read".into(),
            output: "contents".into(),
            is_error: false,
        },
        AgentEventBody::Cancelled {
            message: "Query cancelled by user".into(),
        },
    ];

    for body in bodies {
        let event = AgentEvent::new(body.clone());
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, body);
    }
}
