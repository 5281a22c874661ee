use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use dere_agent::events::error_event;
use dere_agent::service::AgentSession;
use dere_agent::{AgentEvent, AgentEventBody};
use dere_core::types::MessageRole;
use dere_curiosity::triggers::TurnContext;

use crate::app::AppState;
use crate::ws::messages::ClientMessage;

/// Axum handler — upgrades HTTP to WebSocket at GET /agent/ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — one current session, one active event stream.
///
/// Client messages keep flowing while a query streams, so cancel and
/// permission responses land mid-stream as they must.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new agent WS connection");

    let (mut tx, mut rx) = socket.split();
    let mut current_session: Option<Arc<AgentSession>> = None;
    let mut stream_rx: Option<mpsc::Receiver<AgentEvent>> = None;
    let mut active_prompt: Option<String> = None;

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                let event = error_event(format!("Invalid message: {e}"), true);
                                let _ = send_json(&mut tx, &event).await;
                                continue;
                            }
                        };
                        if let ClientMessage::Query { prompt } = &parsed {
                            active_prompt = Some(prompt.clone());
                        }
                        let done = handle_client_message(
                            parsed,
                            &state,
                            &mut current_session,
                            &mut stream_rx,
                            &mut tx,
                        )
                        .await;
                        if done {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            event = next_event(&mut stream_rx) => {
                match event {
                    Some(event) => {
                        // Completed exchanges feed the curiosity collector.
                        if let AgentEventBody::Done { response_text, .. } = &event.body {
                            if let (Some(session), Some(prompt)) =
                                (&current_session, active_prompt.take())
                            {
                                collect_turn_triggers(&state, session, &prompt, response_text);
                            }
                        }
                        if send_json(&mut tx, &event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Query stream finished; wait for the next command.
                        stream_rx = None;
                    }
                }
            }
        }
    }

    info!(conn_id = %conn_id, "agent WS connection closed");
}

/// Run the trigger detectors over a completed exchange — the user turn
/// (with the response's predecessor as context) and the assistant turn.
/// Best-effort: failures never disturb the stream.
fn collect_turn_triggers(
    state: &Arc<AppState>,
    session: &Arc<AgentSession>,
    prompt: &str,
    response_text: &str,
) {
    let previous_assistant = state
        .sessions
        .history(session.session_id, 10)
        .ok()
        .and_then(|history| {
            // Newest first; the first assistant row is the response we just
            // got, the one before it is the detectors' context.
            history
                .into_iter()
                .filter(|c| c.message_type == MessageRole::Assistant)
                .nth(1)
                .map(|c| c.prompt)
        });

    let base = TurnContext {
        working_dir: session.config.working_dir.clone(),
        user_id: session.config.user_id.clone(),
        personality: Some(session.config.personality.clone()),
        ..Default::default()
    };

    let user_turn = TurnContext {
        prompt: prompt.to_string(),
        role: MessageRole::User,
        previous_assistant,
        ..base.clone()
    };
    if let Err(e) = state.collector.process(&user_turn) {
        warn!(error = %e, "trigger collection failed for user turn");
    }

    let assistant_turn = TurnContext {
        prompt: response_text.to_string(),
        role: MessageRole::Assistant,
        previous_user: Some(prompt.to_string()),
        ..base
    };
    if let Err(e) = state.collector.process(&assistant_turn) {
        warn!(error = %e, "trigger collection failed for assistant turn");
    }
}

/// Receive from the active stream, or park forever when there is none.
async fn next_event(stream_rx: &mut Option<mpsc::Receiver<AgentEvent>>) -> Option<AgentEvent> {
    match stream_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle one parsed client envelope. Returns true when the connection
/// should close.
async fn handle_client_message(
    msg: ClientMessage,
    state: &Arc<AppState>,
    current_session: &mut Option<Arc<AgentSession>>,
    stream_rx: &mut Option<mpsc::Receiver<AgentEvent>>,
    tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match msg {
        ClientMessage::NewSession { config } => {
            match state.agent.create_session(config.into()).await {
                Ok(session) => {
                    let ready = state.agent.session_ready_event(&session);
                    *current_session = Some(session);
                    let _ = send_json(tx, &ready).await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to create session");
                    let event = error_event(format!("Failed to create session: {e}"), true);
                    let _ = send_json(tx, &event).await;
                }
            }
        }

        ClientMessage::ResumeSession {
            session_id,
            last_seq,
        } => match state.agent.resume_session(session_id).await {
            Ok(session) => {
                let ready = state.agent.session_ready_event(&session);
                let _ = send_json(tx, &ready).await;
                // Replay everything the client missed, in order, before any
                // new event. More than the ring holds means a full reload.
                if let Some(last_seq) = last_seq {
                    for event in state.agent.events_since(session_id, last_seq) {
                        if send_json(tx, &event).await.is_err() {
                            return true;
                        }
                    }
                }
                *current_session = Some(session);
            }
            Err(e) => {
                let event = error_event(format!("Failed to resume session: {e}"), true);
                let _ = send_json(tx, &event).await;
            }
        },

        ClientMessage::Query { prompt } => match current_session {
            Some(session) => {
                *stream_rx = Some(state.agent.query(session.clone(), prompt).await);
            }
            None => {
                let event = error_event("No active session — send new_session first", true);
                let _ = send_json(tx, &event).await;
            }
        },

        ClientMessage::UpdateConfig { config } => match current_session {
            Some(session) => {
                match state
                    .agent
                    .update_session_config(session.session_id, config.into())
                    .await
                {
                    Ok(updated) => {
                        let ready = state.agent.session_ready_event(&updated);
                        *current_session = Some(updated);
                        let _ = send_json(tx, &ready).await;
                    }
                    Err(e) => {
                        let event = error_event(format!("Failed to update config: {e}"), true);
                        let _ = send_json(tx, &event).await;
                    }
                }
            }
            None => {
                let event = error_event("No active session", true);
                let _ = send_json(tx, &event).await;
            }
        },

        ClientMessage::Cancel => {
            if let Some(session) = current_session {
                state.agent.cancel_query(session.session_id);
            }
        }

        ClientMessage::PermissionResponse {
            request_id,
            allowed,
            deny_message,
        } => {
            if let Some(session) = current_session {
                let resolved = state.agent.resolve_permission(
                    session.session_id,
                    &request_id,
                    allowed,
                    deny_message,
                );
                if !resolved {
                    let event = error_event(
                        format!("Unknown permission request: {request_id}"),
                        true,
                    );
                    let _ = send_json(tx, &event).await;
                }
            }
        }

        ClientMessage::Ping => {
            let _ = send_json(tx, &serde_json::json!({ "type": "pong" })).await;
        }

        ClientMessage::Close => return true,
    }
    false
}

/// Serialize and send a value over the WS sink.
async fn send_json<T: serde::Serialize>(
    tx: &mut SplitSink<WebSocket, Message>,
    payload: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(payload).unwrap_or_default();
    tx.send(Message::Text(json.into()))
        .await
        .map_err(axum::Error::new)
}
