use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use dere_core::types::MessageRole;
use dere_curiosity::triggers::TurnContext;

use crate::app::AppState;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn storage_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[derive(Deserialize)]
pub struct FindOrCreateRequest {
    pub working_dir: String,
    pub personality: Option<String>,
    #[serde(default = "default_medium")]
    pub medium: String,
    pub max_age_hours: Option<i64>,
    pub user_id: Option<String>,
}

fn default_medium() -> String {
    "cli".to_string()
}

#[derive(Serialize)]
pub struct FindOrCreateResponse {
    pub session_id: i64,
    pub resumed: bool,
    pub claude_session_id: Option<String>,
}

/// POST /sessions/find_or_create — session continuity for CLI and adapters.
pub async fn find_or_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FindOrCreateRequest>,
) -> Result<Json<FindOrCreateResponse>, (StatusCode, Json<Value>)> {
    let result = state
        .sessions
        .find_or_create(
            &req.working_dir,
            req.personality.as_deref(),
            &req.medium,
            req.max_age_hours,
            req.user_id.as_deref(),
        )
        .map_err(storage_error)?;
    Ok(Json(FindOrCreateResponse {
        session_id: result.session_id,
        resumed: result.resumed,
        claude_session_id: result.claude_session_id,
    }))
}

/// POST /sessions/{id}/claude_session — store the provider resume token.
/// Idempotent.
pub async fn set_claude_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(token): Json<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.sessions.set_claude_session_id(id, &token) {
        Ok(()) => Ok(Json(json!({ "status": "updated" }))),
        Err(dere_sessions::SessionError::NotFound { .. }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )),
        Err(e) => Err(storage_error(e)),
    }
}

#[derive(Deserialize)]
pub struct StoreMessageRequest {
    pub message: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// POST /sessions/{id}/message — append one turn and run the curiosity
/// trigger collector on it.
pub async fn store_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<StoreMessageRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let role: MessageRole = req.role.parse().map_err(|e: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e })),
        )
    })?;

    let session = state
        .sessions
        .get(id)
        .map_err(storage_error)?
        .ok_or((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        ))?;

    let message_id = state
        .sessions
        .append_conversation(
            id,
            &req.message,
            role,
            now_unix(),
            Some(&session.medium),
            session.user_id.as_deref(),
            None,
            &[],
        )
        .map_err(|e| match e {
            dere_sessions::SessionError::Ended { .. } => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "session has ended" })),
            ),
            other => storage_error(other),
        })?;

    // Curiosity triggers feed off every stored turn. Best-effort: failure
    // here never blocks the message write.
    let (previous_assistant, previous_user) = adjacent_turns(&state, id, message_id);
    let turn = TurnContext {
        prompt: req.message.clone(),
        role,
        conversation_id: message_id,
        working_dir: session.working_dir.clone(),
        user_id: session.user_id.clone(),
        personality: session.personality.clone(),
        speaker_name: None,
        is_command: req.message.trim_start().starts_with('/'),
        entities: Vec::new(),
        previous_assistant,
        previous_user,
    };
    if let Err(e) = state.collector.process(&turn) {
        warn!(error = %e, "trigger collection failed");
    }

    Ok(Json(json!({ "message_id": message_id })))
}

/// Most recent assistant/user turns before `message_id`, for the detectors
/// that compare against the prior exchange.
fn adjacent_turns(
    state: &AppState,
    session_id: i64,
    message_id: i64,
) -> (Option<String>, Option<String>) {
    let history = match state.sessions.history(session_id, 20) {
        Ok(history) => history,
        Err(_) => return (None, None),
    };
    let previous_assistant = history
        .iter()
        .find(|c| c.id < message_id && c.message_type == MessageRole::Assistant)
        .map(|c| c.prompt.clone());
    let previous_user = history
        .iter()
        .find(|c| c.id < message_id && c.message_type == MessageRole::User)
        .map(|c| c.prompt.clone());
    (previous_assistant, previous_user)
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /sessions/{id}/history?limit=N
pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let messages = state
        .sessions
        .history(id, query.limit)
        .map_err(storage_error)?;
    Ok(Json(json!({
        "messages": messages
            .iter()
            .map(|m| json!({
                "id": m.id,
                "prompt": m.prompt,
                "message_type": m.message_type,
                "timestamp": m.timestamp,
            }))
            .collect::<Vec<_>>()
    })))
}

/// GET /sessions/{id}/last_message_time
pub async fn last_message_time(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let last = state.sessions.last_message_time(id).map_err(storage_error)?;
    Ok(Json(json!({
        "session_id": id,
        "last_message_time": last,
    })))
}

/// POST /sessions/{id}/generate_name — derive a display name from the
/// session's first exchange.
pub async fn generate_name(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.agent.generate_session_name(id).await {
        Ok(Some(name)) => Ok(Json(json!({ "name": name }))),
        Ok(None) => Ok(Json(json!({ "name": Value::Null }))),
        Err(dere_agent::AgentError::SessionNotFound { .. }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )),
        Err(e) => Err(storage_error(e)),
    }
}

#[derive(Deserialize)]
pub struct EndSessionRequest {
    pub session_id: i64,
}

/// POST /sessions/end — end the session, generating a short summary of the
/// recent conversation when there is one.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndSessionRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state
        .sessions
        .get(req.session_id)
        .map_err(storage_error)?
        .is_none()
    {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        ));
    }

    let summary_generated = state
        .agent
        .end_session(req.session_id)
        .await
        .map_err(storage_error)?;
    info!(session_id = req.session_id, summary_generated, "session ended");
    Ok(Json(json!({
        "status": "ended",
        "summary_generated": summary_generated,
    })))
}
