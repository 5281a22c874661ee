use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;

fn storage_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[derive(Deserialize)]
pub struct BuildRequest {
    pub session_id: i64,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub personality: String,
    pub user_id: Option<String>,
    #[serde(default = "default_depth")]
    pub context_depth: usize,
    pub current_prompt: String,
}

fn default_depth() -> usize {
    5
}

/// POST /context/build — assemble a retrieval bundle for the session and
/// cache it. Without a search collaborator the result is "unavailable".
pub async fn build(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(search) = &state.search else {
        return Ok(Json(json!({ "status": "unavailable", "context": "" })));
    };

    let user_id = req.user_id.as_deref().unwrap_or("default");
    let mut parts: Vec<String> = Vec::new();
    if let Some(entities) = search.entity_context(user_id, req.context_depth).await {
        parts.push(format!("# Relevant Entities\n{entities}"));
    }
    if let Some(previous) = search.previous_context(user_id, 7 * 24 * 60).await {
        parts.push(format!("# Relevant Facts\n{previous}"));
    }
    let context_text = parts.join("\n\n");

    if let Err(e) = state
        .sessions
        .context_cache_upsert(req.session_id, &context_text, None)
    {
        warn!(error = %e, "failed to cache context");
        return Err(storage_error(e));
    }

    Ok(Json(json!({ "status": "ready", "context": context_text })))
}

#[derive(Deserialize)]
pub struct GetRequest {
    pub session_id: i64,
    #[serde(default = "default_max_age")]
    pub max_age_minutes: i64,
}

fn default_max_age() -> i64 {
    30
}

/// POST /context/get — cached context if fresh enough.
pub async fn get_cached(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cached = state
        .sessions
        .context_cache_get_if_fresh(req.session_id, req.max_age_minutes)
        .map_err(storage_error)?;
    Ok(Json(json!({
        "found": cached.is_some(),
        "context": cached.map(|c| c.context_text).unwrap_or_default(),
    })))
}
