use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use dere_core::types::Priority;
use dere_notify::types::{NewNotification, TriggerContext};
use dere_notify::NotifyError;

use crate::app::AppState;

fn map_error(e: NotifyError) -> (StatusCode, Json<Value>) {
    match e {
        NotifyError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "notification not found" })),
        ),
        NotifyError::InvalidTimestamp(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
        }
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": other.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
pub struct CreateRequest {
    pub user_id: String,
    pub target_medium: String,
    pub target_location: String,
    pub message: String,
    pub priority: String,
    pub routing_reasoning: String,
    pub parent_notification_id: Option<i64>,
    pub context_snapshot: Option<Value>,
    pub trigger_type: Option<String>,
    pub trigger_id: Option<String>,
    pub trigger_data: Option<Value>,
}

/// POST /notifications/create — enqueue a proactive message for delivery.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let priority: Priority = req
        .priority
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))))?;

    let id = state
        .notifications
        .create(&NewNotification {
            user_id: req.user_id,
            target_medium: req.target_medium,
            target_location: req.target_location,
            message: req.message,
            priority,
            routing_reasoning: req.routing_reasoning,
            parent_notification_id: req.parent_notification_id,
            context: TriggerContext {
                trigger_type: req.trigger_type,
                trigger_id: req.trigger_id,
                trigger_data: req.trigger_data,
                context_snapshot: req.context_snapshot,
            },
        })
        .map_err(map_error)?;

    Ok(Json(json!({ "notification_id": id, "status": "queued" })))
}

#[derive(Deserialize)]
pub struct PendingQuery {
    pub medium: String,
}

/// GET /notifications/pending?medium=X — adapters poll this for work.
pub async fn pending(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let rows = state.notifications.pending(&query.medium).map_err(map_error)?;
    Ok(Json(json!({
        "notifications": rows
            .iter()
            .map(|n| json!({
                "id": n.id,
                "user_id": n.user_id,
                "target_location": n.target_location,
                "message": n.message,
                "priority": n.priority,
                "routing_reasoning": n.routing_reasoning,
                "created_at": n.created_at,
            }))
            .collect::<Vec<_>>()
    })))
}

/// POST /notifications/{id}/delivered
pub async fn delivered(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.notifications.mark_delivered(id).map_err(map_error)?;
    Ok(Json(json!({ "status": "delivered" })))
}

#[derive(Deserialize)]
pub struct FailedRequest {
    pub error_message: String,
}

/// POST /notifications/{id}/failed
pub async fn failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FailedRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .notifications
        .mark_failed(id, &req.error_message)
        .map_err(map_error)?;
    Ok(Json(json!({ "status": "failed" })))
}

/// POST /notifications/{id}/acknowledge — the user responded on the medium.
/// Feeds the ambient FSM so escalation stops.
pub async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.notifications.acknowledge(id).map_err(map_error)?;
    state.ambient.record_acknowledgment();
    Ok(Json(json!({ "status": "acknowledged" })))
}

#[derive(Deserialize)]
pub struct RecentUnacknowledgedRequest {
    pub user_id: String,
    pub since: String,
}

/// POST /notifications/recent_unacknowledged — escalation context query.
pub async fn recent_unacknowledged(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecentUnacknowledgedRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let rows = state
        .notifications
        .recent_unacknowledged(&req.user_id, &req.since)
        .map_err(map_error)?;
    Ok(Json(json!({
        "notifications": rows
            .iter()
            .map(|n| json!({
                "id": n.id,
                "message": n.message,
                "priority": n.priority,
                "created_at": n.created_at,
                "delivered_at": n.delivered_at,
                "status": n.status,
                "acknowledged": n.acknowledged,
                "parent_notification_id": n.parent_notification_id,
            }))
            .collect::<Vec<_>>()
    })))
}
