//! HTTP request handlers.

use super::AppState;
use crate::db::{AlertDefinition, DbError};
use crate::dispatch::DispatchError;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;

fn dispatch_error(e: DispatchError) -> Response {
    let status = match &e {
        DispatchError::Store(DbError::NotFound) => StatusCode::NOT_FOUND,
        DispatchError::InvalidState(..) => StatusCode::CONFLICT,
        DispatchError::MissingField(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("API: {}", e);
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn not_mounted() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

pub async fn handle_healthz(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = json!({
        "status": "ok",
        "run_mode": state.run_mode.as_str(),
    });
    if let Some(executor) = &state.executor {
        body["executor"] = json!(executor.name());
        body["task_count"] = json!(executor.task_count());
    }
    if let Some(watcher) = &state.watcher {
        body["executors"] = json!(watcher.member_count());
    }
    Json(body)
}

// ============================================================================
// Executor / watcher views
// ============================================================================

pub async fn handle_get_runners(State(state): State<AppState>) -> Response {
    match &state.executor {
        Some(executor) => Json(executor.runners()).into_response(),
        None => not_mounted(),
    }
}

pub async fn handle_get_executors(State(state): State<AppState>) -> Response {
    match &state.watcher {
        Some(watcher) => Json(watcher.members()).into_response(),
        None => not_mounted(),
    }
}

// ============================================================================
// API: Alerts
// ============================================================================

pub async fn handle_create_alert(State(state): State<AppState>, Json(def): Json<AlertDefinition>) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };

    if def.alert_name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "alert_name is required").into_response();
    }
    if def.rules.is_empty() {
        return (StatusCode::BAD_REQUEST, "at least one rule is required").into_response();
    }

    match dispatcher.create_alert(&def).await {
        Ok(alert_id) => (StatusCode::CREATED, Json(json!({ "alert_id": alert_id }))).into_response(),
        Err(e) => dispatch_error(e),
    }
}

pub async fn handle_update_alert(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };
    match dispatcher.request_update(&id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "alert_id": id }))).into_response(),
        Err(e) => dispatch_error(e),
    }
}

pub async fn handle_delete_alert(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };
    match dispatcher.request_delete(&id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "alert_id": id }))).into_response(),
        Err(e) => dispatch_error(e),
    }
}

pub async fn handle_get_histories(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };
    match dispatcher.store().list_histories(&id) {
        Ok(histories) => Json(histories).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Histories
// ============================================================================

#[derive(Deserialize)]
pub struct CommentRequest {
    #[serde(default)]
    pub addresser: String,
    #[serde(default)]
    pub content: String,
}

pub async fn handle_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommentRequest>,
) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };
    match dispatcher.request_comment(&id, &req.addresser, &req.content).await {
        Ok((alert_id, comment)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "alert_id": alert_id, "history_id": id, "comment_id": comment.comment_id })),
        )
            .into_response(),
        Err(e) => dispatch_error(e),
    }
}

pub async fn handle_get_comments(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(dispatcher) = &state.dispatcher else { return not_mounted() };
    match dispatcher.store().list_comments(&id) {
        Ok(comments) => Json(comments).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
