//! Profile admission and queue inspection handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use super::routes::AppState;
use super::types::{EnqueueRequest, EnqueueResult, QueueResponse};
use crate::queue::AddOutcome;

/// `POST /profiles`: accepts a single profile object or an array.
///
/// The answer mirrors the input shape: an object gets one result, an array
/// gets a result per element (malformed elements report their error instead
/// of failing the whole batch).
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match body {
        serde_json::Value::Array(items) => {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(enqueue_one(&state, item).await);
            }
            Ok(Json(serde_json::json!(results)))
        }
        item @ serde_json::Value::Object(_) => {
            let result = enqueue_one(&state, item).await;
            Ok(Json(serde_json::json!(result)))
        }
        _ => Err((
            StatusCode::BAD_REQUEST,
            "expected a profile object or an array of profiles".to_string(),
        )),
    }
}

async fn enqueue_one(state: &AppState, item: serde_json::Value) -> EnqueueResult {
    let request: EnqueueRequest = match serde_json::from_value(item) {
        Ok(request) => request,
        Err(e) => {
            return EnqueueResult {
                steam_id: String::new(),
                success: false,
                added: None,
                queue_len: None,
                message: Some(format!("invalid profile: {e}")),
            };
        }
    };
    if request.steam_id.trim().is_empty() || request.username.trim().is_empty() {
        return EnqueueResult {
            steam_id: request.steam_id,
            success: false,
            added: None,
            queue_len: None,
            message: Some("steam_id and username must be non-empty".to_string()),
        };
    }

    match state.queue.add(&request.steam_id, &request.username).await {
        Ok(AddOutcome::Added { queue_len }) => {
            tracing::info!(steam_id = %request.steam_id, queue_len, "Profile enqueued");
            EnqueueResult {
                steam_id: request.steam_id,
                success: true,
                added: Some(true),
                queue_len: Some(queue_len),
                message: None,
            }
        }
        Ok(AddOutcome::AlreadyPresent) => EnqueueResult {
            steam_id: request.steam_id,
            success: true,
            added: Some(false),
            queue_len: None,
            message: Some("already queued".to_string()),
        },
        Err(e) => EnqueueResult {
            steam_id: request.steam_id,
            success: false,
            added: None,
            queue_len: None,
            message: Some(e.to_string()),
        },
    }
}

/// `GET /profiles/queue`
pub async fn queue_snapshot(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueResponse>, (StatusCode, String)> {
    let profiles = state
        .queue
        .list()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let stats = state
        .queue
        .stats()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(QueueResponse { profiles, stats }))
}

/// `DELETE /profiles/:steam_id`
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(steam_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let removed = state
        .queue
        .remove(&steam_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !removed {
        return Err((
            StatusCode::NOT_FOUND,
            format!("profile {steam_id} not queued"),
        ));
    }
    Ok(Json(serde_json::json!({ "removed": true })))
}
