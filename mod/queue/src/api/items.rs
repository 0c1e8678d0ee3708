use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use shipsync_core::ServiceError;

use crate::model::QueueItem;
use crate::runner_unit::Runtime;
use crate::store::QueueItemQuery;

type RuntimeState = Arc<Runtime>;

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/items", post(enqueue_item).get(list_items))
        .route("/items/{id}", get(get_item))
        .route("/items/{id}/@abort", post(abort_item))
        .route("/wakeup", post(trigger_wakeup))
        .with_state(runtime)
}

// ---------------------------------------------------------------------------
// POST /items
// ---------------------------------------------------------------------------

/// Body for `POST /items` — enqueue a new task.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    /// Registered task kind.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Queue lane; a bookkeeping label, not an ordering boundary.
    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default)]
    pub context: String,

    /// Task payload, passed to the kind's params factory.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_queue() -> String {
    "default".to_string()
}

async fn enqueue_item(
    State(runtime): State<RuntimeState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<QueueItem>, ServiceError> {
    let task = runtime
        .queue()
        .registry()
        .from_params(&req.task_type, req.payload)?;
    let item = runtime
        .queue()
        .enqueue(&req.queue, task.as_ref(), &req.context)?;
    Ok(Json(item))
}

// ---------------------------------------------------------------------------
// GET /items
// ---------------------------------------------------------------------------

async fn list_items(
    State(runtime): State<RuntimeState>,
    Query(query): Query<QueueItemQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let result = runtime.queue().list(&query)?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
    })))
}

// ---------------------------------------------------------------------------
// GET /items/:id
// ---------------------------------------------------------------------------

async fn get_item(
    State(runtime): State<RuntimeState>,
    Path(id): Path<i64>,
) -> Result<Json<QueueItem>, ServiceError> {
    let item = runtime.queue().find(id)?;
    Ok(Json(item))
}

// ---------------------------------------------------------------------------
// POST /items/:id/@abort
// ---------------------------------------------------------------------------

/// Body for `POST /items/{id}/@abort`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    #[serde(default = "default_abort_message")]
    pub message: String,
}

fn default_abort_message() -> String {
    "aborted by operator".to_string()
}

async fn abort_item(
    State(runtime): State<RuntimeState>,
    Path(id): Path<i64>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<QueueItem>, ServiceError> {
    let mut item = runtime.queue().find(id)?;
    runtime.queue().abort(&mut item, &req.message)?;
    Ok(Json(item))
}

// ---------------------------------------------------------------------------
// POST /wakeup
// ---------------------------------------------------------------------------

async fn trigger_wakeup(
    State(runtime): State<RuntimeState>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    runtime.wakeup().wakeup();
    Ok(Json(serde_json::json!({ "triggered": true })))
}
