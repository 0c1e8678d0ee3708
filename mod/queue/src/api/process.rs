use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use shipsync_core::ServiceError;

use crate::runner_unit::Runtime;

type RuntimeState = Arc<Runtime>;

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/process/{guid}", post(run_process))
        .with_state(runtime)
}

// ---------------------------------------------------------------------------
// POST /process/:guid
// ---------------------------------------------------------------------------

/// The receiving end of HTTP dispatch: load the stored unit, consume its
/// record, run it on a blocking thread and reply immediately. The caller is
/// fire-and-forget; nothing about the unit's outcome belongs in the
/// response.
async fn run_process(
    State(runtime): State<RuntimeState>,
    Path(guid): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let unit = runtime.processes().load(&guid)?;

    // Consume before running so a duplicate request cannot fire the unit
    // twice.
    runtime.processes().delete(&guid)?;

    debug!(%guid, "running stored async process");
    let runtime = Arc::clone(&runtime);
    tokio::task::spawn_blocking(move || runtime.execute(&unit));

    Ok(Json(serde_json::json!({ "accepted": true })))
}
