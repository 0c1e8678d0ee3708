mod items;
mod process;

use std::sync::Arc;

use axum::Router;

use crate::runner_unit::Runtime;

/// Build the complete queue module router.
///
/// Routes:
/// - `POST /items`              — enqueue a task
/// - `GET  /items`              — list queue items
/// - `GET  /items/{id}`         — get one queue item
/// - `POST /items/{id}/@abort`  — abort a running item
/// - `POST /wakeup`             — trigger a runner wakeup
/// - `POST /process/{guid}`     — run a stored async process (dispatch target)
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .merge(items::router(Arc::clone(&runtime)))
        .merge(process::router(runtime))
}
