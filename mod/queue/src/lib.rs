pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod model;
pub mod process;
pub mod runner;
pub mod runner_status;
pub mod runner_unit;
pub mod service;
pub mod spawn;
pub mod store;
pub mod task;
pub mod wakeup;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use shipsync_core::Module;
use shipsync_sql::SQLStore;

pub use batch::AsyncBatchStarter;
pub use config::RunnerConfig;
pub use error::QueueError;
pub use model::{MAX_PROGRESS, QueueItem, QueueItemStatus};
pub use runner::TaskRunner;
pub use runner_status::{RunnerStatusStorage, TaskRunnerStatus};
pub use runner_unit::{RunnerUnit, Runtime};
pub use service::{MAX_RETRIES, QueueService};
pub use spawn::{AsyncProcessStarter, HttpProcessStarter, InProcessStarter};
pub use task::{ExecutionContext, Task, TaskError, TaskRegistry};
pub use wakeup::TaskRunnerWakeupService;

use process::ProcessStore;
use store::QueueStore;

/// The queue module — durable background task execution.
///
/// Embed this in a backend service to get task enqueueing, single-active-
/// runner dispatch, retry/failure bookkeeping and inactivity self-healing.
/// Register task kinds through [`QueueModule::registry`] before serving.
pub struct QueueModule {
    runtime: Arc<Runtime>,
    _dispatcher_cancel: Option<CancellationToken>,
    _ticker_cancel: CancellationToken,
}

impl QueueModule {
    /// In-process dispatch with default tuning. Must be called within a
    /// Tokio runtime (background loops are spawned here).
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, QueueError> {
        Self::with_config(db, RunnerConfig::default())
    }

    /// In-process dispatch with explicit tuning.
    pub fn with_config(db: Arc<dyn SQLStore>, config: RunnerConfig) -> Result<Self, QueueError> {
        let processes = Arc::new(ProcessStore::new(Arc::clone(&db))?);
        let (starter, rx) = InProcessStarter::channel();
        let spawner: Arc<dyn AsyncProcessStarter> = Arc::new(starter);
        let runtime = build_runtime(&db, &config, spawner, processes)?;

        let dispatcher_cancel = spawn::start_dispatcher(Arc::clone(&runtime), rx);
        let ticker_cancel = worker::start(Arc::clone(runtime.wakeup()), &config);

        Ok(Self {
            runtime,
            _dispatcher_cancel: Some(dispatcher_cancel),
            _ticker_cancel: ticker_cancel,
        })
    }

    /// HTTP dispatch: units are persisted and fired as requests against
    /// `{endpoint}/{guid}`, which should resolve to this module's
    /// `POST /process/{guid}` route. Each unit then runs inside its own
    /// request lifecycle — the mode for stateless web hosts.
    pub fn with_http_dispatch(
        db: Arc<dyn SQLStore>,
        config: RunnerConfig,
        endpoint: &str,
    ) -> Result<Self, QueueError> {
        let processes = Arc::new(ProcessStore::new(Arc::clone(&db))?);
        let spawner: Arc<dyn AsyncProcessStarter> = Arc::new(HttpProcessStarter::new(
            Arc::clone(&processes),
            endpoint,
            config.async_request_timeout,
        )?);
        let runtime = build_runtime(&db, &config, spawner, processes)?;

        let ticker_cancel = worker::start(Arc::clone(runtime.wakeup()), &config);

        Ok(Self {
            runtime,
            _dispatcher_cancel: None,
            _ticker_cancel: ticker_cancel,
        })
    }

    /// Task kind registration, for embedding services.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.runtime.queue().registry()
    }

    pub fn queue(&self) -> &Arc<QueueService> {
        self.runtime.queue()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}

fn build_runtime(
    db: &Arc<dyn SQLStore>,
    config: &RunnerConfig,
    spawner: Arc<dyn AsyncProcessStarter>,
    processes: Arc<ProcessStore>,
) -> Result<Arc<Runtime>, QueueError> {
    let registry = Arc::new(TaskRegistry::new());
    let store = Arc::new(QueueStore::new(Arc::clone(db))?);
    let status = Arc::new(RunnerStatusStorage::new(Arc::clone(db))?);

    let wakeup = Arc::new(TaskRunnerWakeupService::new(
        Arc::clone(&status),
        Arc::clone(&spawner),
        config.clone(),
    ));
    let queue = Arc::new(QueueService::new(store, registry, Arc::clone(&wakeup)));

    Ok(Arc::new(Runtime::new(
        queue,
        status,
        wakeup,
        spawner,
        processes,
        config.clone(),
    )))
}

impl Module for QueueModule {
    fn name(&self) -> &str {
        "queue"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.runtime))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::{ECHO_TYPE, EchoTask};
    use shipsync_sql::SqliteStore;
    use std::time::Duration;

    fn memory_db() -> Arc<dyn SQLStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn module_exposes_name_and_routes() {
        let module = QueueModule::new(memory_db()).unwrap();
        assert_eq!(module.name(), "queue");
        let _routes = module.routes();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_to_end_in_process_execution() {
        let config = RunnerConfig {
            wakeup_delay: Duration::from_millis(20),
            wakeup_check_interval: Duration::from_millis(50),
            ..RunnerConfig::default()
        };
        let module = QueueModule::with_config(memory_db(), config).unwrap();
        module.registry().register_serde::<EchoTask>(ECHO_TYPE);

        let queue = Arc::clone(module.queue());
        let item = tokio::task::spawn_blocking(move || {
            queue.enqueue("default", &EchoTask::new("e2e"), "")
        })
        .await
        .unwrap()
        .unwrap();
        let id = item.id.unwrap();

        // enqueue → wakeup → runner → item starter → execute → finish
        let mut waited = Duration::ZERO;
        loop {
            let queue = Arc::clone(module.queue());
            let status = tokio::task::spawn_blocking(move || queue.find(id).map(|i| i.status))
                .await
                .unwrap()
                .unwrap();
            if status == QueueItemStatus::Completed {
                break;
            }
            assert!(
                waited < Duration::from_secs(10),
                "queue item never completed (status {status})"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += Duration::from_millis(25);
        }

        let queue = Arc::clone(module.queue());
        let done = tokio::task::spawn_blocking(move || queue.find(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.progress_base_points, MAX_PROGRESS);
        assert!(done.finish_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_dispatch_persists_units_for_the_far_side() {
        let db = memory_db();
        let module = QueueModule::with_http_dispatch(
            Arc::clone(&db),
            RunnerConfig::default(),
            "http://127.0.0.1:9/queue/process",
        )
        .unwrap();
        module.registry().register_serde::<EchoTask>(ECHO_TYPE);

        // Enqueue fires a wakeup, which claims the slot and persists a
        // run_runner unit for the (unreachable) far side.
        let queue = Arc::clone(module.queue());
        tokio::task::spawn_blocking(move || queue.enqueue("default", &EchoTask::new("x"), ""))
            .await
            .unwrap()
            .unwrap();

        let rows = db
            .query("SELECT guid, payload FROM async_process", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        let payload = rows[0].get_str("payload").unwrap();
        let unit: RunnerUnit = serde_json::from_str(payload).unwrap();
        assert!(matches!(unit, RunnerUnit::RunRunner { .. }));

        // The stored unit is loadable through the process store as the
        // receiving request would do it.
        let guid = rows[0].get_str("guid").unwrap();
        let loaded = module.runtime().processes().load(guid).unwrap();
        assert_eq!(loaded, unit);
    }
}
