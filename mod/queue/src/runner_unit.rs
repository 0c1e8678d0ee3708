use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::AsyncBatchStarter;
use crate::config::RunnerConfig;
use crate::model::QueueItemStatus;
use crate::process::ProcessStore;
use crate::runner::TaskRunner;
use crate::runner_status::RunnerStatusStorage;
use crate::service::QueueService;
use crate::spawn::AsyncProcessStarter;
use crate::wakeup::TaskRunnerWakeupService;

// ---------------------------------------------------------------------------
// RunnerUnit — the closed set of work that crosses the dispatch boundary
// ---------------------------------------------------------------------------

/// A serializable unit handed to the out-of-band dispatch mechanism.
///
/// Everything that leaves the current process is one of these tagged
/// variants; reconstruction on the far side goes through [`Runtime::execute`],
/// which re-validates liveness/ownership before doing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerUnit {
    /// Run a full task-runner lifecycle under the given liveness guid.
    RunRunner { guid: String },

    /// Start one queued item: claim, execute, finish.
    RunQueueItem { item_id: i64 },

    /// Re-run a nested batch of further units.
    RunBatch { batch: AsyncBatchStarter },
}

// ---------------------------------------------------------------------------
// Runtime — collaborator bundle for executing reconstructed units
// ---------------------------------------------------------------------------

/// Everything a deserialized [`RunnerUnit`] needs to act: the queue service,
/// the liveness storage, the wakeup service and the dispatcher itself.
pub struct Runtime {
    queue: Arc<QueueService>,
    runner_status: Arc<RunnerStatusStorage>,
    wakeup: Arc<TaskRunnerWakeupService>,
    spawner: Arc<dyn AsyncProcessStarter>,
    processes: Arc<ProcessStore>,
    config: RunnerConfig,
}

impl Runtime {
    pub fn new(
        queue: Arc<QueueService>,
        runner_status: Arc<RunnerStatusStorage>,
        wakeup: Arc<TaskRunnerWakeupService>,
        spawner: Arc<dyn AsyncProcessStarter>,
        processes: Arc<ProcessStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            queue,
            runner_status,
            wakeup,
            spawner,
            processes,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<QueueService> {
        &self.queue
    }

    pub fn wakeup(&self) -> &Arc<TaskRunnerWakeupService> {
        &self.wakeup
    }

    pub fn processes(&self) -> &Arc<ProcessStore> {
        &self.processes
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute one unit. Never raises: the units run from best-effort
    /// triggers, so every failure is logged and absorbed here.
    pub fn execute(&self, unit: &RunnerUnit) {
        match unit {
            RunnerUnit::RunRunner { guid } => self.run_runner(guid),
            RunnerUnit::RunQueueItem { item_id } => self.run_queue_item(*item_id),
            RunnerUnit::RunBatch { batch } => {
                if let Err(err) = batch.run(self.spawner.as_ref()) {
                    warn!(error = %err, "nested batch dispatch failed");
                }
            }
        }
    }

    /// Re-validate that this starter's guid still owns the runner slot,
    /// then run a full runner lifecycle. A starter that lost the slot while
    /// in flight exits without touching the queue.
    fn run_runner(&self, guid: &str) {
        match self.runner_status.status() {
            Ok(status) if status.guid == guid && !status.is_expired(self.config.max_alive_time) => {
                TaskRunner::new(
                    guid.to_string(),
                    Arc::clone(&self.queue),
                    Arc::clone(&self.runner_status),
                    Arc::clone(&self.spawner),
                    Arc::clone(&self.wakeup),
                    self.config.clone(),
                )
                .run();
            }
            Ok(_) => debug!(%guid, "runner starter is stale, exiting"),
            Err(err) => warn!(%guid, error = %err, "cannot validate runner status, exiting"),
        }
    }

    /// Start one queued item end to end. The QUEUED re-check plus the claim
    /// CAS inside `start` make duplicate dispatches harmless.
    fn run_queue_item(&self, item_id: i64) {
        let mut item = match self.queue.find(item_id) {
            Ok(item) => item,
            Err(err) => {
                warn!(item = item_id, error = %err, "queue item unavailable, skipping");
                return;
            }
        };

        if item.status != QueueItemStatus::Queued {
            debug!(item = item_id, status = %item.status, "queue item no longer due, skipping");
            return;
        }

        if let Err(err) = self.queue.start(&mut item) {
            warn!(item = item_id, error = %err, "failed to start queue item");
            return;
        }

        // Still IN_PROGRESS means the task ran clean; anything else was
        // already routed through the retry/fail path inside start().
        if item.status == QueueItemStatus::InProgress {
            if let Err(err) = self.queue.finish(&mut item) {
                warn!(item = item_id, error = %err, "failed to finish queue item");
            }
        }
    }
}
