use std::sync::Arc;

use tracing::{debug, info, warn};

use shipsync_core::now_unix;

use crate::batch::AsyncBatchStarter;
use crate::config::RunnerConfig;
use crate::error::QueueError;
use crate::runner_status::{RunnerStatusStorage, TaskRunnerStatus};
use crate::runner_unit::RunnerUnit;
use crate::service::QueueService;
use crate::spawn::AsyncProcessStarter;
use crate::wakeup::TaskRunnerWakeupService;

/// One orchestration cycle of the queue, run inside whatever process the
/// wakeup mechanism started.
///
/// A cycle reconciles stalled IN_PROGRESS items, dispatches as many due
/// QUEUED items as the concurrency budget allows, releases the liveness
/// slot and re-arms the next wakeup. The guard at the top keeps zombie
/// runner instances (superseded or expired guids) from touching the queue.
pub struct TaskRunner {
    guid: String,
    queue: Arc<QueueService>,
    status_storage: Arc<RunnerStatusStorage>,
    spawner: Arc<dyn AsyncProcessStarter>,
    wakeup: Arc<TaskRunnerWakeupService>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        guid: String,
        queue: Arc<QueueService>,
        status_storage: Arc<RunnerStatusStorage>,
        spawner: Arc<dyn AsyncProcessStarter>,
        wakeup: Arc<TaskRunnerWakeupService>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            guid,
            queue,
            status_storage,
            spawner,
            wakeup,
            config,
        }
    }

    /// Run one lifecycle. Never raises: this entry point is reached from
    /// best-effort triggers, so failures are logged and absorbed.
    pub fn run(&self) {
        match self.is_current_live_runner() {
            Ok(true) => {}
            Ok(false) => {
                info!(guid = %self.guid, "task runner is not the live instance, exiting");
                return;
            }
            Err(err) => {
                warn!(guid = %self.guid, error = %err, "task runner guard check failed, exiting");
                return;
            }
        }

        debug!(guid = %self.guid, "task runner cycle starting");

        // A failed pass must not stall the pipeline: whatever happened, the
        // lifecycle still ends with a released slot and a re-armed wakeup,
        // so the next cycle gets another look at the queue.
        if let Err(err) = self.reconcile_running_items() {
            warn!(guid = %self.guid, error = %err, "reconciliation pass failed");
        }
        if let Err(err) = self.dispatch_due_items() {
            warn!(guid = %self.guid, error = %err, "dispatch pass failed");
        }

        self.finish_lifecycle();
    }

    /// This runner acts only while its own guid is the recorded live status.
    fn is_current_live_runner(&self) -> Result<bool, QueueError> {
        let status = self.status_storage.status()?;
        Ok(status.guid == self.guid && !status.is_expired(self.config.max_alive_time))
    }

    /// Requeue or fail every IN_PROGRESS item that went quiet.
    ///
    /// An item that advanced since its last execution attempt is merely
    /// slow: requeue it for another run. An item with no progress gets its
    /// task's cleanup hook, then goes through the regular fail path.
    fn reconcile_running_items(&self) -> Result<(), QueueError> {
        let threshold = self.config.task_inactivity_threshold.as_secs() as i64;
        let now = now_unix();

        for mut item in self.queue.find_running_items()? {
            let last_seen = item
                .last_update_time
                .or(item.start_time)
                .or(item.queue_time)
                .unwrap_or(0);
            if now - last_seen <= threshold {
                continue;
            }

            let id = item.id.unwrap_or_default();
            if item.progress_base_points > item.last_execution_progress_base_points {
                debug!(item = id, "inactive but progressing, requeueing");
                if let Err(err) = self.queue.requeue(&mut item) {
                    warn!(item = id, error = %err, "failed to requeue inactive item");
                }
            } else {
                match self.queue.task_for(&item) {
                    Ok(mut task) => {
                        task.reconfigure();
                        match task.serialize() {
                            Ok(bytes) => item.serialized_task = bytes,
                            Err(err) => {
                                warn!(item = id, error = %err, "cannot persist reconfigured task")
                            }
                        }
                    }
                    Err(err) => {
                        warn!(item = id, error = %err, "cannot deserialize task for cleanup")
                    }
                }

                let message = format!(
                    "Task {} of type {} failed due to extended inactivity period",
                    id, item.task_type
                );
                warn!(item = id, task_type = %item.task_type, "failing inactive item");
                if let Err(err) = self.queue.fail(&mut item, &message) {
                    warn!(item = id, error = %err, "failed to fail inactive item");
                }
            }
        }

        Ok(())
    }

    /// Fill the free concurrency slots with the globally-oldest queued
    /// items, fanned out through a batch starter.
    fn dispatch_due_items(&self) -> Result<(), QueueError> {
        let running = self.queue.find_running_items()?.len();
        let slots = self.config.max_concurrent_tasks.saturating_sub(running);
        if slots == 0 {
            debug!("all runner slots busy, nothing to dispatch");
            return Ok(());
        }

        let due = self.queue.find_oldest_queued_items(slots)?;
        if due.is_empty() {
            return Ok(());
        }

        let units: Vec<RunnerUnit> = due
            .iter()
            .filter_map(|item| item.id)
            .map(|item_id| RunnerUnit::RunQueueItem { item_id })
            .collect();

        info!(count = units.len(), "dispatching due queue items");
        AsyncBatchStarter::new(self.config.batch_size, units).run(self.spawner.as_ref())
    }

    /// End of lifecycle: release the slot, pause, re-arm the next wakeup.
    fn finish_lifecycle(&self) {
        if let Err(err) = self.status_storage.set_status(&TaskRunnerStatus::empty()) {
            warn!(guid = %self.guid, error = %err, "failed to release runner slot");
        }
        std::thread::sleep(self.config.wakeup_delay);
        self.wakeup.wakeup();
    }
}
