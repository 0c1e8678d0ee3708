use std::sync::Arc;

use shipsync_core::{ListResult, now_unix};

use crate::error::QueueError;
use crate::model::{MAX_PROGRESS, QueueItem, QueueItemStatus};
use crate::store::{QueueItemQuery, QueueStore};
use crate::task::{ExecutionContext, Task, TaskRegistry};
use crate::wakeup::TaskRunnerWakeupService;

/// Retries granted after the first failed attempt. An item permanently
/// fails on attempt `MAX_RETRIES + 1`.
pub const MAX_RETRIES: u32 = 5;

/// The queue's data-access and state-transition API.
///
/// Every operation persists the resulting item through the store before
/// returning; a persistence failure surfaces as
/// [`QueueError::StorageUnavailable`] and the state change does not happen.
/// Transition legality is enforced by the item model — callers never see a
/// silently coerced status.
pub struct QueueService {
    store: Arc<QueueStore>,
    registry: Arc<TaskRegistry>,
    wakeup: Arc<TaskRunnerWakeupService>,
}

impl QueueService {
    pub fn new(
        store: Arc<QueueStore>,
        registry: Arc<TaskRegistry>,
        wakeup: Arc<TaskRunnerWakeupService>,
    ) -> Self {
        Self {
            store,
            registry,
            wakeup,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    // =======================================================================
    // Enqueue / lookup
    // =======================================================================

    /// Wrap a task into a queue item, persist it as QUEUED and nudge the
    /// runner so pending work is picked up promptly.
    pub fn enqueue(
        &self,
        queue_name: &str,
        task: &dyn Task,
        context: &str,
    ) -> Result<QueueItem, QueueError> {
        let serialized = task.serialize()?;
        let mut item = QueueItem::new(task.type_name(), queue_name, context, serialized);
        item.set_status(QueueItemStatus::Queued)?;

        let now = now_unix();
        item.create_time = Some(now);
        item.queue_time = Some(now);

        item.id = Some(self.store.insert(&item)?);

        // Fire-and-forget: wakeup swallows its own failures.
        self.wakeup.wakeup();

        Ok(item)
    }

    /// Load a single item; raises not-found if absent.
    pub fn find(&self, id: i64) -> Result<QueueItem, QueueError> {
        self.store.get(id)
    }

    /// Decode the item's stored blob back into a task.
    pub fn task_for(&self, item: &QueueItem) -> Result<Box<dyn Task>, QueueError> {
        self.registry
            .deserialize(&item.task_type, &item.serialized_task)
    }

    pub fn find_running_items(&self) -> Result<Vec<QueueItem>, QueueError> {
        self.store.find_by_status(QueueItemStatus::InProgress)
    }

    /// The globally-oldest QUEUED items across all queue names.
    pub fn find_oldest_queued_items(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        self.store.oldest_queued(limit)
    }

    /// Most recent item of a task type. Without a context the search spans
    /// all contexts.
    pub fn find_latest_by_type(
        &self,
        task_type: &str,
        context: Option<&str>,
    ) -> Result<Option<QueueItem>, QueueError> {
        self.store.latest_by_type(task_type, context)
    }

    pub fn list(&self, query: &QueueItemQuery) -> Result<ListResult<QueueItem>, QueueError> {
        self.store.list(query)
    }

    // =======================================================================
    // State transitions
    // =======================================================================

    /// QUEUED → IN_PROGRESS, then execute the task synchronously.
    ///
    /// The claim is a compare-and-set against the persisted status, so two
    /// processes racing on the same item start it exactly once. A task
    /// error is caught here and routed through the retry/fail path — never
    /// rethrown raw. On return `item` reflects the post-execution state.
    pub fn start(&self, item: &mut QueueItem) -> Result<(), QueueError> {
        let mut task = self.task_for(item)?;

        item.set_status(QueueItemStatus::InProgress)?;
        let now = now_unix();
        item.start_time = Some(now);
        item.last_update_time = Some(now);

        let id = item.id.ok_or_else(|| {
            QueueError::Internal("cannot start a queue item that was never persisted".into())
        })?;
        if !self.store.update_guarded(item, QueueItemStatus::Queued)? {
            return Err(QueueError::Conflict(format!(
                "queue item {id} is already claimed by another process"
            )));
        }

        let ctx = ItemExecutionContext {
            service: self,
            item_id: id,
        };
        if let Err(task_err) = task.execute(&ctx) {
            let mut fresh = self.store.get(id)?;
            self.fail(&mut fresh, &task_err.to_string())?;
            *item = fresh;
            return Ok(());
        }

        // Pick up progress the task reported while running.
        *item = self.store.get(id)?;
        Ok(())
    }

    /// IN_PROGRESS → QUEUED for a slow-but-alive task: remember how far it
    /// got, clear the execution timestamps, keep retries and queue position.
    pub fn requeue(&self, item: &mut QueueItem) -> Result<(), QueueError> {
        item.set_status(QueueItemStatus::Queued)?;
        item.last_execution_progress_base_points = item.progress_base_points;
        item.start_time = None;
        item.finish_time = None;
        item.fail_time = None;
        self.store.update(item)
    }

    /// IN_PROGRESS → QUEUED (retry) or FAILED (terminal).
    ///
    /// Appends one `Attempt N: <message>` line, increments retries, and
    /// requeues while attempts remain. The failure log is cumulative and
    /// never truncated.
    pub fn fail(&self, item: &mut QueueItem, message: &str) -> Result<(), QueueError> {
        if item.status != QueueItemStatus::InProgress {
            return Err(QueueError::IllegalTransition {
                from: item.status,
                to: QueueItemStatus::Failed,
            });
        }

        item.add_failure(message);
        item.retries += 1;

        if item.retries > MAX_RETRIES {
            item.set_status(QueueItemStatus::Failed)?;
            item.fail_time = Some(now_unix());
        } else {
            item.set_status(QueueItemStatus::Queued)?;
            item.start_time = None;
            item.finish_time = None;
        }

        self.store.update(item)
    }

    /// IN_PROGRESS → COMPLETED. Progress is forced to 100% regardless of
    /// what the task last reported.
    pub fn finish(&self, item: &mut QueueItem) -> Result<(), QueueError> {
        item.set_status(QueueItemStatus::Completed)?;
        item.progress_base_points = MAX_PROGRESS;
        item.finish_time = Some(now_unix());
        self.store.update(item)
    }

    /// IN_PROGRESS → ABORTED. The only cancellation primitive; queued and
    /// terminal items cannot be aborted.
    pub fn abort(&self, item: &mut QueueItem, message: &str) -> Result<(), QueueError> {
        item.set_status(QueueItemStatus::Aborted)?;
        item.add_failure(message);
        item.fail_time = Some(now_unix());
        self.store.update(item)
    }

    // =======================================================================
    // In-flight reporting
    // =======================================================================

    /// Record progress for a running item; counts as a liveness signal.
    pub fn update_progress(
        &self,
        item: &mut QueueItem,
        base_points: u16,
    ) -> Result<(), QueueError> {
        if item.status != QueueItemStatus::InProgress {
            return Err(QueueError::ItemNotStarted(item.id.unwrap_or_default()));
        }
        item.set_progress_base_points(base_points)?;
        item.last_update_time = Some(now_unix());
        self.store.update(item)
    }

    /// Refresh the liveness timestamp of a running item.
    pub fn keep_alive(&self, item: &mut QueueItem) -> Result<(), QueueError> {
        if item.status != QueueItemStatus::InProgress {
            return Err(QueueError::ItemNotStarted(item.id.unwrap_or_default()));
        }
        item.last_update_time = Some(now_unix());
        self.store.update(item)
    }
}

/// Per-item callbacks handed to an executing task. Each call re-reads the
/// persisted item, so reports race correctly with external transitions.
struct ItemExecutionContext<'a> {
    service: &'a QueueService,
    item_id: i64,
}

impl ExecutionContext for ItemExecutionContext<'_> {
    fn report_progress(&self, base_points: u16) -> Result<(), QueueError> {
        let mut item = self.service.find(self.item_id)?;
        self.service.update_progress(&mut item, base_points)
    }

    fn report_alive(&self) -> Result<(), QueueError> {
        let mut item = self.service.find(self.item_id)?;
        self.service.keep_alive(&mut item)
    }
}
