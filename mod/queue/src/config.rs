use std::time::Duration;

/// Tuning values for the runner and its dispatch machinery.
///
/// Defaults suit a small shop backend; hosts with heavier sync volume raise
/// `max_concurrent_tasks` and `batch_size` together.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on simultaneously IN_PROGRESS queue items.
    pub max_concurrent_tasks: usize,

    /// A runner liveness token older than this is presumed dead and the
    /// slot becomes claimable again.
    pub max_alive_time: Duration,

    /// An IN_PROGRESS item with no progress/keep-alive report for this long
    /// is reconciled (requeued or failed) on the next runner cycle.
    pub task_inactivity_threshold: Duration,

    /// Pause between the end of one runner lifecycle and re-arming the next
    /// wakeup.
    pub wakeup_delay: Duration,

    /// Max units a single batch node dispatches directly; larger sets are
    /// nested into sub-batches.
    pub batch_size: usize,

    /// How often the background ticker fires a recovery wakeup.
    pub wakeup_check_interval: Duration,

    /// Per-request timeout for fire-and-forget dispatch HTTP calls.
    pub async_request_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            max_alive_time: Duration::from_secs(60),
            task_inactivity_threshold: Duration::from_secs(30),
            wakeup_delay: Duration::from_secs(5),
            batch_size: 8,
            wakeup_check_interval: Duration::from_secs(30),
            async_request_timeout: Duration::from_secs(1),
        }
    }
}
