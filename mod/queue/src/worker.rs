use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::wakeup::TaskRunnerWakeupService;

/// Start the background wakeup ticker.
///
/// The runner chain normally re-arms itself, but a crashed process or a
/// cold start leaves the queue dormant; this loop is the recovery trigger
/// that gets it moving again. Returns a CancellationToken that stops the
/// loop when cancelled.
pub fn start(wakeup: Arc<TaskRunnerWakeupService>, config: &RunnerConfig) -> CancellationToken {
    let cancel = CancellationToken::new();
    let interval = config.wakeup_check_interval;

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!("queue wakeup ticker started (interval={interval:?})");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("queue wakeup ticker stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("wakeup tick");
                        let wakeup = Arc::clone(&wakeup);
                        // The tick must not stall on a slow storage call.
                        let _ = tokio::task::spawn_blocking(move || wakeup.wakeup()).await;
                    }
                }
            }
        });
    }

    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner_unit::RunnerUnit;
    use crate::spawn::test_support::CapturingStarter;
    use crate::runner_status::RunnerStatusStorage;
    use shipsync_sql::SqliteStore;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn ticker_fires_wakeups() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let storage = Arc::new(RunnerStatusStorage::new(db).unwrap());
        let starter = Arc::new(CapturingStarter::new());
        let config = RunnerConfig {
            wakeup_check_interval: Duration::from_millis(10),
            ..RunnerConfig::default()
        };
        let wakeup = Arc::new(TaskRunnerWakeupService::new(
            storage,
            Arc::clone(&starter) as _,
            config.clone(),
        ));

        let cancel = start(Arc::clone(&wakeup), &config);

        // Wait for at least one tick to land.
        let mut waited = Duration::ZERO;
        while starter.started().is_empty() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        cancel.cancel();

        let dispatched = starter.started();
        assert!(!dispatched.is_empty());
        assert!(matches!(dispatched[0], RunnerUnit::RunRunner { .. }));

        // Only one dispatch even after several ticks: the claimed status
        // stays live, so further ticks are no-ops.
        assert_eq!(dispatched.len(), 1);
    }
}
