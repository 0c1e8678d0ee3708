use std::sync::Arc;

use tracing::{debug, warn};

use shipsync_core::{new_id, now_unix};

use crate::config::RunnerConfig;
use crate::error::QueueError;
use crate::runner_status::{RunnerStatusStorage, TaskRunnerStatus};
use crate::runner_unit::RunnerUnit;
use crate::spawn::AsyncProcessStarter;

/// Decides whether a new runner needs to be started and, if so, claims the
/// slot and dispatches a runner starter out-of-band.
///
/// `wakeup` is a non-fatal boundary: it is invoked from best-effort
/// triggers (enqueue side effects, the recovery ticker, end of a runner
/// lifecycle) and must never crash the surrounding request, so every
/// failure is logged and absorbed here. Internal steps still propagate
/// strictly.
pub struct TaskRunnerWakeupService {
    storage: Arc<RunnerStatusStorage>,
    spawner: Arc<dyn AsyncProcessStarter>,
    config: RunnerConfig,
}

impl TaskRunnerWakeupService {
    pub fn new(
        storage: Arc<RunnerStatusStorage>,
        spawner: Arc<dyn AsyncProcessStarter>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            storage,
            spawner,
            config,
        }
    }

    /// Best-effort: start a runner if no live one is recorded.
    pub fn wakeup(&self) {
        match self.try_wakeup() {
            Ok(Some(guid)) => debug!(%guid, "task runner starter dispatched"),
            Ok(None) => debug!("live task runner present, wakeup skipped"),
            Err(QueueError::StatusChange { running_guid }) => {
                // Another process won the race; its runner will do the work.
                debug!(%running_guid, "task runner slot already claimed");
            }
            Err(err) => warn!(error = %err, "task runner wakeup failed"),
        }
    }

    fn try_wakeup(&self) -> Result<Option<String>, QueueError> {
        let current = self.storage.status()?;

        if !current.is_empty() {
            if !current.is_expired(self.config.max_alive_time) {
                return Ok(None);
            }
            // The recorded runner died mid-lifecycle. Release the slot first;
            // writing the sentinel is always permitted.
            self.storage.set_status(&TaskRunnerStatus::empty())?;
        }

        let guid = new_id();
        self.storage
            .set_status(&TaskRunnerStatus::new(guid.clone(), now_unix()))?;

        // Only a successfully recorded claim may start a runner.
        self.spawner
            .start(RunnerUnit::RunRunner { guid: guid.clone() })?;

        Ok(Some(guid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::test_support::{CapturingStarter, FailingStarter};
    use shipsync_sql::SqliteStore;
    use std::time::Duration;

    fn storage() -> Arc<RunnerStatusStorage> {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(RunnerStatusStorage::new(db).unwrap())
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            max_alive_time: Duration::from_secs(60),
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn wakeup_claims_empty_slot_and_dispatches() {
        let storage = storage();
        let starter = Arc::new(CapturingStarter::new());
        let service =
            TaskRunnerWakeupService::new(Arc::clone(&storage), Arc::clone(&starter) as _, config());

        service.wakeup();

        let status = storage.status().unwrap();
        assert!(!status.is_empty());

        let dispatched = starter.started();
        assert_eq!(dispatched.len(), 1);
        match &dispatched[0] {
            RunnerUnit::RunRunner { guid } => assert_eq!(*guid, status.guid),
            other => panic!("expected runner unit, got {other:?}"),
        }
    }

    #[test]
    fn wakeup_is_idempotent_while_runner_live() {
        let storage = storage();
        let starter = Arc::new(CapturingStarter::new());
        let service =
            TaskRunnerWakeupService::new(Arc::clone(&storage), Arc::clone(&starter) as _, config());

        service.wakeup();
        service.wakeup();

        // Exactly one dispatch: the second call saw a live status.
        assert_eq!(starter.started().len(), 1);
    }

    #[test]
    fn wakeup_replaces_expired_runner() {
        let storage = storage();
        let starter = Arc::new(CapturingStarter::new());
        let service =
            TaskRunnerWakeupService::new(Arc::clone(&storage), Arc::clone(&starter) as _, config());

        storage
            .set_status(&TaskRunnerStatus::new("dead-runner", now_unix() - 600))
            .unwrap();

        service.wakeup();

        let status = storage.status().unwrap();
        assert_ne!(status.guid, "dead-runner");
        assert!(!status.is_empty());
        assert_eq!(starter.started().len(), 1);
    }

    #[test]
    fn wakeup_swallows_dispatch_failure() {
        let storage = storage();
        let service =
            TaskRunnerWakeupService::new(Arc::clone(&storage), Arc::new(FailingStarter), config());

        // Must not panic or propagate.
        service.wakeup();
    }
}
