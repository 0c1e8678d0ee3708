use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use shipsync_core::now_unix;
use shipsync_sql::{SQLStore, Value};

use crate::error::QueueError;

/// SQL schema for the single-row runner status table.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runner_status (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    guid        TEXT NOT NULL,
    alive_since INTEGER NOT NULL
);
";

// ---------------------------------------------------------------------------
// TaskRunnerStatus
// ---------------------------------------------------------------------------

/// The liveness token proving which runner instance currently owns the
/// active-runner slot. The empty guid is the null sentinel: no live runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunnerStatus {
    pub guid: String,
    pub alive_since: i64,
}

impl TaskRunnerStatus {
    pub fn new(guid: impl Into<String>, alive_since: i64) -> Self {
        Self {
            guid: guid.into(),
            alive_since,
        }
    }

    /// The "no live runner" sentinel.
    pub fn empty() -> Self {
        Self {
            guid: String::new(),
            alive_since: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.guid.is_empty()
    }

    /// A status older than `max_alive_time` no longer counts as live; the
    /// runner it belonged to is presumed dead.
    pub fn is_expired(&self, max_alive_time: Duration) -> bool {
        now_unix() - self.alive_since > max_alive_time.as_secs() as i64
    }
}

// ---------------------------------------------------------------------------
// RunnerStatusStorage
// ---------------------------------------------------------------------------

/// Persists the liveness token, guarded by an optimistic compare-and-set.
///
/// The CAS is the sole serialization point keeping two concurrent runners
/// from both believing they own the slot: a write is rejected when the
/// stored guid and the incoming guid are both non-empty and differ. Writing
/// the empty sentinel is always allowed — that is how a finishing runner
/// releases the slot.
pub struct RunnerStatusStorage {
    db: Arc<dyn SQLStore>,
}

impl RunnerStatusStorage {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, QueueError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| QueueError::StorageUnavailable(format!("runner status schema init: {e}")))?;
        Ok(Self { db })
    }

    /// Current status, or the empty sentinel when none was ever stored.
    pub fn status(&self) -> Result<TaskRunnerStatus, QueueError> {
        let rows = self
            .db
            .query("SELECT guid, alive_since FROM runner_status WHERE id = 1", &[])
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        Ok(rows
            .first()
            .map(|row| TaskRunnerStatus {
                guid: row.get_str("guid").unwrap_or_default().to_string(),
                alive_since: row.get_i64("alive_since").unwrap_or(0),
            })
            .unwrap_or_else(TaskRunnerStatus::empty))
    }

    /// Compare-and-set write. The upsert condition makes create, refresh
    /// and release all atomic single statements; a rejected write affects
    /// zero rows and surfaces as a status-change error naming the owner.
    pub fn set_status(&self, status: &TaskRunnerStatus) -> Result<(), QueueError> {
        let affected = self
            .db
            .exec(
                "INSERT INTO runner_status (id, guid, alive_since) VALUES (1, ?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET \
                     guid = excluded.guid, alive_since = excluded.alive_since \
                 WHERE runner_status.guid = '' \
                    OR excluded.guid = '' \
                    OR runner_status.guid = excluded.guid",
                &[
                    Value::Text(status.guid.clone()),
                    Value::Integer(status.alive_since),
                ],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        if affected == 0 {
            let current = self.status()?;
            return Err(QueueError::StatusChange {
                running_guid: current.guid,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipsync_sql::SqliteStore;

    fn storage() -> RunnerStatusStorage {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        RunnerStatusStorage::new(db).unwrap()
    }

    #[test]
    fn missing_row_reads_as_empty_sentinel() {
        let storage = storage();
        let status = storage.status().unwrap();
        assert!(status.is_empty());
        assert_eq!(status, TaskRunnerStatus::empty());
    }

    #[test]
    fn first_write_always_succeeds() {
        let storage = storage();
        storage
            .set_status(&TaskRunnerStatus::new("guid-a", 100))
            .unwrap();
        let status = storage.status().unwrap();
        assert_eq!(status.guid, "guid-a");
        assert_eq!(status.alive_since, 100);
    }

    #[test]
    fn same_guid_refreshes() {
        let storage = storage();
        storage
            .set_status(&TaskRunnerStatus::new("guid-a", 100))
            .unwrap();
        storage
            .set_status(&TaskRunnerStatus::new("guid-a", 200))
            .unwrap();
        assert_eq!(storage.status().unwrap().alive_since, 200);
    }

    #[test]
    fn different_guid_is_rejected() {
        let storage = storage();
        storage
            .set_status(&TaskRunnerStatus::new("guid-a", 100))
            .unwrap();

        let err = storage
            .set_status(&TaskRunnerStatus::new("guid-b", 200))
            .unwrap_err();
        match err {
            QueueError::StatusChange { running_guid } => assert_eq!(running_guid, "guid-a"),
            other => panic!("expected status change error, got {other}"),
        }

        // Loser's write left no trace.
        let status = storage.status().unwrap();
        assert_eq!(status.guid, "guid-a");
        assert_eq!(status.alive_since, 100);
    }

    #[test]
    fn clearing_to_sentinel_is_always_allowed() {
        let storage = storage();
        storage
            .set_status(&TaskRunnerStatus::new("guid-a", 100))
            .unwrap();
        storage.set_status(&TaskRunnerStatus::empty()).unwrap();
        assert!(storage.status().unwrap().is_empty());

        // And a fresh guid can take the slot afterwards.
        storage
            .set_status(&TaskRunnerStatus::new("guid-b", 300))
            .unwrap();
        assert_eq!(storage.status().unwrap().guid, "guid-b");
    }

    #[test]
    fn expiry_window() {
        let fresh = TaskRunnerStatus::new("g", now_unix());
        assert!(!fresh.is_expired(Duration::from_secs(60)));

        let stale = TaskRunnerStatus::new("g", now_unix() - 120);
        assert!(stale.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn empty_sentinel_counts_as_expired() {
        assert!(TaskRunnerStatus::empty().is_expired(Duration::from_secs(60)));
    }
}
