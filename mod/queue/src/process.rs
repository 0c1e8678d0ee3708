use std::sync::Arc;

use shipsync_core::now_unix;
use shipsync_sql::{SQLStore, Value};

use crate::error::QueueError;
use crate::runner_unit::RunnerUnit;

/// SQL schema for stored async processes.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS async_process (
    guid        TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    create_time INTEGER NOT NULL
);
";

/// Persists serialized runner units between the dispatching process and the
/// HTTP request that executes them. One record per dispatch; the executing
/// side deletes after running, so a record can fire at most once.
pub struct ProcessStore {
    db: Arc<dyn SQLStore>,
}

impl ProcessStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, QueueError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| QueueError::StorageUnavailable(format!("process schema init: {e}")))?;
        Ok(Self { db })
    }

    /// Store a unit under a guid.
    pub fn save(&self, guid: &str, unit: &RunnerUnit) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(unit).map_err(|e| QueueError::Serialize(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO async_process (guid, payload, create_time) VALUES (?1, ?2, ?3)",
                &[
                    Value::Text(guid.to_string()),
                    Value::Text(payload),
                    Value::Integer(now_unix()),
                ],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        Ok(())
    }

    /// Load a stored unit by guid.
    pub fn load(&self, guid: &str) -> Result<RunnerUnit, QueueError> {
        let rows = self
            .db
            .query(
                "SELECT payload FROM async_process WHERE guid = ?1",
                &[Value::Text(guid.to_string())],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let payload = rows
            .first()
            .and_then(|r| r.get_str("payload"))
            .ok_or_else(|| QueueError::NotFound(format!("async process {guid} not found")))?;

        serde_json::from_str(payload).map_err(|e| QueueError::Deserialize(e.to_string()))
    }

    /// Remove a record. Deleting an already-consumed guid is a no-op.
    pub fn delete(&self, guid: &str) -> Result<(), QueueError> {
        self.db
            .exec(
                "DELETE FROM async_process WHERE guid = ?1",
                &[Value::Text(guid.to_string())],
            )
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }
}
