use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::QueueError;

/// Error type business tasks may fail with. The queue only keeps the
/// rendered message (one failure-log line per attempt).
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Execution context — the task's line back to its queue item
// ---------------------------------------------------------------------------

/// Callbacks injected into a running task so it can report back to the
/// queue item that owns it. Both require the item to still be IN_PROGRESS.
pub trait ExecutionContext {
    /// Record progress in base points (0–10000) and refresh liveness.
    fn report_progress(&self, base_points: u16) -> Result<(), QueueError>;

    /// Refresh liveness without changing progress. Long-running tasks that
    /// cannot quantify progress call this to avoid the inactivity reaper.
    fn report_alive(&self) -> Result<(), QueueError>;
}

// ---------------------------------------------------------------------------
// Task — the unit-of-work contract
// ---------------------------------------------------------------------------

/// One opaque, serializable unit of business work (fetch rates, sync an
/// order, ...). The queue never looks inside; it only round-trips the blob
/// and calls `execute`.
pub trait Task: Send {
    /// Stable kind name. Pairs with a registry entry for deserialization.
    fn type_name(&self) -> &str;

    /// Run the work. Errors are converted into the item's retry/fail path.
    fn execute(&mut self, ctx: &dyn ExecutionContext) -> Result<(), TaskError>;

    /// Encode into the opaque blob stored on the queue item.
    fn serialize(&self) -> Result<Vec<u8>, QueueError>;

    /// Cleanup hook invoked before the runner force-fails this task's item
    /// for extended inactivity. Default is a no-op.
    fn reconfigure(&mut self) {}
}

// ---------------------------------------------------------------------------
// TaskRegistry — type name → factories
// ---------------------------------------------------------------------------

type FromBytes = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Task>, QueueError> + Send + Sync>;
type FromParams = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Task>, QueueError> + Send + Sync>;

struct TaskKind {
    from_bytes: FromBytes,
    from_params: FromParams,
}

/// Runtime registry of task kinds.
///
/// Embedding services register their kinds at startup; the queue uses the
/// registry to rebuild tasks from stored blobs and to build tasks from API
/// enqueue payloads.
#[derive(Default)]
pub struct TaskRegistry {
    kinds: RwLock<HashMap<String, TaskKind>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task kind with explicit factory closures.
    pub fn register(&self, type_name: &str, from_bytes: FromBytes, from_params: FromParams) {
        self.kinds.write().expect("task registry poisoned").insert(
            type_name.to_string(),
            TaskKind {
                from_bytes,
                from_params,
            },
        );
    }

    /// Register a serde-backed task kind: the stored blob and the API
    /// payload are both its JSON representation.
    pub fn register_serde<T>(&self, type_name: &str)
    where
        T: Task + Serialize + DeserializeOwned + 'static,
    {
        let from_bytes: FromBytes = Arc::new(|bytes: &[u8]| {
            serde_json::from_slice::<T>(bytes)
                .map(|t| Box::new(t) as Box<dyn Task>)
                .map_err(|e| QueueError::Deserialize(e.to_string()))
        });
        let from_params: FromParams = Arc::new(|params: serde_json::Value| {
            serde_json::from_value::<T>(params)
                .map(|t| Box::new(t) as Box<dyn Task>)
                .map_err(|e| QueueError::Deserialize(e.to_string()))
        });
        self.register(type_name, from_bytes, from_params);
    }

    /// Decode a stored blob back into a task of the given kind.
    pub fn deserialize(&self, type_name: &str, bytes: &[u8]) -> Result<Box<dyn Task>, QueueError> {
        let kinds = self.kinds.read().expect("task registry poisoned");
        let kind = kinds
            .get(type_name)
            .ok_or_else(|| QueueError::UnknownTaskType(type_name.to_string()))?;
        (kind.from_bytes)(bytes)
    }

    /// Build a fresh task of the given kind from an API enqueue payload.
    pub fn from_params(
        &self,
        type_name: &str,
        params: serde_json::Value,
    ) -> Result<Box<dyn Task>, QueueError> {
        let kinds = self.kinds.read().expect("task registry poisoned");
        let kind = kinds
            .get(type_name)
            .ok_or_else(|| QueueError::UnknownTaskType(type_name.to_string()))?;
        (kind.from_params)(params)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.kinds
            .read()
            .expect("task registry poisoned")
            .contains_key(type_name)
    }

    /// Registered kind names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kinds
            .read()
            .expect("task registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ECHO_TYPE, EchoTask};
    use super::*;

    #[test]
    fn register_and_roundtrip() {
        let registry = TaskRegistry::new();
        registry.register_serde::<EchoTask>(ECHO_TYPE);
        assert!(registry.contains(ECHO_TYPE));

        let task = EchoTask::new("hello");
        let bytes = Task::serialize(&task).unwrap();
        let back = registry.deserialize(ECHO_TYPE, &bytes).unwrap();
        assert_eq!(back.type_name(), ECHO_TYPE);
    }

    #[test]
    fn unknown_type_rejected() {
        let registry = TaskRegistry::new();
        let err = registry.deserialize("nope", b"{}").err().unwrap();
        assert!(matches!(err, QueueError::UnknownTaskType(t) if t == "nope"));

        let err = registry
            .from_params("nope", serde_json::Value::Null)
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::UnknownTaskType(_)));
    }

    #[test]
    fn corrupt_blob_is_deserialize_error() {
        let registry = TaskRegistry::new();
        registry.register_serde::<EchoTask>(ECHO_TYPE);
        let err = registry.deserialize(ECHO_TYPE, b"not json").err().unwrap();
        assert!(matches!(err, QueueError::Deserialize(_)));
    }

    #[test]
    fn from_params_builds_task() {
        let registry = TaskRegistry::new();
        registry.register_serde::<EchoTask>(ECHO_TYPE);
        let task = registry
            .from_params(ECHO_TYPE, serde_json::json!({"label": "from api"}))
            .unwrap();
        assert_eq!(task.type_name(), ECHO_TYPE);
    }

    #[test]
    fn type_names_sorted() {
        let registry = TaskRegistry::new();
        registry.register_serde::<EchoTask>("b.kind");
        registry.register_serde::<EchoTask>("a.kind");
        assert_eq!(registry.type_names(), vec!["a.kind", "b.kind"]);
    }
}
