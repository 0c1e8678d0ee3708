use thiserror::Error;

use shipsync_core::ServiceError;

use crate::model::QueueItemStatus;

/// Errors raised by the queue subsystem.
///
/// Internal code propagates these with `?`. Only the two best-effort entry
/// points (`TaskRunnerWakeupService::wakeup` and `TaskRunner::run`) catch and
/// swallow; everything else fails loudly.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A state-machine violation — programmer error, never caught internally.
    #[error("illegal queue item state transition from {from} to {to}")]
    IllegalTransition {
        from: QueueItemStatus,
        to: QueueItemStatus,
    },

    /// Progress value outside the 0–10000 base-point range.
    #[error("invalid progress base points value: {0}")]
    InvalidProgress(u16),

    /// Progress or keep-alive reported for an item that is not IN_PROGRESS.
    #[error("progress reported for not started queue item {0}")]
    ItemNotStarted(i64),

    /// The underlying save/update failed; the state change did not commit.
    #[error("queue storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{0}")]
    NotFound(String),

    /// Another runner instance currently owns the active-runner slot.
    #[error("task runner status change rejected: runner {running_guid} is active")]
    StatusChange { running_guid: String },

    /// A concurrent process won a compare-and-set race on a queue item.
    #[error("{0}")]
    Conflict(String),

    /// A stored task blob could not be decoded back into a task.
    #[error("cannot deserialize task: {0}")]
    Deserialize(String),

    #[error("cannot serialize task: {0}")]
    Serialize(String),

    /// Enqueue/deserialize request for a task type nobody registered.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("{0}")]
    Internal(String),
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(msg) => ServiceError::NotFound(msg),
            QueueError::IllegalTransition { .. }
            | QueueError::InvalidProgress(_)
            | QueueError::ItemNotStarted(_)
            | QueueError::UnknownTaskType(_) => ServiceError::Validation(err.to_string()),
            QueueError::StatusChange { .. } | QueueError::Conflict(_) => {
                ServiceError::Conflict(err.to_string())
            }
            QueueError::StorageUnavailable(msg) => ServiceError::Storage(msg),
            QueueError::Deserialize(_) | QueueError::Serialize(_) | QueueError::Internal(_) => {
                ServiceError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_states() {
        let err = QueueError::IllegalTransition {
            from: QueueItemStatus::Completed,
            to: QueueItemStatus::Queued,
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("QUEUED"));
    }

    #[test]
    fn service_error_mapping() {
        assert_eq!(
            ServiceError::from(QueueError::NotFound("queue item 1 not found".into())).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ServiceError::from(QueueError::StatusChange {
                running_guid: "abc".into()
            })
            .error_code(),
            "ALREADY_EXISTS"
        );
        assert_eq!(
            ServiceError::from(QueueError::StorageUnavailable("disk".into())).error_code(),
            "STORAGE_ERROR"
        );
        assert_eq!(
            ServiceError::from(QueueError::ItemNotStarted(3)).error_code(),
            "VALIDATION_FAILED"
        );
    }
}
