use serde::{Deserialize, Serialize};

use shipsync_core::now_unix;

use crate::error::QueueError;

/// 100% expressed in base points (two implied decimals of percent).
pub const MAX_PROGRESS: u16 = 10_000;

// ---------------------------------------------------------------------------
// QueueItemStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a queue item.
///
/// ```text
/// CREATED → QUEUED → IN_PROGRESS → COMPLETED
///                                → FAILED
///                                → ABORTED
///                                → QUEUED   (requeue/retry)
/// ```
///
/// Transitions are one-directional through this graph; anything else is an
/// illegal transition and raises an error rather than silently coercing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueItemStatus {
    Created,
    Queued,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "QUEUED" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether the item has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// The legal transition table.
    pub fn can_transition_to(&self, to: QueueItemStatus) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Queued)
                | (Self::Queued, Self::InProgress)
                | (Self::InProgress, Self::Queued)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Aborted)
        )
    }
}

impl std::fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// QueueItem — the core data model, maps 1:1 to SQL columns
// ---------------------------------------------------------------------------

/// A single persisted unit of scheduled work wrapping a serialized task.
///
/// All fields map directly to SQL columns. The task blob is opaque here;
/// decoding it back into a task goes through the task registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Assigned on first persist; `None` before.
    pub id: Option<i64>,

    pub status: QueueItemStatus,

    /// Stable task kind name, as reported by the task itself.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Named lane the item was enqueued into. A label for bookkeeping —
    /// dispatch order is global, not per queue name.
    pub queue_name: String,

    /// Tenant/execution scope the item belongs to.
    pub context: String,

    /// Opaque task blob, decodable through the registry.
    #[serde(skip_serializing)]
    pub serialized_task: Vec<u8>,

    /// Current progress in base points (0–10000).
    pub progress_base_points: u16,

    /// Progress at the moment of the last requeue. The runner compares
    /// against this to tell a slow-but-alive task from a dead one.
    pub last_execution_progress_base_points: u16,

    pub retries: u32,

    /// Accumulated failure log, one `Attempt N: <msg>` line per attempt.
    pub failure_description: String,

    // --- timestamps (Unix seconds) ---
    pub create_time: Option<i64>,
    pub queue_time: Option<i64>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub fail_time: Option<i64>,
    pub earliest_start_time: Option<i64>,
    pub last_update_time: Option<i64>,
}

impl QueueItem {
    /// Create an in-memory item wrapping an already-serialized task.
    pub fn new(
        task_type: impl Into<String>,
        queue_name: impl Into<String>,
        context: impl Into<String>,
        serialized_task: Vec<u8>,
    ) -> Self {
        Self {
            id: None,
            status: QueueItemStatus::Created,
            task_type: task_type.into(),
            queue_name: queue_name.into(),
            context: context.into(),
            serialized_task,
            progress_base_points: 0,
            last_execution_progress_base_points: 0,
            retries: 0,
            failure_description: String::new(),
            create_time: Some(now_unix()),
            queue_time: None,
            start_time: None,
            finish_time: None,
            fail_time: None,
            earliest_start_time: None,
            last_update_time: None,
        }
    }

    /// Transition to a new status, enforcing the legal transition table.
    pub fn set_status(&mut self, to: QueueItemStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(to) {
            return Err(QueueError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Set current progress, rejecting values above 10000 base points.
    pub fn set_progress_base_points(&mut self, base_points: u16) -> Result<(), QueueError> {
        if base_points > MAX_PROGRESS {
            return Err(QueueError::InvalidProgress(base_points));
        }
        self.progress_base_points = base_points;
        Ok(())
    }

    /// Progress as a percentage with two decimals (base points / 100).
    pub fn progress_formatted(&self) -> f64 {
        (self.progress_base_points as f64) / 100.0
    }

    /// Append one attempt line to the failure log.
    pub fn add_failure(&mut self, message: &str) {
        let line = format!("Attempt {}: {}", self.retries + 1, message);
        if self.failure_description.is_empty() {
            self.failure_description = line;
        } else {
            self.failure_description.push('\n');
            self.failure_description.push_str(&line);
        }
    }
}
