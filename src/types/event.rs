//! Lifecycle events streamed by workers, and the reconciler's outcome type.
//!
//! [`TaskEvent`] is a closed sum type over the three event kinds a worker
//! can emit. Matching on it is exhaustive, so adding a fourth kind later
//! is a compile error at every ingestion site instead of a silently
//! ignored branch.
//!
//! # Serialization
//!
//! Events are tagged by `kind` and use camelCase field names, so
//! `task_id`/`last_chunk` map to the wire's `taskId`/`lastChunk`. The
//! `final` flag keeps its wire name via `r#final`.

use serde::{Deserialize, Serialize};

use super::task::{Artifact, Task, TaskState, TaskStatus};
use crate::error::TaskError;

/// One lifecycle event from a worker's stream.
///
/// # Examples
///
/// ```
/// use agent_tasks::TaskEvent;
///
/// let json = r#"{
///     "kind": "status_changed",
///     "taskId": "t1",
///     "status": { "state": "working" },
///     "final": false
/// }"#;
/// let event: TaskEvent = serde_json::from_str(json).unwrap();
/// assert!(matches!(event, TaskEvent::StatusChanged { ref task_id, .. } if task_id == "t1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Full initial snapshot of a newly created task.
    #[serde(rename_all = "camelCase")]
    Created {
        /// The task as the worker sees it at creation.
        task: Task,
    },

    /// The task moved to a new lifecycle status.
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        /// The task this event belongs to.
        task_id: String,
        /// Context the task belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
        /// The new status.
        status: TaskStatus,
        /// Advisory: the worker promises no further events for this task.
        /// Late arrivals are still handled (logged and dropped) rather
        /// than trusted away.
        #[serde(rename = "final")]
        r#final: bool,
    },

    /// The worker produced or extended an artifact.
    #[serde(rename_all = "camelCase")]
    ArtifactAppended {
        /// The task this event belongs to.
        task_id: String,
        /// Context the task belongs to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
        /// The artifact payload (full for new artifacts, chunk for appends).
        artifact: Artifact,
        /// `true` extends the existing artifact with the same name;
        /// `false` adds a new artifact.
        append: bool,
        /// Advisory end-of-stream marker for this artifact. Does not by
        /// itself change task state.
        last_chunk: bool,
    },
}

impl TaskEvent {
    /// The task id this event refers to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Created { task } => &task.id,
            Self::StatusChanged { task_id, .. } | Self::ArtifactAppended { task_id, .. } => {
                task_id
            }
        }
    }

    /// Decodes a raw wire payload, mapping deserialization failures to
    /// [`TaskError::MalformedEvent`].
    pub fn from_json(payload: serde_json::Value) -> Result<Self, TaskError> {
        serde_json::from_value(payload).map_err(|err| TaskError::MalformedEvent {
            reason: err.to_string(),
        })
    }
}

/// Why the reconciler ignored an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A `Created` event for an id that already exists (network retry).
    DuplicateCreation,
    /// An event for a task already in a terminal state.
    PostTerminal(TaskState),
    /// The transition was rejected by the state machine.
    IllegalTransition {
        /// State the task was in.
        from: TaskState,
        /// State the event asked for.
        to: TaskState,
    },
    /// The task is unknown; the event was buffered for the grace period.
    Buffered,
    /// The task is unknown and the per-task buffer is full; the event
    /// was dropped.
    BufferFull,
}

/// Outcome of applying one event to the store.
///
/// Returned from `Reconciler::apply`; never an error. Stream-path
/// problems are counted and logged, not raised.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDelta {
    /// A new task became visible.
    Created {
        /// Id of the new task.
        task_id: String,
    },
    /// The task's status changed.
    StatusUpdated {
        /// Id of the updated task.
        task_id: String,
        /// The state after the update.
        state: TaskState,
        /// `true` if the update moved the task into a terminal state.
        terminal: bool,
    },
    /// The task's artifact list changed.
    ArtifactUpdated {
        /// Id of the updated task.
        task_id: String,
    },
    /// The event had no effect; see the reason.
    Ignored {
        /// Id the event referred to.
        task_id: String,
        /// Why nothing happened.
        reason: IgnoreReason,
    },
}

impl TaskDelta {
    /// Returns `true` if this delta moved a task into a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StatusUpdated { terminal: true, .. })
    }
}
