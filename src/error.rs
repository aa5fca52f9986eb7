//! Error types for engine operations.
//!
//! [`TaskError`] covers the caller-facing failure modes: lookups,
//! state-machine rejections, and dispatch/cancel transport failures.
//! Stream-path problems (bad events from a worker) are never surfaced as
//! errors — the reconciler logs and counts them so a long-lived stream is
//! not killed by one bad event.

use thiserror::Error;

use crate::types::task::TaskState;

/// Errors returned from direct caller-invoked operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task with the given id is known (or it has been evicted).
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task id that was looked up.
        task_id: String,
    },

    /// The requested transition is rejected by the state machine.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: String,
        /// Current state.
        from: TaskState,
        /// Rejected target state.
        to: TaskState,
    },

    /// The task is already in a terminal state and cannot change.
    #[error("task {task_id} is already terminal ({state})")]
    AlreadyTerminal {
        /// The task id.
        task_id: String,
        /// The terminal state it is in.
        state: TaskState,
    },

    /// The worker's queue has been shut down or the worker is unknown.
    #[error("worker unavailable: {worker_id}")]
    WorkerUnavailable {
        /// The worker id.
        worker_id: String,
    },

    /// Dispatching a payload to the worker failed.
    #[error("dispatch to worker {worker_id} failed: {reason}")]
    DispatchFailed {
        /// The worker id.
        worker_id: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// The cancel request did not reach or was refused by the worker.
    /// The task's last known state is left unchanged.
    #[error("cancel of task {task_id} failed: {reason}")]
    CancelFailed {
        /// The task id.
        task_id: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// An event or payload was missing required fields.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// What was wrong with it.
        reason: String,
    },
}
