//! Wire and boundary types for the synchronization engine.
//!
//! - [`task`] — the task entity, its lifecycle state machine, messages,
//!   parts, and artifacts.
//! - [`event`] — the closed sum type of worker lifecycle events and the
//!   reconciler's [`TaskDelta`](event::TaskDelta) outcome.
//! - [`params`] — query filters, result pages, statistics, and submission
//!   outcomes.

pub mod event;
pub mod params;
pub mod task;

pub use event::{IgnoreReason, TaskDelta, TaskEvent};
pub use params::{ListTasksParams, QueueStatus, SubmitOutcome, TaskPage, TaskStats};
pub use task::{Artifact, FileRef, Message, Part, Role, Task, TaskState, TaskStatus};
