//! Task lifecycle tracking and event-stream reconciliation for remote
//! worker agents.
//!
//! Workers execute long-running tasks and report progress as a stream
//! of lifecycle events. This crate keeps an authoritative local view of
//! every task: it validates state transitions, absorbs the anomalies of
//! unreliable event streams (duplicates, reordering, stragglers),
//! serializes execution so each worker runs one task at a time, and
//! fans full task updates out to observers.
//!
//! # Architecture
//!
//! - [`SyncEngine`] — the façade callers interact with: submission,
//!   ingestion, cancellation, queries, subscriptions.
//! - [`TaskStore`] — bounded in-memory registry with secondary indices
//!   and least-recently-touched eviction.
//! - [`Reconciler`] — applies [`TaskEvent`]s to the store, enforcing
//!   the state machine and buffering out-of-order arrivals.
//! - [`WorkerQueues`] — per-worker FIFO serialization behind the
//!   [`WorkerDispatcher`] transport seam.
//! - [`BroadcastHub`] — per-worker fan-out of full task snapshots.
//! - [`PollDriver`] — polling fallback that synthesizes stream events
//!   for workers that cannot stream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_tasks::{EngineConfig, Message, SyncEngine, WorkerDispatcher};
//!
//! # async fn run(dispatcher: Arc<dyn WorkerDispatcher>) -> Result<(), agent_tasks::TaskError> {
//! let engine = Arc::new(SyncEngine::new(dispatcher, EngineConfig::default()));
//!
//! // Observers see every change as a full task snapshot.
//! let (handle, current_tasks, mut updates) = engine.subscribe("worker-1");
//! println!("{} tasks already tracked", current_tasks.len());
//!
//! let outcome = engine.submit("worker-1", Message::user_text("index the repo")).await?;
//! if outcome.queued {
//!     println!("worker busy, waiting at position {:?}", outcome.position);
//! }
//!
//! while let Some(update) = updates.recv().await {
//!     if update.task.is_terminal() {
//!         break;
//!     }
//! }
//! engine.unsubscribe(&handle);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod poll;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::TaskError;
pub use hub::{BroadcastHub, SubscriptionHandle, TaskUpdate};
pub use poll::{PollDriver, WorkerPoller};
pub use queue::{SubmitResult, WorkerDispatcher, WorkerQueues};
pub use reconciler::{Diagnostics, DiagnosticsSnapshot, Reconciler};
pub use store::{TaskRecord, TaskStore};
pub use types::{
    Artifact, FileRef, IgnoreReason, ListTasksParams, Message, Part, QueueStatus, Role,
    SubmitOutcome, Task, TaskDelta, TaskEvent, TaskPage, TaskState, TaskStats, TaskStatus,
};
