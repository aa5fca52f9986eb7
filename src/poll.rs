//! Polling fallback for workers that cannot stream events.
//!
//! [`PollDriver`] periodically fetches a task's full state through a
//! [`WorkerPoller`] and synthesizes the lifecycle events a streaming
//! worker would have sent, feeding them into the engine's normal
//! ingestion path. Observers cannot tell a polled worker from a
//! streaming one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::SyncEngine;
use crate::error::TaskError;
use crate::types::event::TaskEvent;
use crate::types::task::Task;

/// Read-only transport to a worker that supports state fetches.
#[async_trait]
pub trait WorkerPoller: Send + Sync {
    /// Fetches the worker's current view of one task.
    async fn fetch_task(&self, worker_id: &str, task_id: &str) -> Result<Task, TaskError>;
}

/// Drives one task to completion by polling.
pub struct PollDriver {
    engine: Arc<SyncEngine>,
    poller: Arc<dyn WorkerPoller>,
    interval: Duration,
    max_consecutive_failures: u32,
}

impl PollDriver {
    pub fn new(engine: Arc<SyncEngine>, poller: Arc<dyn WorkerPoller>) -> Self {
        let interval = engine.config().poll_interval;
        Self {
            engine,
            poller,
            interval,
            max_consecutive_failures: 3,
        }
    }

    /// Overrides the engine's configured poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of consecutive fetch failures tolerated before giving up.
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Polls until the task reaches a terminal state, returning its
    /// final snapshot.
    ///
    /// A transient fetch failure is retried on the next tick; the run
    /// fails only after the configured number of consecutive failures.
    pub async fn run(&self, worker_id: &str, task_id: &str) -> Result<Task, TaskError> {
        let mut failures = 0u32;
        loop {
            match self.poller.fetch_task(worker_id, task_id).await {
                Ok(fetched) => {
                    failures = 0;
                    let stored = self.engine.get_task(task_id);
                    for event in synthesize_events(stored.as_ref(), &fetched) {
                        self.engine.ingest(worker_id, event).await;
                    }
                    if let Some(task) = self.engine.get_task(task_id) {
                        if task.is_terminal() {
                            return Ok(task);
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        worker_id,
                        task_id,
                        failures,
                        error = %err,
                        "poll fetch failed"
                    );
                    if failures >= self.max_consecutive_failures {
                        return Err(err);
                    }
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Events a streaming worker would have sent to move `stored` to
/// `fetched`. Artifacts first, then the status change, matching stream
/// ordering where a terminal status closes the stream.
fn synthesize_events(stored: Option<&Task>, fetched: &Task) -> Vec<TaskEvent> {
    let Some(stored) = stored else {
        return vec![TaskEvent::Created {
            task: fetched.clone(),
        }];
    };

    let mut events = Vec::new();
    for artifact in &fetched.artifacts {
        let known = stored
            .artifacts
            .iter()
            .any(|a| a.artifact_id == artifact.artifact_id);
        if !known {
            events.push(TaskEvent::ArtifactAppended {
                task_id: fetched.id.clone(),
                context_id: fetched.context_id.clone(),
                artifact: artifact.clone(),
                append: false,
                last_chunk: false,
            });
        }
    }

    if fetched.status.state != stored.status.state {
        events.push(TaskEvent::StatusChanged {
            task_id: fetched.id.clone(),
            context_id: fetched.context_id.clone(),
            status: fetched.status.clone(),
            r#final: fetched.status.state.is_terminal(),
        });
    }

    events
}
