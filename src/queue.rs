//! Per-worker execution serialization.
//!
//! Each worker runs at most one task at a time. Submissions while a
//! worker is busy are queued FIFO and reported with their queue
//! position; completion of the in-flight task dispatches the next entry.
//! Shutdown rejects queued entries and refuses new submissions; only the
//! in-flight task is allowed to finish.
//!
//! The actual transport to workers lives behind [`WorkerDispatcher`], so
//! the serialization logic is testable without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::TaskError;
use crate::types::params::QueueStatus;
use crate::types::task::{Message, Task};

/// Transport seam to remote workers.
///
/// `dispatch` sends a message that starts a task and returns the worker's
/// initial task snapshot. `cancel` requests cancellation and returns the
/// worker's view of the task afterwards.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, worker_id: &str, message: Message) -> Result<Task, TaskError>;

    async fn cancel(&self, worker_id: &str, task_id: &str) -> Result<Task, TaskError>;
}

/// Outcome of a submission against a worker's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    /// The worker was idle; the task was dispatched immediately. Carries
    /// the worker's initial task snapshot.
    Dispatched(Task),
    /// The worker was busy; the message waits at 1-based `position`.
    Queued { position: usize },
}

#[derive(Debug)]
struct QueueEntry {
    message: Message,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct WorkerState {
    busy: bool,
    in_flight: Option<String>,
    queue: VecDeque<QueueEntry>,
    last_event_at: Instant,
    shutting_down: bool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            busy: false,
            in_flight: None,
            queue: VecDeque::new(),
            last_event_at: Instant::now(),
            shutting_down: false,
        }
    }
}

/// Registry of per-worker execution state.
#[derive(Default)]
pub struct WorkerQueues {
    workers: DashMap<String, Arc<Mutex<WorkerState>>>,
}

impl WorkerQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn worker(&self, worker_id: &str) -> Arc<Mutex<WorkerState>> {
        self.workers
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WorkerState::new())))
            .clone()
    }

    /// Submits a message for a worker: dispatches immediately when idle,
    /// queues FIFO when busy.
    ///
    /// The worker's lock is held across the dispatch call, so two racing
    /// submissions cannot both see the worker as idle.
    pub async fn submit(
        &self,
        worker_id: &str,
        message: Message,
        dispatcher: &dyn WorkerDispatcher,
    ) -> Result<SubmitResult, TaskError> {
        let state = self.worker(worker_id);
        let mut state = state.lock().await;

        if state.shutting_down {
            return Err(TaskError::WorkerUnavailable {
                worker_id: worker_id.to_string(),
            });
        }

        if state.busy {
            state.queue.push_back(QueueEntry {
                message,
                enqueued_at: Instant::now(),
            });
            let position = state.queue.len();
            tracing::debug!(worker_id, position, "worker busy, queued submission");
            return Ok(SubmitResult::Queued { position });
        }

        state.busy = true;
        match dispatcher.dispatch(worker_id, message).await {
            Ok(task) => {
                state.in_flight = Some(task.id.clone());
                state.last_event_at = Instant::now();
                tracing::info!(worker_id, task_id = %task.id, "dispatched task");
                Ok(SubmitResult::Dispatched(task))
            }
            Err(err) => {
                state.busy = false;
                Err(err)
            }
        }
    }

    /// Reacts to the in-flight task reaching a terminal state.
    ///
    /// Frees the worker and dispatches the next queued entry, skipping
    /// entries whose dispatch fails. Returns the newly dispatched task's
    /// snapshot, if any. A terminal notice for a task that is not the
    /// in-flight one is ignored.
    pub async fn on_task_terminal(
        &self,
        worker_id: &str,
        task_id: &str,
        dispatcher: &dyn WorkerDispatcher,
    ) -> Option<Task> {
        let state = self.worker(worker_id);
        let mut state = state.lock().await;

        if state.in_flight.as_deref() != Some(task_id) {
            return None;
        }
        state.in_flight = None;
        state.busy = false;

        while let Some(entry) = state.queue.pop_front() {
            let waited = entry.enqueued_at.elapsed();
            state.busy = true;
            match dispatcher.dispatch(worker_id, entry.message).await {
                Ok(task) => {
                    state.in_flight = Some(task.id.clone());
                    state.last_event_at = Instant::now();
                    tracing::info!(
                        worker_id,
                        task_id = %task.id,
                        waited_ms = waited.as_millis() as u64,
                        "dispatched queued task"
                    );
                    return Some(task);
                }
                Err(err) => {
                    state.busy = false;
                    tracing::warn!(worker_id, error = %err, "queued dispatch failed, trying next");
                }
            }
        }
        None
    }

    /// Records stream activity for a worker, for stall detection.
    pub async fn note_event(&self, worker_id: &str) {
        let state = match self.workers.get(worker_id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        state.lock().await.last_event_at = Instant::now();
    }

    /// Workers that are busy but have produced no events for `quiet`.
    ///
    /// Diagnostic only: a stalled worker is reported, never killed.
    pub async fn stalled(&self, quiet: Duration) -> Vec<String> {
        let mut out = Vec::new();
        let entries: Vec<(String, Arc<Mutex<WorkerState>>)> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (worker_id, state) in entries {
            let state = state.lock().await;
            if state.busy && state.last_event_at.elapsed() > quiet {
                out.push(worker_id);
            }
        }
        out.sort();
        out
    }

    /// Current queue view for a worker.
    pub async fn queue_status(&self, worker_id: &str) -> QueueStatus {
        let Some(state) = self.workers.get(worker_id).map(|e| e.value().clone()) else {
            return QueueStatus {
                busy: false,
                in_flight: None,
                depth: 0,
            };
        };
        let state = state.lock().await;
        QueueStatus {
            busy: state.busy,
            in_flight: state.in_flight.clone(),
            depth: state.queue.len(),
        }
    }

    /// Stops a worker: queued entries are rejected and new submissions
    /// refused; only the in-flight task is left running. Returns the
    /// number of rejected entries.
    pub async fn shutdown_worker(&self, worker_id: &str) -> usize {
        let state = self.worker(worker_id);
        let mut state = state.lock().await;
        state.shutting_down = true;
        let rejected = state.queue.len();
        state.queue.clear();
        if rejected > 0 {
            tracing::warn!(worker_id, rejected, "worker shutting down, rejected queued submissions");
        } else {
            tracing::info!(worker_id, "worker shutting down");
        }
        rejected
    }

    /// Stops every known worker. Returns the total number of rejected
    /// queue entries.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            rejected += self.shutdown_worker(&id).await;
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::{TaskState, TaskStatus};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Dispatcher that mints sequential task ids and can be told to fail.
    struct FakeDispatcher {
        counter: AtomicUsize,
        fail_next: SyncMutex<usize>,
        dispatched: SyncMutex<Vec<String>>,
    }

    impl FakeDispatcher {
        fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
                fail_next: SyncMutex::new(0),
                dispatched: SyncMutex::new(Vec::new()),
            }
        }

        fn fail_next(&self, n: usize) {
            *self.fail_next.lock() = n;
        }
    }

    #[async_trait]
    impl WorkerDispatcher for FakeDispatcher {
        async fn dispatch(&self, worker_id: &str, message: Message) -> Result<Task, TaskError> {
            {
                let mut fail = self.fail_next.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(TaskError::DispatchFailed {
                        worker_id: worker_id.to_string(),
                        reason: "injected".to_string(),
                    });
                }
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let id = format!("task-{n}");
            self.dispatched
                .lock()
                .push(message.text_content().unwrap_or("").to_string());
            Ok(Task::new(id, TaskState::Submitted))
        }

        async fn cancel(&self, _worker_id: &str, task_id: &str) -> Result<Task, TaskError> {
            let mut task = Task::new(task_id, TaskState::Submitted);
            task.status = TaskStatus::now(TaskState::Cancelled);
            Ok(task)
        }
    }

    #[tokio::test]
    async fn idle_worker_dispatches_immediately() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        let result = queues
            .submit("w1", Message::user_text("go"), &dispatcher)
            .await
            .unwrap();
        assert!(matches!(result, SubmitResult::Dispatched(ref t) if t.id == "task-0"));

        let status = queues.queue_status("w1").await;
        assert!(status.busy);
        assert_eq!(status.in_flight.as_deref(), Some("task-0"));
        assert_eq!(status.depth, 0);
    }

    #[tokio::test]
    async fn busy_worker_queues_with_position() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("first"), &dispatcher)
            .await
            .unwrap();

        let second = queues
            .submit("w1", Message::user_text("second"), &dispatcher)
            .await
            .unwrap();
        assert_eq!(second, SubmitResult::Queued { position: 1 });
        let third = queues
            .submit("w1", Message::user_text("third"), &dispatcher)
            .await
            .unwrap();
        assert_eq!(third, SubmitResult::Queued { position: 2 });
        assert_eq!(queues.queue_status("w1").await.depth, 2);
    }

    #[tokio::test]
    async fn terminal_dispatches_next_in_fifo_order() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("first"), &dispatcher)
            .await
            .unwrap();
        queues
            .submit("w1", Message::user_text("second"), &dispatcher)
            .await
            .unwrap();
        queues
            .submit("w1", Message::user_text("third"), &dispatcher)
            .await
            .unwrap();

        let next = queues.on_task_terminal("w1", "task-0", &dispatcher).await;
        assert_eq!(next.unwrap().id, "task-1");
        assert_eq!(
            *dispatcher.dispatched.lock(),
            vec!["first".to_string(), "second".to_string()]
        );

        let next = queues.on_task_terminal("w1", "task-1", &dispatcher).await;
        assert_eq!(next.unwrap().id, "task-2");
        let next = queues.on_task_terminal("w1", "task-2", &dispatcher).await;
        assert!(next.is_none());
        assert!(!queues.queue_status("w1").await.busy);
    }

    #[tokio::test]
    async fn terminal_for_non_in_flight_task_is_ignored() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("first"), &dispatcher)
            .await
            .unwrap();

        let next = queues.on_task_terminal("w1", "other", &dispatcher).await;
        assert!(next.is_none());
        assert!(queues.queue_status("w1").await.busy);
    }

    #[tokio::test]
    async fn failed_queued_dispatch_skips_to_next() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("first"), &dispatcher)
            .await
            .unwrap();
        queues
            .submit("w1", Message::user_text("doomed"), &dispatcher)
            .await
            .unwrap();
        queues
            .submit("w1", Message::user_text("third"), &dispatcher)
            .await
            .unwrap();

        dispatcher.fail_next(1);
        let next = queues.on_task_terminal("w1", "task-0", &dispatcher).await;
        // "doomed" failed to dispatch; "third" ran instead.
        assert_eq!(next.unwrap().id, "task-1");
        assert_eq!(queues.queue_status("w1").await.depth, 0);
    }

    #[tokio::test]
    async fn failed_immediate_dispatch_frees_worker() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        dispatcher.fail_next(1);
        let err = queues
            .submit("w1", Message::user_text("go"), &dispatcher)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::DispatchFailed { .. }));
        assert!(!queues.queue_status("w1").await.busy);

        // The worker is usable again.
        let result = queues
            .submit("w1", Message::user_text("retry"), &dispatcher)
            .await
            .unwrap();
        assert!(matches!(result, SubmitResult::Dispatched(_)));
    }

    #[tokio::test]
    async fn workers_are_independent() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("a"), &dispatcher)
            .await
            .unwrap();
        let result = queues
            .submit("w2", Message::user_text("b"), &dispatcher)
            .await
            .unwrap();
        assert!(matches!(result, SubmitResult::Dispatched(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_new_submissions() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("first"), &dispatcher)
            .await
            .unwrap();
        queues
            .submit("w1", Message::user_text("second"), &dispatcher)
            .await
            .unwrap();

        let rejected = queues.shutdown_worker("w1").await;
        assert_eq!(rejected, 1);

        let err = queues
            .submit("w1", Message::user_text("late"), &dispatcher)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::WorkerUnavailable { .. }));

        // The in-flight task finishes, but the rejected entry never runs.
        let next = queues.on_task_terminal("w1", "task-0", &dispatcher).await;
        assert!(next.is_none());
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
        let status = queues.queue_status("w1").await;
        assert!(!status.busy);
        assert_eq!(status.depth, 0);
    }

    #[tokio::test]
    async fn stalled_reports_quiet_busy_workers() {
        let queues = WorkerQueues::new();
        let dispatcher = FakeDispatcher::new();
        queues
            .submit("w1", Message::user_text("a"), &dispatcher)
            .await
            .unwrap();

        assert!(queues.stalled(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queues.stalled(Duration::from_millis(1)).await, vec!["w1"]);

        queues.note_event("w1").await;
        assert!(queues.stalled(Duration::from_millis(5)).await.is_empty());
    }
}
