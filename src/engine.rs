//! The engine façade: one object wiring submission, reconciliation,
//! per-worker serialization, and observer fan-out together.
//!
//! Callers interact with [`SyncEngine`] only; the store, reconciler,
//! queues and hub stay internal so their invariants hold. The engine is
//! cheap to share behind an `Arc` and every method takes `&self`.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::hub::{BroadcastHub, SubscriptionHandle, TaskUpdate};
use crate::queue::{SubmitResult, WorkerDispatcher, WorkerQueues};
use crate::reconciler::{DiagnosticsSnapshot, Reconciler};
use crate::store::TaskStore;
use crate::types::event::{TaskDelta, TaskEvent};
use crate::types::params::{ListTasksParams, QueueStatus, SubmitOutcome, TaskPage, TaskStats};
use crate::types::task::{Message, Task};

/// Task lifecycle and event-streaming synchronization engine.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use agent_tasks::{EngineConfig, Message, SyncEngine, WorkerDispatcher};
///
/// # async fn example(dispatcher: Arc<dyn WorkerDispatcher>) -> Result<(), agent_tasks::TaskError> {
/// let engine = SyncEngine::new(dispatcher, EngineConfig::default());
/// let outcome = engine.submit("worker-1", Message::user_text("summarize the report")).await?;
/// if let Some(task_id) = outcome.task_id {
///     println!("running as {task_id}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    store: Arc<TaskStore>,
    hub: Arc<BroadcastHub>,
    reconciler: Reconciler,
    queues: WorkerQueues,
    dispatcher: Arc<dyn WorkerDispatcher>,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(dispatcher: Arc<dyn WorkerDispatcher>, config: EngineConfig) -> Self {
        let store = Arc::new(TaskStore::new(config.store_capacity));
        let hub = Arc::new(BroadcastHub::new());
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&hub), config.clone());
        Self {
            store,
            hub,
            reconciler,
            queues: WorkerQueues::new(),
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- submission ----

    /// Submits work to a worker.
    ///
    /// When the worker is idle the message is dispatched immediately and
    /// the returned outcome carries the new task's id; when busy, the
    /// message is queued and the outcome carries its queue position.
    pub async fn submit(
        &self,
        worker_id: &str,
        message: Message,
    ) -> Result<SubmitOutcome, TaskError> {
        match self
            .queues
            .submit(worker_id, message, self.dispatcher.as_ref())
            .await?
        {
            SubmitResult::Dispatched(task) => {
                let task_id = task.id.clone();
                self.reconciler
                    .apply(worker_id, TaskEvent::Created { task });
                Ok(SubmitOutcome {
                    queued: false,
                    position: None,
                    task_id: Some(task_id),
                })
            }
            SubmitResult::Queued { position } => Ok(SubmitOutcome {
                queued: true,
                position: Some(position),
                task_id: None,
            }),
        }
    }

    // ---- event ingestion ----

    /// Applies one streamed event from a worker.
    ///
    /// Never fails: anomalies are absorbed by the reconciler. When the
    /// event ends the worker's in-flight task, the next queued
    /// submission is dispatched and its creation snapshot ingested
    /// before this returns.
    pub async fn ingest(&self, worker_id: &str, event: TaskEvent) -> TaskDelta {
        self.queues.note_event(worker_id).await;
        let delta = self.reconciler.apply(worker_id, event);

        let ended = match &delta {
            TaskDelta::StatusUpdated {
                task_id,
                terminal: true,
                ..
            } => Some(task_id.clone()),
            // A creation event can replay buffered updates that land the
            // task straight in a terminal state.
            TaskDelta::Created { task_id } => self
                .store
                .get(task_id)
                .is_some_and(|task| task.is_terminal())
                .then(|| task_id.clone()),
            _ => None,
        };
        if let Some(task_id) = ended {
            if let Some(next) = self
                .queues
                .on_task_terminal(worker_id, &task_id, self.dispatcher.as_ref())
                .await
            {
                self.reconciler
                    .apply(worker_id, TaskEvent::Created { task: next });
            }
        }

        delta
    }

    /// Decodes and applies a raw wire payload.
    ///
    /// Fails only on undecodable payloads; decodable events go through
    /// [`Self::ingest`] and never fail.
    pub async fn ingest_json(
        &self,
        worker_id: &str,
        payload: serde_json::Value,
    ) -> Result<TaskDelta, TaskError> {
        let event = TaskEvent::from_json(payload).inspect_err(|_| {
            self.reconciler.diagnostics().note_malformed();
        })?;
        Ok(self.ingest(worker_id, event).await)
    }

    // ---- cancellation ----

    /// Requests cancellation of a task via its worker.
    ///
    /// The worker's acknowledgement is reconciled like any stream event,
    /// so observers see the cancellation and queued work advances. On
    /// transport failure the stored task is left untouched.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, TaskError> {
        let record = self
            .store
            .get_record(task_id)
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.to_string(),
            })?;
        let state = record.task.status.state;
        if state.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: task_id.to_string(),
                state,
            });
        }

        let acked = self
            .dispatcher
            .cancel(&record.worker_id, task_id)
            .await
            .map_err(|err| TaskError::CancelFailed {
                task_id: task_id.to_string(),
                reason: err.to_string(),
            })?;

        self.ingest(
            &record.worker_id,
            TaskEvent::StatusChanged {
                task_id: task_id.to_string(),
                context_id: acked.context_id.clone(),
                status: acked.status.clone(),
                r#final: acked.status.state.is_terminal(),
            },
        )
        .await;

        Ok(self.store.get(task_id).unwrap_or(acked))
    }

    // ---- queries ----

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get(task_id)
    }

    /// Lists tasks matching the filters. A zero limit falls back to the
    /// configured default page size.
    pub fn list(&self, params: &ListTasksParams) -> TaskPage {
        if params.limit == 0 {
            let mut params = params.clone();
            params.limit = self.config.default_page_limit;
            return self.store.list(&params);
        }
        self.store.list(params)
    }

    pub fn stats(&self, worker_id: Option<&str>) -> TaskStats {
        self.store.stats(worker_id)
    }

    /// All retained tasks of one context, oldest first.
    pub fn context_tasks(&self, context_id: &str) -> Vec<Task> {
        self.store.context_tasks(context_id)
    }

    pub async fn queue_status(&self, worker_id: &str) -> QueueStatus {
        self.queues.queue_status(worker_id).await
    }

    // ---- observation ----

    /// Subscribes to a worker's task updates.
    ///
    /// Returns the handle, a snapshot of the worker's current tasks, and
    /// the update channel. The channel is registered before the snapshot
    /// is taken, so a concurrent update may show up in both but can
    /// never be missed.
    pub fn subscribe(
        &self,
        worker_id: &str,
    ) -> (
        SubscriptionHandle,
        Vec<Task>,
        tokio::sync::mpsc::UnboundedReceiver<TaskUpdate>,
    ) {
        self.hub
            .subscribe(worker_id, || self.store.worker_tasks(worker_id))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.hub.unsubscribe(handle);
    }

    // ---- maintenance ----

    /// Busy workers with no stream activity for the configured quiet
    /// period.
    pub async fn stalled_workers(&self) -> Vec<String> {
        self.queues.stalled(self.config.quiet_period).await
    }

    /// Anomaly counters accumulated by the reconciler.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.reconciler.diagnostics().snapshot()
    }

    /// Discards buffered events whose creation never arrived.
    pub fn prune_pending(&self) -> usize {
        self.reconciler.prune_pending()
    }

    /// Forgets all retained tasks of one worker.
    pub fn clear_worker_tasks(&self, worker_id: &str) -> usize {
        self.store.clear_worker(worker_id)
    }

    /// Forgets every retained task.
    pub fn clear_all_tasks(&self) {
        self.store.clear_all();
    }

    /// Stops one worker: queued submissions are rejected, new ones
    /// refused, and only the in-flight task runs to completion. Returns
    /// the number of rejected entries.
    pub async fn shutdown_worker(&self, worker_id: &str) -> usize {
        self.queues.shutdown_worker(worker_id).await
    }

    /// Stops every worker. Returns the total number of rejected entries.
    pub async fn shutdown(&self) -> usize {
        self.queues.shutdown_all().await
    }
}
