//! Fan-out of task updates to observers.
//!
//! Observers subscribe per worker and receive the full task entity on
//! every change, not a diff; a dropped update is therefore recovered by
//! the next one. Subscription registers the channel *before* taking the
//! snapshot of current tasks, so an update racing the subscribe call can
//! duplicate a snapshot entry but never be lost.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::types::task::Task;

/// A single pushed update: the full task after the change.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    /// Worker whose channel produced the change.
    pub worker_id: String,

    /// The complete task after the update was applied.
    pub task: Task,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<TaskUpdate>,
}

/// Handle identifying one subscription for later removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    worker_id: String,
    id: u64,
}

/// Per-worker broadcast registry.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for a worker's task updates.
    ///
    /// The returned snapshot is produced by the caller-supplied closure
    /// *after* the channel has been registered, closing the window in
    /// which an update could fall between snapshot and registration.
    pub fn subscribe(
        &self,
        worker_id: &str,
        snapshot: impl FnOnce() -> Vec<Task>,
    ) -> (
        SubscriptionHandle,
        Vec<Task>,
        mpsc::UnboundedReceiver<TaskUpdate>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(worker_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        let tasks = snapshot();
        let handle = SubscriptionHandle {
            worker_id: worker_id.to_string(),
            id,
        };
        (handle, tasks, rx)
    }

    /// Removes one subscription. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(mut subs) = self.subscribers.get_mut(&handle.worker_id) {
            subs.retain(|s| s.id != handle.id);
        }
        self.subscribers
            .remove_if(&handle.worker_id, |_, subs| subs.is_empty());
    }

    /// Pushes the full task to every observer of `worker_id`.
    ///
    /// Closed channels are pruned as they are discovered.
    pub fn notify(&self, worker_id: &str, task: &Task) {
        let Some(mut subs) = self.subscribers.get_mut(worker_id) else {
            return;
        };
        subs.retain(|s| {
            s.tx.send(TaskUpdate {
                worker_id: worker_id.to_string(),
                task: task.clone(),
            })
            .is_ok()
        });
    }

    /// Number of live subscriptions for a worker.
    pub fn subscriber_count(&self, worker_id: &str) -> usize {
        self.subscribers
            .get(worker_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}
