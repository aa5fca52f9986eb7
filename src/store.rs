//! Bounded in-memory task registry with secondary indices and LRU eviction.
//!
//! [`TaskStore`] exclusively owns all [`Task`] entities the engine has
//! observed. It is an explicit, injectable object (no global state) holding
//! an arena keyed by task id plus incremental secondary indices by worker,
//! context, and state, so queries stay proportional to their result set.
//!
//! A touch-order list tracks recency for eviction: a task is "touched"
//! when it is created or when an event is applied to it, never on read.
//! When the store exceeds its capacity the least-recently-touched
//! *terminal* task is silently evicted, falling back to plain LRU only
//! when every retained task is still active — acceptable for an
//! observability tool that is not a source of truth.
//!
//! Mutation happens under a single `parking_lot::RwLock`; queries take the
//! read lock and copy matching entries out, so readers never observe a
//! half-applied update and writers are blocked only for the copy.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::params::{ListTasksParams, TaskPage, TaskStats};
use crate::types::task::{Task, TaskState};

/// Store-internal wrapper attaching engine-side attribution to a wire task.
///
/// `worker_id` is not part of the wire event; the engine attaches it on
/// ingestion. `touched_at` drives LRU eviction.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// The task as last reconciled.
    pub task: Task,

    /// The worker currently or previously responsible for the task.
    pub worker_id: String,

    /// When the task was last created-or-updated.
    pub touched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tasks: HashMap<String, TaskRecord>,
    /// Task ids ordered least-recently-touched first.
    touch_order: Vec<String>,
    by_worker: HashMap<String, HashSet<String>>,
    by_context: HashMap<String, HashSet<String>>,
    by_state: HashMap<TaskState, HashSet<String>>,
}

impl StoreInner {
    fn touch(&mut self, task_id: &str) {
        if let Some(pos) = self.touch_order.iter().position(|id| id == task_id) {
            self.touch_order.remove(pos);
        }
        self.touch_order.push(task_id.to_string());
        if let Some(record) = self.tasks.get_mut(task_id) {
            record.touched_at = Utc::now();
        }
    }

    fn index_insert(&mut self, record: &TaskRecord) {
        let id = record.task.id.clone();
        self.by_worker
            .entry(record.worker_id.clone())
            .or_default()
            .insert(id.clone());
        if let Some(ctx) = &record.task.context_id {
            self.by_context.entry(ctx.clone()).or_default().insert(id.clone());
        }
        self.by_state
            .entry(record.task.status.state)
            .or_default()
            .insert(id);
    }

    fn index_remove(&mut self, record: &TaskRecord) {
        let id = &record.task.id;
        if let Some(set) = self.by_worker.get_mut(&record.worker_id) {
            set.remove(id);
            if set.is_empty() {
                self.by_worker.remove(&record.worker_id);
            }
        }
        if let Some(ctx) = &record.task.context_id {
            if let Some(set) = self.by_context.get_mut(ctx) {
                set.remove(id);
                if set.is_empty() {
                    self.by_context.remove(ctx);
                }
            }
        }
        if let Some(set) = self.by_state.get_mut(&record.task.status.state) {
            set.remove(id);
            if set.is_empty() {
                self.by_state.remove(&record.task.status.state);
            }
        }
    }

    fn remove(&mut self, task_id: &str) -> Option<TaskRecord> {
        let record = self.tasks.remove(task_id)?;
        self.index_remove(&record);
        if let Some(pos) = self.touch_order.iter().position(|id| id == task_id) {
            self.touch_order.remove(pos);
        }
        Some(record)
    }

    fn evict_over(&mut self, capacity: usize) {
        while self.tasks.len() > capacity {
            // Prefer the least-recently-touched terminal task: evicting a
            // live task would orphan its still-incoming events. Only when
            // every retained task is active does plain LRU apply.
            let victim = self
                .touch_order
                .iter()
                .find(|id| {
                    self.tasks
                        .get(id.as_str())
                        .is_some_and(|r| r.task.is_terminal())
                })
                .cloned()
                .or_else(|| self.touch_order.first().cloned());
            let Some(victim) = victim else {
                break;
            };
            tracing::debug!(task_id = %victim, "evicting least-recently-touched task");
            self.remove(&victim);
        }
    }
}

/// Bounded, indexed in-memory registry of tasks.
///
/// # Examples
///
/// ```
/// use agent_tasks::{Task, TaskState, TaskStore};
///
/// let store = TaskStore::new(10);
/// store.insert("worker-1", Task::new("t1", TaskState::Submitted));
/// assert!(store.get("t1").is_some());
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug)]
pub struct TaskStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
}

impl TaskStore {
    /// Creates an empty store retaining at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            capacity,
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Returns `true` if the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.inner.read().tasks.is_empty()
    }

    /// Returns `true` if a task with the given id is retained.
    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.read().tasks.contains_key(task_id)
    }

    /// Inserts or replaces a task owned by `worker_id`, touching it and
    /// evicting (terminal tasks first, then plain LRU) if over capacity.
    pub fn insert(&self, worker_id: &str, task: Task) {
        let mut inner = self.inner.write();
        let task_id = task.id.clone();
        if let Some(old) = inner.tasks.remove(&task_id) {
            inner.index_remove(&old);
        }
        let record = TaskRecord {
            task,
            worker_id: worker_id.to_string(),
            touched_at: Utc::now(),
        };
        inner.index_insert(&record);
        inner.tasks.insert(task_id.clone(), record);
        inner.touch(&task_id);
        inner.evict_over(self.capacity);
    }

    /// Returns a clone of the task with the given id.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.read().tasks.get(task_id).map(|r| r.task.clone())
    }

    /// Returns a clone of the full record, including worker attribution.
    pub fn get_record(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.read().tasks.get(task_id).cloned()
    }

    /// Mutates a task in place under the write lock.
    ///
    /// The closure runs with exclusive access and decides whether the
    /// update applies: on `Ok` the task is touched and the state index
    /// refreshed; on `Err` nothing is touched or reindexed, and the
    /// closure must have left the task unchanged. Validation against the
    /// task's current state belongs inside the closure, where no other
    /// writer can interleave between the check and the write. Returns
    /// `None` if the task is unknown.
    pub fn update_task<R, E>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<R, E>,
    ) -> Option<Result<R, E>> {
        let mut inner = self.inner.write();
        let old_state = inner.tasks.get(task_id)?.task.status.state;
        let result = {
            let record = inner.tasks.get_mut(task_id)?;
            f(&mut record.task)
        };
        if result.is_err() {
            return Some(result);
        }
        let new_state = inner.tasks.get(task_id)?.task.status.state;
        if new_state != old_state {
            let id = task_id.to_string();
            if let Some(set) = inner.by_state.get_mut(&old_state) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_state.remove(&old_state);
                }
            }
            inner.by_state.entry(new_state).or_default().insert(id);
        }
        inner.touch(task_id);
        Some(result)
    }

    /// All retained tasks for one worker, most recently updated first.
    ///
    /// Used for subscription snapshots; does not touch the tasks.
    pub fn worker_tasks(&self, worker_id: &str) -> Vec<Task> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_worker.get(worker_id) else {
            return Vec::new();
        };
        let mut tasks: Vec<Task> = ids
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(|r| r.task.clone())
            .collect();
        drop(inner);
        sort_most_recent_first(&mut tasks);
        tasks
    }

    /// All retained tasks for one context, oldest update first.
    pub fn context_tasks(&self, context_id: &str) -> Vec<Task> {
        let inner = self.inner.read();
        let Some(ids) = inner.by_context.get(context_id) else {
            return Vec::new();
        };
        let mut tasks: Vec<Task> = ids
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(|r| r.task.clone())
            .collect();
        drop(inner);
        sort_most_recent_first(&mut tasks);
        tasks.reverse();
        tasks
    }

    /// Lists tasks matching the filters, paginated over the filtered set.
    ///
    /// Sort key: `status.timestamp` descending, ties broken by id. The
    /// returned `total` is the filtered count, invariant across pages of
    /// a stable store.
    pub fn list(&self, params: &ListTasksParams) -> TaskPage {
        let inner = self.inner.read();

        // Seed from the narrowest available index.
        let candidate_ids: Vec<&String> = if let Some(worker) = &params.worker_id {
            match inner.by_worker.get(worker) {
                Some(set) => set.iter().collect(),
                None => Vec::new(),
            }
        } else if let Some(ctx) = &params.context_id {
            match inner.by_context.get(ctx) {
                Some(set) => set.iter().collect(),
                None => Vec::new(),
            }
        } else if let Some(state) = params.state {
            match inner.by_state.get(&state) {
                Some(set) => set.iter().collect(),
                None => Vec::new(),
            }
        } else {
            inner.tasks.keys().collect()
        };

        let mut filtered: Vec<Task> = candidate_ids
            .into_iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|r| {
                params
                    .worker_id
                    .as_ref()
                    .is_none_or(|w| &r.worker_id == w)
                    && params
                        .context_id
                        .as_ref()
                        .is_none_or(|c| r.task.context_id.as_ref() == Some(c))
                    && params.state.is_none_or(|s| r.task.status.state == s)
            })
            .map(|r| r.task.clone())
            .collect();
        drop(inner);

        sort_most_recent_first(&mut filtered);

        let total = filtered.len();
        let tasks: Vec<Task> = filtered
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect();

        TaskPage {
            tasks,
            total,
            limit: params.limit,
            offset: params.offset,
        }
    }

    /// Aggregate statistics, optionally scoped to one worker.
    pub fn stats(&self, worker_id: Option<&str>) -> TaskStats {
        let inner = self.inner.read();

        let records: Vec<&TaskRecord> = match worker_id {
            Some(worker) => inner
                .by_worker
                .get(worker)
                .map(|ids| ids.iter().filter_map(|id| inner.tasks.get(id)).collect())
                .unwrap_or_default(),
            None => inner.tasks.values().collect(),
        };

        let mut by_state: BTreeMap<String, usize> = TaskState::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        let mut active = 0;
        let mut active_contexts: HashSet<&str> = HashSet::new();

        for record in &records {
            let state = record.task.status.state;
            *by_state.entry(state.to_string()).or_insert(0) += 1;
            if !state.is_terminal() {
                active += 1;
                if let Some(ctx) = &record.task.context_id {
                    active_contexts.insert(ctx);
                }
            }
        }

        TaskStats {
            total: records.len(),
            active,
            by_state,
            active_contexts: active_contexts.len(),
        }
    }

    /// Removes one task. Returns `true` if it was present.
    pub fn remove(&self, task_id: &str) -> bool {
        self.inner.write().remove(task_id).is_some()
    }

    /// Removes every task owned by `worker_id`, returning the count.
    pub fn clear_worker(&self, worker_id: &str) -> usize {
        let mut inner = self.inner.write();
        let ids: Vec<String> = inner
            .by_worker
            .get(worker_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for id in &ids {
            inner.remove(id);
        }
        ids.len()
    }

    /// Removes all tasks.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write();
        *inner = StoreInner::default();
    }
}

fn sort_most_recent_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        let at = a.status.timestamp;
        let bt = b.status.timestamp;
        bt.cmp(&at).then_with(|| a.id.cmp(&b.id))
    });
}
