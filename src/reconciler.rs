//! Reconciliation of streamed lifecycle events into stored task state.
//!
//! Events arrive on unreliable channels: duplicated creations, updates
//! for tasks whose creation has not landed yet, and stragglers after a
//! task already reached a terminal state are all expected inputs, not
//! errors. The reconciler absorbs them — anomalies are logged and
//! counted, never raised — and reports what actually changed as a
//! [`TaskDelta`] so callers can react to real transitions only.
//!
//! Updates for unknown tasks are buffered for a short grace period and
//! replayed in arrival order once the creation event lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::hub::BroadcastHub;
use crate::store::TaskStore;
use crate::types::event::{IgnoreReason, TaskDelta, TaskEvent};
use crate::types::task::{Artifact, Task, TaskStatus};

// ---- diagnostics ----

/// Counters for absorbed anomalies. Cheap to bump, read on demand.
#[derive(Debug, Default)]
pub struct Diagnostics {
    duplicate_creations: AtomicU64,
    post_terminal_events: AtomicU64,
    illegal_transitions: AtomicU64,
    buffered_events: AtomicU64,
    dropped_events: AtomicU64,
    malformed_events: AtomicU64,
}

/// Point-in-time copy of the anomaly counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub duplicate_creations: u64,
    pub post_terminal_events: u64,
    pub illegal_transitions: u64,
    pub buffered_events: u64,
    pub dropped_events: u64,
    pub malformed_events: u64,
}

impl Diagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            duplicate_creations: self.duplicate_creations.load(Ordering::Relaxed),
            post_terminal_events: self.post_terminal_events.load(Ordering::Relaxed),
            illegal_transitions: self.illegal_transitions.load(Ordering::Relaxed),
            buffered_events: self.buffered_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
        }
    }

    /// Records a wire payload that could not be decoded into an event.
    pub(crate) fn note_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }
}

// ---- pending buffer ----

#[derive(Debug)]
struct PendingSlot {
    first_seen: Instant,
    events: Vec<(String, TaskEvent)>,
}

// ---- reconciler ----

/// Applies lifecycle events to the store and fans out resulting updates.
pub struct Reconciler {
    store: Arc<TaskStore>,
    hub: Arc<BroadcastHub>,
    pending: Mutex<HashMap<String, PendingSlot>>,
    config: EngineConfig,
    diagnostics: Arc<Diagnostics>,
}

impl Reconciler {
    pub fn new(store: Arc<TaskStore>, hub: Arc<BroadcastHub>, config: EngineConfig) -> Self {
        Self {
            store,
            hub,
            pending: Mutex::new(HashMap::new()),
            config,
            diagnostics: Arc::new(Diagnostics::default()),
        }
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Applies one event from `worker_id`'s stream.
    ///
    /// Never fails: anomalous events are absorbed and reported as
    /// [`TaskDelta::Ignored`] with the reason.
    pub fn apply(&self, worker_id: &str, event: TaskEvent) -> TaskDelta {
        match event {
            TaskEvent::Created { task } => self.apply_created(worker_id, task),
            TaskEvent::StatusChanged {
                ref task_id,
                ref status,
                ..
            } => {
                if !self.store.contains(task_id) {
                    let task_id = task_id.clone();
                    return self.buffer_pending(worker_id, task_id, event);
                }
                self.apply_status(task_id.clone(), status.clone())
            }
            TaskEvent::ArtifactAppended {
                ref task_id,
                ref artifact,
                append,
                ..
            } => {
                if !self.store.contains(task_id) {
                    let task_id = task_id.clone();
                    return self.buffer_pending(worker_id, task_id, event);
                }
                self.apply_artifact(task_id.clone(), artifact.clone(), append)
            }
        }
    }

    fn apply_created(&self, worker_id: &str, mut task: Task) -> TaskDelta {
        let task_id = task.id.clone();
        if self.store.contains(&task_id) {
            self.diagnostics
                .duplicate_creations
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task_id = %task_id, worker_id, "ignoring duplicate task creation");
            return TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::DuplicateCreation,
            };
        }

        if task.status.timestamp.is_none() {
            task.status.timestamp = Some(Utc::now());
        }
        self.store.insert(worker_id, task.clone());
        self.hub.notify(worker_id, &task);
        tracing::info!(task_id = %task_id, worker_id, state = %task.status.state, "task created");

        // Replay updates that arrived ahead of the creation, in order.
        let buffered = self.pending.lock().remove(&task_id);
        if let Some(slot) = buffered {
            for (buffered_worker, buffered_event) in slot.events {
                self.apply(&buffered_worker, buffered_event);
            }
        }

        TaskDelta::Created { task_id }
    }

    fn apply_status(&self, task_id: String, mut status: TaskStatus) -> TaskDelta {
        let Some(record) = self.store.get_record(&task_id) else {
            return TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::Buffered,
            };
        };
        let next = status.state;
        if status.timestamp.is_none() {
            status.timestamp = Some(Utc::now());
        }

        // Validation happens inside the update closure, against the
        // state under the write lock: two racing legal transitions into
        // terminal states must resolve to exactly one winner.
        let outcome = self.store.update_task(&task_id, |task| {
            let current = task.status.state;
            if current.is_terminal() {
                return Err(IgnoreReason::PostTerminal(current));
            }
            if !current.can_transition_to(&next) {
                return Err(IgnoreReason::IllegalTransition {
                    from: current,
                    to: next,
                });
            }
            // The superseded status message becomes history before the
            // new status replaces it.
            if let Some(message) = task.status.message.take() {
                task.history.push(message);
            }
            task.status = status;
            Ok(current)
        });

        match outcome {
            None => TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::Buffered,
            },
            Some(Err(reason)) => {
                self.note_ignored(&task_id, &reason);
                TaskDelta::Ignored { task_id, reason }
            }
            Some(Ok(from)) => {
                self.notify_current(&record.worker_id, &task_id);
                tracing::debug!(task_id = %task_id, from = %from, to = %next, "task status updated");
                TaskDelta::StatusUpdated {
                    task_id,
                    state: next,
                    terminal: next.is_terminal(),
                }
            }
        }
    }

    fn apply_artifact(&self, task_id: String, artifact: Artifact, append: bool) -> TaskDelta {
        let Some(record) = self.store.get_record(&task_id) else {
            return TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::Buffered,
            };
        };

        // Terminal guard under the write lock: artifacts are immutable
        // the instant a racing status event lands a terminal state.
        let outcome = self.store.update_task(&task_id, |task| {
            let state = task.status.state;
            if state.is_terminal() {
                return Err(IgnoreReason::PostTerminal(state));
            }
            let existing = append
                .then(|| {
                    artifact.name.as_ref().and_then(|name| {
                        task.artifacts
                            .iter_mut()
                            .find(|a| a.name.as_deref() == Some(name))
                    })
                })
                .flatten();
            match existing {
                Some(target) => target.parts.extend(artifact.parts.iter().cloned()),
                // An append with no matching name starts a new artifact
                // rather than losing the chunk.
                None => task.artifacts.push(artifact.clone()),
            }
            Ok(())
        });

        match outcome {
            None => TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::Buffered,
            },
            Some(Err(reason)) => {
                self.note_ignored(&task_id, &reason);
                TaskDelta::Ignored { task_id, reason }
            }
            Some(Ok(())) => {
                self.notify_current(&record.worker_id, &task_id);
                TaskDelta::ArtifactUpdated { task_id }
            }
        }
    }

    fn note_ignored(&self, task_id: &str, reason: &IgnoreReason) {
        match reason {
            IgnoreReason::PostTerminal(state) => {
                self.diagnostics
                    .post_terminal_events
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id,
                    state = %state,
                    "ignoring event for terminal task"
                );
            }
            IgnoreReason::IllegalTransition { from, to } => {
                self.diagnostics
                    .illegal_transitions
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id,
                    from = %from,
                    to = %to,
                    "ignoring illegal state transition"
                );
            }
            _ => {}
        }
    }

    fn notify_current(&self, worker_id: &str, task_id: &str) {
        if let Some(task) = self.store.get(task_id) {
            self.hub.notify(worker_id, &task);
        }
    }

    fn buffer_pending(&self, worker_id: &str, task_id: String, event: TaskEvent) -> TaskDelta {
        let mut pending = self.pending.lock();
        let slot = pending.entry(task_id.clone()).or_insert_with(|| PendingSlot {
            first_seen: Instant::now(),
            events: Vec::new(),
        });
        if slot.events.len() >= self.config.pending_buffer_per_task {
            self.diagnostics
                .dropped_events
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task_id = %task_id, worker_id, "pending buffer full, dropping event");
            return TaskDelta::Ignored {
                task_id,
                reason: IgnoreReason::BufferFull,
            };
        }
        slot.events.push((worker_id.to_string(), event));
        self.diagnostics
            .buffered_events
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_id = %task_id, worker_id, "buffered event for unknown task");
        TaskDelta::Ignored {
            task_id,
            reason: IgnoreReason::Buffered,
        }
    }

    /// Drops buffered events whose creation never arrived within the
    /// grace period. Returns the number of events discarded.
    pub fn prune_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let grace = self.config.pending_grace;
        let mut dropped = 0;
        pending.retain(|task_id, slot| {
            if slot.first_seen.elapsed() <= grace {
                return true;
            }
            dropped += slot.events.len();
            tracing::warn!(
                task_id = %task_id,
                events = slot.events.len(),
                "discarding buffered events, creation never arrived"
            );
            false
        });
        if dropped > 0 {
            self.diagnostics
                .dropped_events
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Number of tasks with buffered events awaiting creation.
    pub fn pending_tasks(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::{Part, TaskState};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn reconciler_with(config: EngineConfig) -> (Reconciler, Arc<TaskStore>, Arc<BroadcastHub>) {
        let store = Arc::new(TaskStore::new(config.store_capacity));
        let hub = Arc::new(BroadcastHub::new());
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&hub), config);
        (reconciler, store, hub)
    }

    fn reconciler() -> (Reconciler, Arc<TaskStore>, Arc<BroadcastHub>) {
        reconciler_with(EngineConfig::default())
    }

    fn created(task_id: &str) -> TaskEvent {
        TaskEvent::Created {
            task: Task::new(task_id, TaskState::Submitted),
        }
    }

    fn status(task_id: &str, state: TaskState) -> TaskEvent {
        TaskEvent::StatusChanged {
            task_id: task_id.to_string(),
            context_id: None,
            status: TaskStatus::now(state),
            r#final: state.is_terminal(),
        }
    }

    fn artifact(task_id: &str, name: &str, text: &str, append: bool) -> TaskEvent {
        TaskEvent::ArtifactAppended {
            task_id: task_id.to_string(),
            context_id: None,
            artifact: Artifact {
                artifact_id: format!("{name}-chunk"),
                name: Some(name.to_string()),
                parts: vec![Part::text(text)],
            },
            append,
            last_chunk: false,
        }
    }

    #[test]
    fn creation_is_idempotent() {
        let (r, store, _) = reconciler();
        assert!(matches!(r.apply("w1", created("t1")), TaskDelta::Created { .. }));
        let delta = r.apply("w1", created("t1"));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::DuplicateCreation,
                ..
            }
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(r.diagnostics().snapshot().duplicate_creations, 1);
    }

    #[test]
    fn status_replaces_and_archives_message() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply(
            "w1",
            TaskEvent::StatusChanged {
                task_id: "t1".to_string(),
                context_id: None,
                status: TaskStatus::now(TaskState::Working)
                    .with_message(crate::types::task::Message::agent_text("thinking")),
                r#final: false,
            },
        );
        r.apply("w1", status("t1", TaskState::Completed));

        let task = store.get("t1").unwrap();
        assert_eq!(task.status.state, TaskState::Completed);
        // The superseded working message moved to history.
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].text_content(), Some("thinking"));
    }

    #[test]
    fn terminal_state_absorbs_all_events() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Completed));

        let delta = r.apply("w1", status("t1", TaskState::Working));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::PostTerminal(TaskState::Completed),
                ..
            }
        ));
        let delta = r.apply("w1", artifact("t1", "out", "late", false));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::PostTerminal(_),
                ..
            }
        ));

        let task = store.get("t1").unwrap();
        assert_eq!(task.status.state, TaskState::Completed);
        assert!(task.artifacts.is_empty());
        assert_eq!(r.diagnostics().snapshot().post_terminal_events, 2);
    }

    #[test]
    fn racing_terminal_writes_apply_exactly_once() {
        let (r, store, _) = reconciler();
        let r = Arc::new(r);
        for i in 0..500 {
            let task_id = format!("t{i}");
            r.apply("w", created(&task_id));
            r.apply("w", status(&task_id, TaskState::Working));

            // Both transitions are legal from `working`; whichever lands
            // second must be rejected as post-terminal.
            let r1 = Arc::clone(&r);
            let r2 = Arc::clone(&r);
            let id1 = task_id.clone();
            let id2 = task_id.clone();
            let h1 =
                std::thread::spawn(move || r1.apply("w", status(&id1, TaskState::Completed)));
            let h2 =
                std::thread::spawn(move || r2.apply("w", status(&id2, TaskState::Cancelled)));
            let a = h1.join().unwrap();
            let b = h2.join().unwrap();

            let applied = [a, b]
                .iter()
                .filter(|d| matches!(d, TaskDelta::StatusUpdated { .. }))
                .count();
            assert_eq!(applied, 1, "exactly one racing terminal write must win");
            assert!(store.get(&task_id).unwrap().is_terminal());
        }
        assert_eq!(r.diagnostics().snapshot().post_terminal_events, 500);
    }

    #[test]
    fn illegal_transition_is_ignored() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        // submitted -> input_required skips working.
        let delta = r.apply("w1", status("t1", TaskState::InputRequired));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::IllegalTransition { .. },
                ..
            }
        ));
        assert_eq!(store.get("t1").unwrap().status.state, TaskState::Submitted);
        assert_eq!(r.diagnostics().snapshot().illegal_transitions, 1);
    }

    #[test]
    fn input_required_round_trip() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", status("t1", TaskState::InputRequired));
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", status("t1", TaskState::Completed));
        assert_eq!(store.get("t1").unwrap().status.state, TaskState::Completed);
    }

    #[test]
    fn artifact_append_merges_by_name() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", artifact("t1", "report", "part one ", false));
        r.apply("w1", artifact("t1", "report", "part two", true));

        let task = store.get("t1").unwrap();
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.artifacts[0].parts.len(), 2);
    }

    #[test]
    fn append_without_match_starts_new_artifact() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Working));
        // First chunk arrives already flagged as an append.
        r.apply("w1", artifact("t1", "log", "chunk", true));

        let task = store.get("t1").unwrap();
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.artifacts[0].name.as_deref(), Some("log"));
    }

    #[test]
    fn distinct_names_stay_separate() {
        let (r, store, _) = reconciler();
        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", artifact("t1", "a", "x", false));
        r.apply("w1", artifact("t1", "b", "y", false));
        assert_eq!(store.get("t1").unwrap().artifacts.len(), 2);
    }

    #[test]
    fn early_updates_are_buffered_then_replayed() {
        let (r, store, _) = reconciler();
        // Status and artifact arrive before the creation event.
        let delta = r.apply("w1", status("t1", TaskState::Working));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::Buffered,
                ..
            }
        ));
        r.apply("w1", artifact("t1", "out", "early", false));
        assert_eq!(r.pending_tasks(), 1);

        r.apply("w1", created("t1"));

        let task = store.get("t1").unwrap();
        assert_eq!(task.status.state, TaskState::Working);
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(r.pending_tasks(), 0);
    }

    #[test]
    fn pending_buffer_is_capped() {
        let config = EngineConfig {
            pending_buffer_per_task: 2,
            ..EngineConfig::default()
        };
        let (r, _, _) = reconciler_with(config);
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", status("t1", TaskState::Working));
        let delta = r.apply("w1", status("t1", TaskState::Working));
        assert!(matches!(
            delta,
            TaskDelta::Ignored {
                reason: IgnoreReason::BufferFull,
                ..
            }
        ));
        assert_eq!(r.diagnostics().snapshot().dropped_events, 1);
    }

    #[test]
    fn prune_discards_expired_pending() {
        let config = EngineConfig {
            pending_grace: Duration::from_millis(0),
            ..EngineConfig::default()
        };
        let (r, _, _) = reconciler_with(config);
        r.apply("w1", status("t1", TaskState::Working));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(r.prune_pending(), 1);
        assert_eq!(r.pending_tasks(), 0);
        assert_eq!(r.diagnostics().snapshot().dropped_events, 1);
    }

    #[test]
    fn updates_are_broadcast_as_full_tasks() {
        let (r, store, hub) = reconciler();
        let (_handle, _, mut rx) = hub.subscribe("w1", Vec::new);

        r.apply("w1", created("t1"));
        r.apply("w1", status("t1", TaskState::Working));
        r.apply("w1", artifact("t1", "out", "x", false));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.task.status.state, TaskState::Submitted);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.task.status.state, TaskState::Working);
        let third = rx.try_recv().unwrap();
        assert_eq!(third.task.artifacts.len(), 1);
        assert_eq!(store.get("t1").unwrap().artifacts.len(), 1);
    }
}
