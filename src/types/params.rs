//! Query parameters, result pages, aggregate statistics, and submission
//! outcomes for the observer and caller boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task::{Task, TaskState};

/// Filters and pagination for listing tasks.
///
/// All filters are optional and combine with AND semantics. Pagination is
/// computed over the *filtered* set.
///
/// # Examples
///
/// ```
/// use agent_tasks::{ListTasksParams, TaskState};
///
/// let params = ListTasksParams {
///     state: Some(TaskState::Completed),
///     limit: 10,
///     ..ListTasksParams::default()
/// };
/// assert!(params.worker_id.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    /// Only tasks owned by this worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Only tasks in this context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Only tasks currently in this state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,

    /// Maximum number of tasks to return.
    pub limit: usize,

    /// Number of filtered tasks to skip.
    pub offset: usize,
}

impl Default for ListTasksParams {
    fn default() -> Self {
        Self {
            worker_id: None,
            context_id: None,
            state: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of task results.
///
/// `total` is the size of the whole filtered set, not of this page, so
/// clients can compute page counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    /// The tasks in this page, most recently updated first.
    pub tasks: Vec<Task>,

    /// Total number of tasks matching the filters.
    pub total: usize,

    /// Echo of the requested limit.
    pub limit: usize,

    /// Echo of the requested offset.
    pub offset: usize,
}

/// Aggregate task statistics, optionally scoped to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    /// Total tasks counted.
    pub total: usize,

    /// Tasks in a non-terminal state.
    pub active: usize,

    /// Task counts keyed by state name.
    pub by_state: BTreeMap<String, usize>,

    /// Distinct `context_id`s with at least one active task.
    pub active_contexts: usize,
}

/// Result of submitting a task description for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    /// `true` if the submission was queued rather than dispatched.
    pub queued: bool,

    /// 1-based queue position when queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,

    /// Id of the resulting task, known only on immediate dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Point-in-time view of one worker's execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// `true` while a task is in flight.
    pub busy: bool,

    /// Id of the in-flight task, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,

    /// Number of pending entries behind the in-flight task.
    pub depth: usize,
}
