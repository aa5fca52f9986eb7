//! Core task wire types and the lifecycle state machine.
//!
//! This module defines the types that appear on the worker wire:
//! [`Task`], [`TaskStatus`], [`TaskState`], [`Message`], [`Part`], and
//! [`Artifact`].
//!
//! # Serialization
//!
//! All types use `#[serde(rename_all = "camelCase")]` so that internal
//! snake_case field names map to the external wire casing (`taskId`,
//! `contextId`, `messageId`). The mapping lives in these attributes and
//! nowhere else; no field name is hand-mapped at call sites.
//!
//! The `artifacts` and `history` sequences use `#[serde(default)]`: a wire
//! task may legally omit them on first creation, and they must deserialize
//! to empty sequences rather than an absent value so that later append
//! events always have something to extend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TaskError;

/// Task lifecycle state.
///
/// A task progresses through these states according to a defined state
/// machine. Terminal states (`Completed`, `Failed`, `Cancelled`,
/// `Rejected`) reject all transitions. Same-state transitions between
/// non-terminal states are accepted: workers re-emit their current state
/// with a fresh status message mid-run, and the monotonicity guarantee
/// only requires that observed states never move backward.
///
/// # State Machine
///
/// ```text
/// Submitted -> Working, Completed, Failed, Cancelled, Rejected
/// Working -> InputRequired, Completed, Failed, Cancelled, Rejected
/// InputRequired -> Working, Completed, Failed, Cancelled, Rejected
/// Completed | Failed | Cancelled | Rejected -> (terminal, no transitions)
/// ```
///
/// # Examples
///
/// ```
/// use agent_tasks::TaskState;
///
/// let state = TaskState::Working;
/// assert!(!state.is_terminal());
/// assert!(state.can_transition_to(&TaskState::Completed));
/// assert!(state.can_transition_to(&TaskState::Working)); // message refresh
/// assert!(!state.can_transition_to(&TaskState::Submitted)); // backward
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task has been received by a worker but not started.
    Submitted,
    /// Task is actively being processed.
    Working,
    /// Worker is blocked awaiting input from the caller.
    InputRequired,
    /// Task completed successfully (terminal).
    Completed,
    /// Task failed (terminal).
    Failed,
    /// Task was cancelled (terminal).
    Cancelled,
    /// Worker refused the task (terminal).
    Rejected,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Working => write!(f, "working"),
            Self::InputRequired => write!(f, "input_required"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl TaskState {
    /// All states, in lifecycle order. Useful for building per-state
    /// aggregations.
    pub const ALL: [TaskState; 7] = [
        Self::Submitted,
        Self::Working,
        Self::InputRequired,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Rejected,
    ];

    /// Returns `true` if this state is terminal (no further transitions).
    ///
    /// # Examples
    ///
    /// ```
    /// use agent_tasks::TaskState;
    ///
    /// assert!(!TaskState::Working.is_terminal());
    /// assert!(!TaskState::InputRequired.is_terminal());
    /// assert!(TaskState::Completed.is_terminal());
    /// assert!(TaskState::Rejected.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }

    /// Returns `true` if transitioning from this state to `next` is legal.
    ///
    /// `InputRequired` is only reachable from `Working`; it returns to
    /// `Working` once the caller has supplied input. Terminal states
    /// accept nothing, including themselves.
    ///
    /// # Examples
    ///
    /// ```
    /// use agent_tasks::TaskState;
    ///
    /// assert!(TaskState::Submitted.can_transition_to(&TaskState::Working));
    /// assert!(TaskState::InputRequired.can_transition_to(&TaskState::Working));
    /// assert!(!TaskState::Completed.can_transition_to(&TaskState::Working));
    /// assert!(!TaskState::Working.can_transition_to(&TaskState::Submitted));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }

        match self {
            Self::Submitted => matches!(
                next,
                Self::Working
                    | Self::Completed
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Rejected
            ),
            Self::Working => matches!(
                next,
                Self::InputRequired
                    | Self::Completed
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Rejected
            ),
            Self::InputRequired => matches!(
                next,
                Self::Working
                    | Self::Completed
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Rejected
            ),
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected => false,
        }
    }

    /// Validates a transition from this state to `next`.
    ///
    /// Returns a [`TaskError::AlreadyTerminal`] when this state is
    /// terminal, or [`TaskError::InvalidTransition`] for any other
    /// rejected transition.
    ///
    /// # Examples
    ///
    /// ```
    /// use agent_tasks::TaskState;
    ///
    /// assert!(TaskState::Working
    ///     .validate_transition("task-1", &TaskState::Completed)
    ///     .is_ok());
    /// assert!(TaskState::Completed
    ///     .validate_transition("task-1", &TaskState::Working)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else if self.is_terminal() {
            Err(TaskError::AlreadyTerminal {
                task_id: task_id.to_string(),
                state: *self,
            })
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The submitting caller (planner, orchestrator, human).
    User,
    /// The worker agent.
    Agent,
}

/// One content part of a message or artifact.
///
/// Parts are tagged on the wire by a `kind` discriminator, matching the
/// worker protocol: `{"kind": "text", "text": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    /// Plain text content.
    Text {
        /// The text payload.
        text: String,
    },
    /// Structured JSON content.
    Data {
        /// Arbitrary structured payload.
        data: Value,
    },
    /// A reference to a file produced or consumed by the worker.
    File {
        /// The file reference.
        file: FileRef,
    },
}

impl Part {
    /// Convenience constructor for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A by-reference file descriptor inside a [`Part::File`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    /// Display name, if the worker provided one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// MIME type, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Location of the file contents.
    pub uri: String,
}

/// A message exchanged between the caller and a worker.
///
/// # Examples
///
/// ```
/// use agent_tasks::{Message, Part, Role};
///
/// let msg = Message::user_text("build the login page");
/// assert_eq!(msg.role, Role::User);
/// assert!(matches!(&msg.parts[0], Part::Text { text } if text == "build the login page"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub message_id: String,

    /// Author of the message.
    pub role: Role,

    /// Ordered content parts.
    pub parts: Vec<Part>,

    /// The task this message belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// The context this message belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl Message {
    /// Creates a user message with a single text part and a generated id.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            parts: vec![Part::text(text)],
            task_id: None,
            context_id: None,
        }
    }

    /// Creates an agent message with a single text part and a generated id.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            role: Role::Agent,
            parts: vec![Part::text(text)],
            task_id: None,
            context_id: None,
        }
    }

    /// The first text part's content, if the message carries one.
    pub fn text_content(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// A named, ordered collection of output parts produced by a worker.
///
/// Artifacts accumulate while the task runs and are immutable once the
/// task reaches a terminal state. Streamed artifact chunks are matched by
/// `name` when appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Unique identifier for this artifact.
    pub artifact_id: String,

    /// Name used to correlate streamed chunks. Optional on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ordered content parts.
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Artifact {
    /// Creates a named artifact with the given parts and a generated id.
    pub fn named(name: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            name: Some(name.into()),
            parts,
        }
    }
}

/// Current lifecycle status: state plus the optional message and time of
/// the last transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// The lifecycle state.
    pub state: TaskState,

    /// Optional human-readable status message attached to the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// When the transition happened. Workers may omit it; the engine
    /// stamps ingestion time in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// Creates a status in `state` stamped with the current time.
    pub fn now(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Attaches a status message.
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }
}

/// A trackable unit of work owned by a remote worker.
///
/// This is the wire shape as emitted by workers. The engine-side owner
/// worker attribution lives on the store's record wrapper, not here: it
/// is not part of the wire format.
///
/// # Examples
///
/// ```
/// use agent_tasks::{Task, TaskState};
///
/// let json = r#"{
///     "id": "t1",
///     "contextId": "ctx-9",
///     "status": { "state": "submitted" }
/// }"#;
/// let task: Task = serde_json::from_str(json).unwrap();
/// assert_eq!(task.id, "t1");
/// assert_eq!(task.status.state, TaskState::Submitted);
/// // Omitted sequences deserialize to empty, never to an absent value.
/// assert!(task.artifacts.is_empty());
/// assert!(task.history.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque unique identifier, assigned by the worker at creation.
    pub id: String,

    /// Optional identifier grouping related tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Prior messages exchanged with the worker, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,

    /// Named outputs accumulated during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Task {
    /// Creates a minimal task in the given state, stamped now.
    pub fn new(id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            context_id: None,
            status: TaskStatus::now(state),
            history: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Returns `true` if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Returns the artifact with the given name, if any.
    pub fn artifact_by_name(&self, name: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
    }
}
