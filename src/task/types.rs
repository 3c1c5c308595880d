use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for task units
pub type TaskId = Uuid;

/// Result alias used throughout the task core
pub type Result<T> = std::result::Result<T, TaskError>;

/// Largest part count a tracker may hold. Declared totals go up to
/// `MAX_PARTS - 1`, so the total plus the implicit completion part still fits.
pub const MAX_PARTS: u64 = i64::MAX as u64;

/// Lifecycle state of a single task unit (and of its tracker)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Created but not yet submitted
    Unstarted = 0,
    /// Body is executing
    Running = 1,
    /// Body returned; waiting for spawned children
    CompletionPending = 2,
    /// Finished successfully
    Completed = 3,
    /// Finished with an error or was cancelled
    Failed = 4,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Unstarted,
            1 => TaskState::Running,
            2 => TaskState::CompletionPending,
            3 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    /// Check if the state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Check if progress may still be reported in this state
    pub fn accepts_progress(self) -> bool {
        matches!(self, TaskState::Running | TaskState::CompletionPending)
    }
}

/// Overall state of a task root
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RootState {
    Unstarted = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
}

impl RootState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RootState::Unstarted,
            1 => RootState::Running,
            2 => RootState::Completed,
            _ => RootState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RootState::Completed | RootState::Failed)
    }
}

/// Errors produced by the task core
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// An operation was used outside of its legal lifecycle window
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("task was cancelled")]
    Cancelled,
    /// Error returned by a work body
    #[error("task body failed: {0:#}")]
    Body(Arc<anyhow::Error>),
    #[error("task body panicked: {0}")]
    Panicked(String),
    /// An observer wait was interrupted by `interrupt_waiters`
    #[error("wait was interrupted")]
    Interrupted,
    #[error("task has not finished yet")]
    NotFinished,
    #[error("task finished without producing a result")]
    MissingResult,
    /// Observer-facing wrapper around the recorded cause
    #[error("task execution failed: {0}")]
    Execution(Box<TaskError>),
}

impl TaskError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TaskError::ProtocolViolation(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        TaskError::InvalidArgument(message.into())
    }

    /// Wrap a cause for delivery to an observer
    pub fn execution(cause: TaskError) -> Self {
        match cause {
            already @ TaskError::Execution(_) => already,
            other => TaskError::Execution(Box::new(other)),
        }
    }

    /// Convert an error returned by a work body into a recorded cause.
    ///
    /// Errors that already are `TaskError`s (for example the result of
    /// `check_cancel()?`) are kept as they are.
    pub fn from_body(error: anyhow::Error) -> Self {
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            Err(other) => TaskError::Body(Arc::new(other)),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        match self {
            TaskError::Cancelled => true,
            TaskError::Execution(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// The innermost cause, unwrapping any execution wrappers
    pub fn root_cause(&self) -> &TaskError {
        match self {
            TaskError::Execution(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// Lifecycle events emitted by task units and roots
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    Failed {
        task_id: TaskId,
        cause: TaskError,
        at: DateTime<Utc>,
    },
    /// Emitted for every unit reaching a terminal state, immediately before
    /// its `Completed` or `Failed` event
    Stopped {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    RootFinished {
        name: String,
        state: RootState,
        at: DateTime<Utc>,
    },
}

/// Handler for task events
///
/// Handlers run on whichever thread performed the transition and must not
/// block for long.
pub trait TaskEventHandler: Send + Sync {
    fn handle_event(&self, event: &TaskEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl TaskEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { task_id, .. } => {
                debug!("Task started: {}", task_id);
            }
            TaskEvent::Completed { task_id, .. } => {
                debug!("Task completed: {}", task_id);
            }
            TaskEvent::Failed { task_id, cause, .. } => {
                warn!("Task failed: {} - {}", task_id, cause);
            }
            TaskEvent::Stopped { task_id, .. } => {
                debug!("Task stopped: {}", task_id);
            }
            TaskEvent::RootFinished { name, state, .. } => {
                info!("Task tree '{}' finished: {:?}", name, state);
            }
        }
    }
}
