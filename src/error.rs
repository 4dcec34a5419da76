//! Error types for supervised task execution.

use std::time::Duration;

use taskguard_breaker::BreakerOpen;

use crate::metrics::TaskId;

/// Boxed cause carried by [`TaskError::Execution`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for supervised tasks.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task did not finish before its deadline and was aborted.
    #[error("task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: TaskId, timeout: Duration },

    /// The task failed or panicked, or every retry attempt failed.
    #[error("task {task_id} failed after {attempts} attempt(s): {source}")]
    Execution {
        task_id: TaskId,
        attempts: u32,
        source: BoxError,
    },

    /// The circuit breaker rejected the call before any attempt was made.
    #[error(transparent)]
    CircuitOpen(#[from] BreakerOpen),

    /// The task was cancelled through its handle or `cancel_all`.
    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The concurrency limit was reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The owner-thread loop is gone.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat classification of [`TaskError`], for branching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskErrorKind {
    Timeout,
    Execution,
    CircuitOpen,
    Cancelled,
    Configuration,
    ResourceExhausted,
    Dispatch,
    Io,
}

impl TaskError {
    /// The flat kind of this error.
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            Self::Timeout { .. } => TaskErrorKind::Timeout,
            Self::Execution { .. } => TaskErrorKind::Execution,
            Self::CircuitOpen(_) => TaskErrorKind::CircuitOpen,
            Self::Cancelled { .. } => TaskErrorKind::Cancelled,
            Self::Config(_) => TaskErrorKind::Configuration,
            Self::ResourceExhausted(_) => TaskErrorKind::ResourceExhausted,
            Self::Dispatch(_) => TaskErrorKind::Dispatch,
            Self::Io(_) => TaskErrorKind::Io,
        }
    }

    pub(crate) fn execution(task_id: &TaskId, attempts: u32, source: impl Into<BoxError>) -> Self {
        Self::Execution {
            task_id: task_id.clone(),
            attempts,
            source: source.into(),
        }
    }

    /// The task id this error refers to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Timeout { task_id, .. }
            | Self::Execution { task_id, .. }
            | Self::Cancelled { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TaskError>;
