//! Error taxonomy for the scheduler.
//!
//! Only registration and control-plane errors are returned to callers. Per-fire
//! failures (handler errors, panics, store outages during a run) are logged and
//! recorded in history instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("task '{name}' is already registered")]
    DuplicateTask { name: String },

    #[error("unknown task '{name}'")]
    UnknownTask { name: String },

    #[error("scheduler is already started")]
    AlreadyStarted,

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("run of '{name}' was aborted: {reason}")]
    RunAborted { name: String, reason: String },

    /// The connection pool or a blocking worker could not reach the store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl SchedulerError {
    pub(crate) fn invalid_schedule(expr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::StoreUnavailable(format!("blocking store task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
