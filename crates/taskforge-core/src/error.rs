//! The closed error taxonomy used across the task subsystem core.
//!
//! Every fallible public entry point in this crate returns [`TaskError`]
//! rather than `anyhow::Error`, so callers (the HTTP adapter, the CLI) can
//! match on a fixed set of variants instead of inspecting message strings.
//! Internal plumbing that has no caller-facing meaning (store I/O details,
//! serialization) is wrapped in `StoreError`/`Internal` instead of leaking
//! through.

use uuid::Uuid;

/// The error taxonomy surfaced by the Façade, Dispatcher, and Policy Engine.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("task {task_id} has exhausted its retries ({retry_count}/{max_retries})")]
    RetriesExhausted {
        task_id: Uuid,
        retry_count: i32,
        max_retries: i32,
    },

    #[error("task {task_id} timed out after {timeout_seconds}s")]
    Timeout { task_id: Uuid, timeout_seconds: i32 },

    #[error("task {0} was cancelled")]
    Cancelled(Uuid),

    #[error("handler for task {task_id} failed: {message}")]
    HandlerError { task_id: Uuid, message: String },

    #[error("no handler registered for task type {0}")]
    MissingHandler(String),

    #[error("store error: {0}")]
    StoreError(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether this error represents a caller mistake (bad input, policy
    /// denial, illegal request) as opposed to an internal failure. Used by
    /// the HTTP adapter to choose between a 4xx and a 5xx status.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied(_)
                | Self::NotFound(_)
                | Self::IllegalTransition { .. }
                | Self::RetriesExhausted { .. }
                | Self::Cancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
