//! The contract every task handler implements, plus the shared helper
//! methods handlers get for free.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, TaskError};
use crate::reporter::ProgressReporter;

/// A unit of work the dispatcher can execute for one task type.
///
/// Implementations must be `Send + Sync` because a single registered
/// instance is shared across concurrently-dispatched tasks of that type;
/// handlers hold no per-task mutable state of their own (that lives in the
/// `ProgressReporter` and the task row).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task described by `input`, reporting progress through
    /// `reporter`. A returned `Ok(value)` becomes the task's `result`
    /// column; an `Err` becomes its `error_message` and drives the
    /// failed/retry transition.
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value>;

    /// Human-readable name, used in logs and the CLI's `list` output.
    fn name(&self) -> &'static str;
}

/// Helpers available to any [`TaskHandler`] implementation, mirroring the
/// validation and pacing primitives handlers need regardless of domain.
pub mod support {
    use super::*;
    use std::time::Duration;

    /// Verify that `input` is a JSON object containing every key in
    /// `required`. Returns a [`TaskError::HandlerError`]-shaped message
    /// listing the first missing key, intended to be wrapped with the
    /// task id by the caller.
    pub fn require_keys(input: &Value, required: &[&str]) -> std::result::Result<(), String> {
        let obj = input
            .as_object()
            .ok_or_else(|| "input is not a JSON object".to_string())?;
        for key in required {
            if !obj.contains_key(*key) {
                return Err(format!("missing required input field: {key}"));
            }
        }
        Ok(())
    }

    /// Cancellable sleep, pausing a handler between steps without blocking
    /// a graceful shutdown or cancellation request.
    pub async fn sleep(reporter: &ProgressReporter, duration: Duration) {
        reporter.sleep(duration).await;
    }
}

/// Convenience for handlers that want to bail out early with a consistently
/// shaped error when required input is missing.
pub fn require_input_keys(task_id: uuid::Uuid, input: &Value, required: &[&str]) -> Result<()> {
    support::require_keys(input, required).map_err(|message| TaskError::HandlerError {
        task_id,
        message,
    })
}
