//! The handle a running handler uses to report progress, log, and check for
//! cancellation.
//!
//! Persistence of progress updates is best-effort: a write that loses the
//! optimistic-lock race (because the dispatcher already moved the task out
//! of `Running`, typically on cancellation) is dropped rather than
//! propagated, matching how a handler's own bookkeeping should never be
//! allowed to fail the task it is trying to report on. Publication on the
//! event bus always happens regardless of whether the store write landed.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use taskforge_db::models::{LogLevel, TaskPatch, TaskStatus};
use taskforge_db::queries::tasks::apply_patch;

use crate::events::{EventBus, TaskEvent};

/// Progress Reporter handed to a handler for the duration of one execution.
#[derive(Clone)]
pub struct ProgressReporter {
    pool: PgPool,
    bus: EventBus,
    task_id: Uuid,
    cancel: CancellationToken,
    last_progress: Arc<AtomicI32>,
}

impl ProgressReporter {
    pub fn new(pool: PgPool, bus: EventBus, task_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            pool,
            bus,
            task_id,
            cancel,
            last_progress: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Persist and publish a progress/step update. `progress` is clamped to
    /// `0..=100`.
    pub async fn update_progress(&self, progress: i32, step: Option<&str>) {
        let progress = progress.clamp(0, 100);

        let patch = TaskPatch {
            progress: Some(progress),
            current_step: Some(step.map(str::to_owned)),
            ..Default::default()
        };

        if let Err(err) = apply_patch(&self.pool, self.task_id, TaskStatus::Running, &patch).await
        {
            warn!(task_id = %self.task_id, error = %err, "failed to persist progress update");
        }
        self.last_progress.store(progress, Ordering::Relaxed);

        self.bus.publish(TaskEvent::Progress {
            task_id: self.task_id,
            progress,
            step: step.map(str::to_owned),
            ts: Utc::now(),
        });
    }

    /// Update only the current step, leaving progress unchanged.
    pub async fn update_step(&self, step: &str) {
        self.update_progress(self.last_known_progress(), Some(step)).await;
    }

    pub async fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into()).await;
    }

    pub async fn log_warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into()).await;
    }

    pub async fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into()).await;
    }

    async fn log(&self, level: LogLevel, message: String) {
        tracing::event!(
            tracing::Level::INFO,
            task_id = %self.task_id,
            level = %level,
            "{message}"
        );
        self.bus.publish(TaskEvent::Log {
            task_id: self.task_id,
            level,
            message,
            ts: Utc::now(),
        });
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Whether the dispatcher has requested cancellation of this task.
    /// Long-running handlers should poll this between steps.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep for `duration`, returning early (without error) if cancellation
    /// is requested mid-sleep. Callers that need to distinguish the two
    /// outcomes should check `is_cancelled()` afterwards.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn last_known_progress(&self) -> i32 {
        self.last_progress.load(Ordering::Relaxed)
    }
}
