//! The scheduler/dispatcher: polls the store for runnable tasks, checks
//! dependency gating, and executes each ready task under a concurrency
//! limit and a per-task timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskforge_db::models::{Task, TaskPatch, TaskStatus};
use taskforge_db::queries::tasks as db;

use crate::error::TaskError;
use crate::events::{EventBus, TaskEvent};
use crate::registry::HandlerRegistry;
use crate::reporter::ProgressReporter;

/// The dispatcher's in-flight `task_id -> cancellation token` map, shared
/// with the Façade so a user-initiated `cancel()` reaches a running
/// handler instead of only patching the row. Guarded by its own lock, per
/// the concurrency model's "shared resources" rule; nothing outside the
/// dispatcher and the Façade touches it.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, task_id: Uuid, token: CancellationToken) {
        self.tokens.lock().unwrap().insert(task_id, token);
    }

    fn remove(&self, task_id: Uuid) {
        self.tokens.lock().unwrap().remove(&task_id);
    }

    /// Cancel the in-flight handler for `task_id`, if one is running.
    /// Returns `false` if the task isn't currently in flight (e.g. it is
    /// still `Pending`, or already finished) -- the caller still proceeds
    /// with the Store-level transition either way.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.lock().unwrap().get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Configuration for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll the store for newly-ready tasks when the previous
    /// sweep found nothing to do.
    pub poll_interval: Duration,
    /// Backoff applied after a sweep finds no ready tasks and nothing is
    /// in flight, to avoid busy-polling an empty queue.
    pub idle_backoff: Duration,
    /// Maximum number of tasks executing concurrently.
    pub max_concurrency: usize,
    /// Wall-clock budget for a single task execution. Individual tasks may
    /// override this via `Task::timeout_seconds`.
    pub default_task_timeout: Duration,
    /// Grace period after a timeout/cancel signal before the dispatcher
    /// stops waiting on a handler and moves on.
    pub cancel_grace: Duration,
    /// How often the stale-task reaper sweeps {Pending, Running} rows for
    /// each registered task type.
    pub stale_sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let default_task_timeout = Duration::from_secs(300);
        Self {
            poll_interval: Duration::from_secs(1),
            idle_backoff: Duration::from_secs(5),
            max_concurrency: 4,
            default_task_timeout,
            cancel_grace: Duration::from_secs(5),
            stale_sweep_interval: Duration::from_secs(600),
        }
    }
}

impl DispatcherConfig {
    /// The fixed stale-task guard: large enough to avoid reaping live work,
    /// small enough to free stuck users. `max(2 * timeout, 1h)`.
    pub fn stale_task_guard(&self) -> chrono::Duration {
        let guard = (self.default_task_timeout * 2).max(Duration::from_secs(3600));
        chrono::Duration::from_std(guard).unwrap_or(chrono::Duration::hours(1))
    }
}

/// Message sent from a spawned task execution back to the dispatch loop.
struct ExecutionDone {
    task_id: Uuid,
    name: String,
    outcome: Outcome,
}

enum Outcome {
    Completed,
    Failed(String),
    TimedOut(i32),
    Cancelled(&'static str),
}

/// Runs the dispatch loop until `cancel` is triggered, then drains
/// in-flight tasks and returns.
pub async fn run_dispatcher(
    pool: PgPool,
    bus: EventBus,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    cancel: CancellationToken,
    in_flight: InFlightRegistry,
) -> anyhow::Result<()> {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let (tx, mut rx) = mpsc::channel::<ExecutionDone>(config.max_concurrency * 2);
    let mut pending_count: usize = 0;
    let mut next_stale_sweep = tokio::time::Instant::now();

    loop {
        if cancel.is_cancelled() {
            tracing::info!("dispatcher cancelled, draining in-flight tasks");
            let drain_deadline = tokio::time::Instant::now() + config.cancel_grace;
            while pending_count > 0 {
                match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                    Ok(Some(done)) => {
                        pending_count -= 1;
                        in_flight.remove(done.task_id);
                        handle_execution_done(&pool, &bus, done).await;
                    }
                    _ => break,
                }
            }
            if pending_count > 0 {
                tracing::warn!(remaining = pending_count, "drain deadline expired");
            }
            return Ok(());
        }

        while let Ok(done) = rx.try_recv() {
            pending_count -= 1;
            in_flight.remove(done.task_id);
            handle_execution_done(&pool, &bus, done).await;
        }

        if tokio::time::Instant::now() >= next_stale_sweep {
            sweep_stale_tasks(&pool, &registry, &config).await;
            next_stale_sweep = tokio::time::Instant::now() + config.stale_sweep_interval;
        }

        let candidates = match db::ready_to_run(&pool).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(error = %err, "failed to fetch ready tasks, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(config.idle_backoff) => {}
                    _ = cancel.cancelled() => {}
                }
                continue;
            }
        };

        let mut spawned_any = false;

        for task in candidates {
            if semaphore.available_permits() == 0 {
                break;
            }

            let dep_statuses = match db::get_dependency_statuses(&pool, task.id).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::error!(task_id = %task.id, error = %err, "failed to fetch dependency statuses");
                    continue;
                }
            };
            if !task.dependencies_satisfied(&dep_statuses) {
                continue;
            }

            let Some(permit) = semaphore.clone().try_acquire_owned().ok() else {
                break;
            };

            if registry.get(task.task_type).is_none() {
                tracing::error!(task_id = %task.id, task_type = %task.task_type, "no handler registered, leaving pending");
                drop(permit);
                continue;
            }

            let claimed = db::apply_patch(
                &pool,
                task.id,
                TaskStatus::Pending,
                &TaskPatch {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                },
            )
            .await;
            match claimed {
                Ok(rows) if rows == 1 => {}
                Ok(_) => {
                    // Lost the race to another dispatcher instance.
                    drop(permit);
                    continue;
                }
                Err(err) => {
                    tracing::error!(task_id = %task.id, error = %err, "failed to claim task");
                    drop(permit);
                    continue;
                }
            }

            bus.publish(TaskEvent::StatusChanged {
                task_id: task.id,
                from: TaskStatus::Pending,
                to: TaskStatus::Running,
                ts: Utc::now(),
            });

            spawned_any = true;
            pending_count += 1;

            let task_cancel = cancel.child_token();
            in_flight.insert(task.id, task_cancel.clone());

            let pool_clone = pool.clone();
            let bus_clone = bus.clone();
            let registry_clone = Arc::clone(&registry);
            let cancel_clone = cancel.clone();
            let tx_clone = tx.clone();
            let timeout = task
                .timeout_seconds
                .map(|s| Duration::from_secs(s as u64))
                .unwrap_or(config.default_task_timeout);

            tokio::spawn(async move {
                let outcome = execute_one(
                    &pool_clone,
                    &bus_clone,
                    &registry_clone,
                    &task,
                    timeout,
                    task_cancel,
                    cancel_clone,
                )
                .await;
                drop(permit);
                let _ = tx_clone
                    .send(ExecutionDone {
                        task_id: task.id,
                        name: task.name.clone(),
                        outcome,
                    })
                    .await;
            });
        }

        if pending_count > 0 {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        pending_count -= 1;
                        in_flight.remove(done.task_id);
                        handle_execution_done(&pool, &bus, done).await;
                    }
                }
                _ = cancel.cancelled() => { continue; }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        } else if !spawned_any {
            tokio::select! {
                _ = tokio::time::sleep(config.idle_backoff) => {}
                _ = cancel.cancelled() => { continue; }
            }
        }
    }
}

/// Execute a single claimed task, enforcing the timeout and cooperating
/// with both dispatcher-wide and per-task cancellation. `task_cancel` is a
/// child of `parent_cancel`, registered in the dispatcher's in-flight map
/// before this function is called, so either a user-initiated `cancel(id)`
/// or a dispatcher shutdown can trigger it.
async fn execute_one(
    pool: &PgPool,
    bus: &EventBus,
    registry: &HandlerRegistry,
    task: &Task,
    timeout: Duration,
    task_cancel: CancellationToken,
    parent_cancel: CancellationToken,
) -> Outcome {
    let Some(handler) = registry.get(task.task_type) else {
        return Outcome::Failed(format!("no handler registered for {}", task.task_type));
    };

    let reporter = ProgressReporter::new(pool.clone(), bus.clone(), task.id, task_cancel.clone());

    let exec = handler.execute(&task.input, &reporter);
    tokio::select! {
        result = tokio::time::timeout(timeout, exec) => {
            match result {
                Ok(Ok(_value)) => Outcome::Completed,
                Ok(Err(err)) => Outcome::Failed(err.to_string()),
                Err(_elapsed) => Outcome::TimedOut(timeout.as_secs() as i32),
            }
        }
        _ = task_cancel.cancelled() => {
            let reason = if parent_cancel.is_cancelled() { "worker shutdown" } else { "cancelled by user" };
            Outcome::Cancelled(reason)
        }
    }
}

/// Apply the status transition implied by a finished execution, and publish
/// the corresponding bus event.
async fn handle_execution_done(pool: &PgPool, bus: &EventBus, done: ExecutionDone) {
    match done.outcome {
        Outcome::Completed => {
            let patch = TaskPatch {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                ..Default::default()
            };
            let _ = db::apply_patch(pool, done.task_id, TaskStatus::Running, &patch).await;
            bus.publish(TaskEvent::StatusChanged {
                task_id: done.task_id,
                from: TaskStatus::Running,
                to: TaskStatus::Completed,
                ts: Utc::now(),
            });
            tracing::info!(task_id = %done.task_id, name = %done.name, "task completed");
        }
        Outcome::Cancelled(reason) => {
            let patch = TaskPatch {
                status: Some(TaskStatus::Cancelled),
                current_step: Some(Some(reason.to_string())),
                ..Default::default()
            };
            let _ = db::apply_patch(pool, done.task_id, TaskStatus::Running, &patch).await;
            bus.publish(TaskEvent::StatusChanged {
                task_id: done.task_id,
                from: TaskStatus::Running,
                to: TaskStatus::Cancelled,
                ts: Utc::now(),
            });
            tracing::info!(task_id = %done.task_id, name = %done.name, reason, "task cancelled");
        }
        outcome => {
            // Any exception or timeout lands the task in terminal Failed.
            // There is no automatic retry: a caller must explicitly invoke
            // the retry operation, which is gated on retry_count separately.
            let message = match outcome {
                Outcome::Failed(m) => m,
                Outcome::TimedOut(timeout_seconds) => TaskError::Timeout {
                    task_id: done.task_id,
                    timeout_seconds,
                }
                .to_string(),
                Outcome::Completed | Outcome::Cancelled(_) => unreachable!(),
            };

            let patch = TaskPatch {
                status: Some(TaskStatus::Failed),
                error_message: Some(Some(message.clone())),
                ..Default::default()
            };
            let _ = db::apply_patch(pool, done.task_id, TaskStatus::Running, &patch).await;
            bus.publish(TaskEvent::StatusChanged {
                task_id: done.task_id,
                from: TaskStatus::Running,
                to: TaskStatus::Failed,
                ts: Utc::now(),
            });
            tracing::error!(task_id = %done.task_id, name = %done.name, error = %message, "task failed");
        }
    }
}

/// Reap {Pending, Running} rows that have outlived the stale-task guard for
/// each registered task type, so a crashed dispatcher can't permanently
/// wedge a user's concurrency quota.
async fn sweep_stale_tasks(pool: &PgPool, registry: &HandlerRegistry, config: &DispatcherConfig) {
    let guard = config.stale_task_guard();
    for task_type in registry.registered_types() {
        match db::mark_stale(pool, task_type, guard, "stale: exceeded the stale-task guard window").await {
            Ok(tasks) if !tasks.is_empty() => {
                tracing::warn!(task_type = %task_type, count = tasks.len(), "reaped stale tasks");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(task_type = %task_type, error = %err, "failed to sweep stale tasks");
            }
        }
    }
}
