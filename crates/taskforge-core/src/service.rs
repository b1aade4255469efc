//! The Task Service Façade: the single entry point external callers (the
//! HTTP adapter, the CLI) use to submit, inspect, and manage tasks. Every
//! mutation goes through here so the policy/audit path is never bypassed,
//! including for system-originated submissions (the Recurring Scheduler
//! uses a system actor rather than calling the store directly).

use std::collections::HashSet;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use taskforge_db::models::{NewTask, QueueDepth, Task, TaskFilter, TaskPriority, TaskType};
use taskforge_db::queries::tasks as db;

use crate::dispatcher::InFlightRegistry;
use crate::error::{Result, TaskError};
use crate::events::{EventBus, PolicyOutcome, TaskEvent};
use crate::policy;

/// The actor id used for system-originated submissions (scheduled backups,
/// retention sweeps). Not a real user row.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();

/// The capability set assigned to [`SYSTEM_ACTOR`]: satisfies every policy
/// row gated on `{system}` (the Recurring Scheduler's backup/retention
/// submissions), and nothing else.
pub fn system_capabilities() -> HashSet<String> {
    HashSet::from(["system".to_string()])
}

/// Request shape accepted by [`TaskService::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    pub name: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub input: serde_json::Value,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub scheduled_at: Option<chrono::DateTime<Utc>>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub depends_on_task_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct TaskService {
    pool: PgPool,
    bus: EventBus,
    in_flight: InFlightRegistry,
}

impl TaskService {
    pub fn new(pool: PgPool, bus: EventBus, in_flight: InFlightRegistry) -> Self {
        Self { pool, bus, in_flight }
    }

    /// The underlying pool, for callers (the Recurring Scheduler) that read
    /// `BackupConfig` snapshots directly rather than through a Façade method.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Submit a new task on behalf of `actor` (holding `actor_capabilities`).
    /// Runs the policy check first and publishes a `PolicyAudit` event
    /// regardless of outcome.
    pub async fn submit(
        &self,
        actor: Uuid,
        actor_capabilities: &HashSet<String>,
        request: SubmitRequest,
    ) -> Result<Task> {
        let decision = policy::evaluate(
            &self.pool,
            actor,
            actor_capabilities,
            request.task_type,
            &request.input,
        )
        .await?;

        let (outcome, reason) = match &decision {
            Ok(()) => (PolicyOutcome::Allowed, None),
            Err(denial) => (PolicyOutcome::Denied, Some(denial.0.clone())),
        };
        self.bus.publish(TaskEvent::PolicyAudit {
            actor,
            task_type: request.task_type.to_string(),
            outcome,
            reason: reason.clone(),
            ts: Utc::now(),
        });

        if let Err(denial) = decision {
            return Err(TaskError::PolicyDenied(denial.0));
        }

        let new_task = NewTask {
            task_type: request.task_type,
            name: request.name,
            description: request.description,
            priority: request.priority,
            input: request.input,
            max_retries: request.max_retries,
            timeout_seconds: request.timeout_seconds,
            scheduled_at: request.scheduled_at,
            created_by_user_id: if actor == SYSTEM_ACTOR { None } else { Some(actor) },
            related_entity_type: request.related_entity_type,
            related_entity_id: request.related_entity_id,
            parent_task_id: None,
            depends_on_task_ids: request.depends_on_task_ids,
        };

        let task = db::create_task(&self.pool, new_task)
            .await
            .map_err(TaskError::StoreError)?;

        if actor == SYSTEM_ACTOR {
            tracing::info!(task_id = %task.id, task_type = %task.task_type, "system task submitted");
        } else {
            tracing::info!(task_id = %task.id, task_type = %task.task_type, actor = %actor, "task submitted");
        }

        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        db::get_task(&self.pool, task_id)
            .await
            .map_err(TaskError::StoreError)?
            .ok_or(TaskError::NotFound(task_id))
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        db::list_tasks(&self.pool, &filter)
            .await
            .map_err(TaskError::StoreError)
    }

    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        db::queue_depth(&self.pool).await.map_err(TaskError::StoreError)
    }

    /// Cancel a task that is still `Pending`, `Running`, or `Retry`.
    /// Terminal tasks cannot be cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskError::IllegalTransition {
                task_id,
                from: task.status.to_string(),
                to: "cancelled".to_string(),
            });
        }

        self.in_flight.cancel(task_id);

        let patch = taskforge_db::models::TaskPatch {
            status: Some(taskforge_db::models::TaskStatus::Cancelled),
            current_step: Some(Some("cancelled by user".to_string())),
            ..Default::default()
        };
        let rows = db::apply_patch(&self.pool, task_id, task.status, &patch)
            .await
            .map_err(TaskError::StoreError)?;
        if rows == 0 {
            // Lost the race to the dispatcher's own cancellation-triggered
            // patch (it observed the same token). Not an error as long as
            // the row actually landed on Cancelled.
            let current = self.get(task_id).await?;
            if current.status == taskforge_db::models::TaskStatus::Cancelled {
                return Ok(current);
            }
            return Err(TaskError::IllegalTransition {
                task_id,
                from: task.status.to_string(),
                to: "cancelled".to_string(),
            });
        }

        self.bus.publish(TaskEvent::StatusChanged {
            task_id,
            from: task.status,
            to: taskforge_db::models::TaskStatus::Cancelled,
            ts: Utc::now(),
        });

        self.get(task_id).await
    }

    /// Reset a `Failed` task back to `Pending` so the dispatcher picks it
    /// up again. Valid only while `retry_count < max_retries`; there is no
    /// automatic retry path, so this is the only way a failed task runs
    /// again.
    pub async fn retry(&self, task_id: Uuid) -> Result<Task> {
        let task = self.get(task_id).await?;
        if task.status != taskforge_db::models::TaskStatus::Failed {
            return Err(TaskError::IllegalTransition {
                task_id,
                from: task.status.to_string(),
                to: "pending".to_string(),
            });
        }
        if task.retry_count >= task.max_retries {
            return Err(TaskError::RetriesExhausted {
                task_id,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            });
        }

        let rows = db::retry_reset(&self.pool, task_id, task.retry_count)
            .await
            .map_err(TaskError::StoreError)?;
        if rows == 0 {
            return Err(TaskError::IllegalTransition {
                task_id,
                from: task.status.to_string(),
                to: "pending".to_string(),
            });
        }

        self.bus.publish(TaskEvent::StatusChanged {
            task_id,
            from: taskforge_db::models::TaskStatus::Failed,
            to: taskforge_db::models::TaskStatus::Pending,
            ts: Utc::now(),
        });

        self.get(task_id).await
    }
}
