//! `taskforge submit` / `get` / `list` / `cancel` / `retry`: thin CLI
//! wrappers around [`taskforge_core::service::TaskService`].

use std::collections::HashSet;

use anyhow::Context;
use sqlx::PgPool;
use uuid::Uuid;

use taskforge_core::dispatcher::InFlightRegistry;
use taskforge_core::events::EventBus;
use taskforge_core::service::{SubmitRequest, TaskService};
use taskforge_db::models::{TaskFilter, TaskPriority, TaskStatus, TaskType};

#[allow(clippy::too_many_arguments)]
pub async fn run_submit(
    pool: &PgPool,
    actor: Uuid,
    actor_capabilities: HashSet<String>,
    task_type: TaskType,
    name: String,
    description: Option<String>,
    priority: TaskPriority,
    input: serde_json::Value,
    max_retries: i32,
    timeout_seconds: Option<i32>,
    scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    related_entity_type: Option<String>,
    related_entity_id: Option<String>,
    depends_on_task_ids: Vec<Uuid>,
) -> anyhow::Result<()> {
    let service = TaskService::new(pool.clone(), EventBus::default(), InFlightRegistry::new());

    let task = service
        .submit(
            actor,
            &actor_capabilities,
            SubmitRequest {
                task_type,
                name,
                description,
                priority,
                input,
                max_retries,
                timeout_seconds,
                scheduled_at,
                related_entity_type,
                related_entity_id,
                depends_on_task_ids,
            },
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

pub async fn run_get(pool: &PgPool, task_id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    let service = TaskService::new(pool.clone(), EventBus::default(), InFlightRegistry::new());
    let task = service.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_list(
    pool: &PgPool,
    status: Vec<TaskStatus>,
    task_type: Vec<TaskType>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> anyhow::Result<()> {
    let service = TaskService::new(pool.clone(), EventBus::default(), InFlightRegistry::new());
    let filter = TaskFilter {
        status,
        task_type,
        limit,
        offset,
        ..Default::default()
    };
    let tasks = service.list(filter).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

pub async fn run_cancel(pool: &PgPool, task_id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    let service = TaskService::new(pool.clone(), EventBus::default(), InFlightRegistry::new());
    let task = service.cancel(id).await?;
    println!("Task {} cancelled.", task.id);
    Ok(())
}

pub async fn run_retry(pool: &PgPool, task_id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    let service = TaskService::new(pool.clone(), EventBus::default(), InFlightRegistry::new());
    let task = service.retry(id).await?;
    println!("Task {} reset to pending for retry.", task.id);
    Ok(())
}
