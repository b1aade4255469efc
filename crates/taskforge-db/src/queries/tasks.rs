//! Database query functions for the `tasks` and `task_dependencies` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    NewTask, QueueDepth, SortDirection, Task, TaskFilter, TaskPatch, TaskPriority, TaskSortColumn,
    TaskStatus, TaskType,
};

/// Insert a new task row and its dependency edges in one transaction.
/// Returns the inserted task with server-generated defaults applied
/// (id, status = pending, progress = 0, retry_count = 0, created_at).
pub async fn create_task(pool: &PgPool, new_task: NewTask) -> Result<Task> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let row = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks ( \
            task_type, name, description, priority, input, \
            max_retries, timeout_seconds, scheduled_at, \
            created_by_user_id, related_entity_type, related_entity_id, parent_task_id \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING *",
    )
    .bind(new_task.task_type)
    .bind(&new_task.name)
    .bind(&new_task.description)
    .bind(new_task.priority)
    .bind(&new_task.input)
    .bind(new_task.max_retries)
    .bind(new_task.timeout_seconds)
    .bind(new_task.scheduled_at)
    .bind(new_task.created_by_user_id)
    .bind(&new_task.related_entity_type)
    .bind(&new_task.related_entity_id)
    .bind(new_task.parent_task_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert task")?;

    for depends_on in &new_task.depends_on_task_ids {
        sqlx::query(
            "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(row.id)
        .bind(depends_on)
        .execute(&mut *tx)
        .await
        .context("failed to insert task dependency")?;
    }

    tx.commit().await.context("failed to commit new task")?;

    let mut task = row;
    task.depends_on_task_ids = new_task.depends_on_task_ids;
    Ok(task)
}

/// Fetch a single task by id, with its dependency list populated.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let Some(mut task) = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?
    else {
        return Ok(None);
    };

    task.depends_on_task_ids = get_task_dependencies(pool, id).await?;
    Ok(Some(task))
}

/// Get the ids of all tasks that `task_id` depends on.
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Get the statuses of all of `task_id`'s dependencies, for dependency-gating
/// checks in the dispatcher.
pub async fn get_dependency_statuses(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskStatus>> {
    let rows: Vec<(TaskStatus,)> = sqlx::query_as(
        "SELECT dep.status FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = $1",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get dependency statuses")?;

    Ok(rows.into_iter().map(|(s,)| s).collect())
}

/// List tasks matching `filter`.
pub async fn list_tasks(pool: &PgPool, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
    let mut binds: Vec<Bound> = Vec::new();

    if !filter.status.is_empty() {
        sql.push_str(&format!(" AND status = ANY(${})", binds.len() + 1));
        binds.push(Bound::Statuses(filter.status.clone()));
    }
    if !filter.task_type.is_empty() {
        sql.push_str(&format!(" AND task_type = ANY(${})", binds.len() + 1));
        binds.push(Bound::Types(filter.task_type.clone()));
    }
    if !filter.priority.is_empty() {
        sql.push_str(&format!(" AND priority = ANY(${})", binds.len() + 1));
        binds.push(Bound::Priorities(filter.priority.clone()));
    }
    if let Some(user_id) = filter.user_id {
        sql.push_str(&format!(" AND created_by_user_id = ${}", binds.len() + 1));
        binds.push(Bound::Uuid(user_id));
    }
    if let Some(ref related_type) = filter.related_entity_type {
        sql.push_str(&format!(" AND related_entity_type = ${}", binds.len() + 1));
        binds.push(Bound::Text(related_type.clone()));
    }
    if let Some(ref related_id) = filter.related_entity_id {
        sql.push_str(&format!(" AND related_entity_id = ${}", binds.len() + 1));
        binds.push(Bound::Text(related_id.clone()));
    }

    let (column, direction) = filter
        .order_by
        .unwrap_or((TaskSortColumn::CreatedAt, SortDirection::Asc));
    let column_sql = match column {
        TaskSortColumn::CreatedAt => "created_at",
        TaskSortColumn::Priority => "priority",
        TaskSortColumn::Status => "status",
    };
    let direction_sql = match direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    sql.push_str(&format!(" ORDER BY {column_sql} {direction_sql}"));

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = filter.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    let mut query = sqlx::query_as::<_, Task>(&sql);
    for bound in &binds {
        query = match bound {
            Bound::Statuses(v) => query.bind(v),
            Bound::Types(v) => query.bind(v),
            Bound::Priorities(v) => query.bind(v),
            Bound::Uuid(v) => query.bind(v),
            Bound::Text(v) => query.bind(v),
        };
    }

    let mut tasks = query
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    for task in &mut tasks {
        task.depends_on_task_ids = get_task_dependencies(pool, task.id).await?;
    }

    Ok(tasks)
}

/// Owned bind values for the dynamic `list_tasks` query above. `sqlx`'s
/// query builder does not support a heterogeneous bind list directly, so
/// each accepted filter dimension gets its own variant.
enum Bound {
    Statuses(Vec<TaskStatus>),
    Types(Vec<TaskType>),
    Priorities(Vec<TaskPriority>),
    Uuid(Uuid),
    Text(String),
}

/// Pending rows with no future `scheduled_at`, ordered by priority desc then
/// creation time asc. Dependency gating is the dispatcher's job, not the
/// store's: this only returns candidates.
pub async fn ready_to_run(pool: &PgPool) -> Result<Vec<Task>> {
    let mut tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'pending' \
           AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
         ORDER BY \
           CASE priority \
             WHEN 'urgent' THEN 0 \
             WHEN 'high' THEN 1 \
             WHEN 'normal' THEN 2 \
             WHEN 'low' THEN 3 \
           END ASC, \
           created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to fetch ready tasks")?;

    for task in &mut tasks {
        task.depends_on_task_ids = get_task_dependencies(pool, task.id).await?;
    }

    Ok(tasks)
}

/// Count tasks of `task_type` created by `user_id` since `since`, for the
/// rate-limit checks in the policy engine.
pub async fn count_since(
    pool: &PgPool,
    user_id: Uuid,
    task_type: TaskType,
    since: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE created_by_user_id = $1 AND task_type = $2 AND created_at >= $3",
    )
    .bind(user_id)
    .bind(task_type)
    .bind(since)
    .fetch_one(pool)
    .await
    .context("failed to count tasks since timestamp")?;

    Ok(row.0)
}

/// Count tasks of `task_type` belonging to `user_id` currently in
/// {Pending, Running}, for the concurrency check in the policy engine.
/// Rows older than `now - max_age` are excluded when `max_age` is set: a
/// crashed run should not permanently block the user's quota.
pub async fn count_active(
    pool: &PgPool,
    user_id: Uuid,
    task_type: TaskType,
    max_age: Option<chrono::Duration>,
) -> Result<i64> {
    let row: (i64,) = match max_age {
        Some(max_age) => {
            let cutoff = Utc::now() - max_age;
            sqlx::query_as(
                "SELECT COUNT(*) FROM tasks \
                 WHERE created_by_user_id = $1 AND task_type = $2 \
                   AND status IN ('pending', 'running') \
                   AND created_at >= $3",
            )
            .bind(user_id)
            .bind(task_type)
            .bind(cutoff)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_as(
                "SELECT COUNT(*) FROM tasks \
                 WHERE created_by_user_id = $1 AND task_type = $2 \
                   AND status IN ('pending', 'running')",
            )
            .bind(user_id)
            .bind(task_type)
            .fetch_one(pool)
            .await
        }
    }
    .context("failed to count active tasks")?;

    Ok(row.0)
}

/// Queue-depth summary across all task types, for health/status reporting.
pub async fn queue_depth(pool: &PgPool) -> Result<QueueDepth> {
    let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks \
         WHERE status IN ('pending', 'running', 'retry') \
         GROUP BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to compute queue depth")?;

    let mut depth = QueueDepth {
        pending: 0,
        running: 0,
        retry: 0,
    };
    for (status, count) in rows {
        match status {
            TaskStatus::Pending => depth.pending = count,
            TaskStatus::Running => depth.running = count,
            TaskStatus::Retry => depth.retry = count,
            _ => {}
        }
    }
    Ok(depth)
}

/// Apply an externally- or handler-initiated patch to a task row.
///
/// Non-status fields are unconditionally overwritten when `Some`. A status
/// change is additionally guarded by `expected_status` via optimistic
/// locking: the row is only updated if its current status still matches
/// `expected_status`. `started_at`/`completed_at` are derived from the
/// transition per the invariants in the data model, not taken from the
/// caller.
pub async fn apply_patch(
    pool: &PgPool,
    id: Uuid,
    expected_status: TaskStatus,
    patch: &TaskPatch,
) -> Result<u64> {
    let now = Utc::now();
    let new_status = patch.status.unwrap_or(expected_status);

    let started_at_set = matches!(
        (expected_status, new_status),
        (TaskStatus::Pending, TaskStatus::Running)
    );
    let completed_at_set = new_status.is_terminal();

    let result = sqlx::query(
        "UPDATE tasks SET \
            status = $1, \
            progress = COALESCE($2, progress), \
            current_step = CASE WHEN $3 THEN $4 ELSE current_step END, \
            result = CASE WHEN $5 THEN $6 ELSE result END, \
            error_message = CASE WHEN $7 THEN $8 ELSE error_message END, \
            started_at = CASE WHEN $9 THEN $10 ELSE started_at END, \
            completed_at = CASE WHEN $11 THEN $10 ELSE completed_at END \
         WHERE id = $12 AND status = $13",
    )
    .bind(new_status)
    .bind(patch.progress)
    .bind(patch.current_step.is_some())
    .bind(patch.current_step.clone().flatten())
    .bind(patch.result.is_some())
    .bind(patch.result.clone().flatten())
    .bind(patch.error_message.is_some())
    .bind(patch.error_message.clone().flatten())
    .bind(started_at_set)
    .bind(now)
    .bind(completed_at_set)
    .bind(id)
    .bind(expected_status)
    .execute(pool)
    .await
    .context("failed to apply task patch")?;

    Ok(result.rows_affected())
}

/// Retry reset: increments `retry_count`, clears `error_message`,
/// `started_at`, `completed_at`, `current_step`; sets `status = pending`,
/// `progress = 0`. Guarded by optimistic locking on status and retry_count.
pub async fn retry_reset(pool: &PgPool, id: Uuid, current_retry_count: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET \
            status = 'pending', \
            progress = 0, \
            current_step = NULL, \
            error_message = NULL, \
            started_at = NULL, \
            completed_at = NULL, \
            retry_count = retry_count + 1 \
         WHERE id = $1 AND status = 'failed' AND retry_count = $2",
    )
    .bind(id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to reset task for retry")?;

    Ok(result.rows_affected())
}

/// Delete a task row. Rejects rows that are not in a terminal status.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE id = $1 AND status IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to delete task")?;

    Ok(result.rows_affected() > 0)
}

/// Delete every row in a terminal status whose `completed_at` is older
/// than `max_age`. Used by the database-cleanup maintenance task.
pub async fn delete_terminal_older_than(pool: &PgPool, max_age: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - max_age;
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'cancelled') \
           AND completed_at IS NOT NULL AND completed_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to delete old terminal tasks")?;

    Ok(result.rows_affected())
}

/// Count of tasks grouped by type within the last `window`, for report
/// generation.
pub async fn counts_by_type_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<(TaskType, i64)>> {
    let rows: Vec<(TaskType, i64)> = sqlx::query_as(
        "SELECT task_type, COUNT(*) FROM tasks WHERE created_at >= $1 GROUP BY task_type",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to count tasks by type")?;

    Ok(rows)
}

/// Transition every {Pending, Running} row of `task_type` older than
/// `now - max_age` to Failed with `error_message = reason`. Used both by
/// the stale-task reaper and by restart recovery.
pub async fn mark_stale(
    pool: &PgPool,
    task_type: TaskType,
    max_age: chrono::Duration,
    reason: &str,
) -> Result<Vec<Task>> {
    let cutoff = Utc::now() - max_age;
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET \
            status = 'failed', \
            error_message = $1, \
            completed_at = NOW() \
         WHERE task_type = $2 \
           AND status IN ('pending', 'running') \
           AND created_at < $3 \
         RETURNING *",
    )
    .bind(reason)
    .bind(task_type)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to mark stale tasks")?;

    Ok(tasks)
}
