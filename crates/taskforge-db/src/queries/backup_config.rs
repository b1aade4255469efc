//! Database query functions for the singleton `backup_config` row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::BackupConfig;

/// Fetch the singleton backup configuration, inserting the default row if
/// it has never been written (first boot).
pub async fn get_or_init_backup_config(pool: &PgPool) -> Result<BackupConfig> {
    if let Some(config) = sqlx::query_as::<_, BackupConfig>(
        "SELECT * FROM backup_config WHERE id = $1",
    )
    .bind(BackupConfig::SINGLETON_ID)
    .fetch_optional(pool)
    .await
    .context("failed to fetch backup config")?
    {
        return Ok(config);
    }

    let config = sqlx::query_as::<_, BackupConfig>(
        "INSERT INTO backup_config (id, schedule_enabled, schedule_type, retention_count, encryption_required) \
         VALUES ($1, false, 'nightly', 7, false) \
         ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id \
         RETURNING *",
    )
    .bind(BackupConfig::SINGLETON_ID)
    .fetch_one(pool)
    .await
    .context("failed to initialize default backup config")?;

    Ok(config)
}

/// Overwrite the mutable fields of the singleton backup configuration.
/// Only the Façade calls this; the Recurring Scheduler only ever reads.
pub async fn update_backup_config(
    pool: &PgPool,
    schedule_enabled: bool,
    schedule_type: crate::models::BackupScheduleType,
    cron_expression: Option<&str>,
    retention_count: i32,
    encryption_required: bool,
    encryption_password: Option<&str>,
) -> Result<BackupConfig> {
    let config = sqlx::query_as::<_, BackupConfig>(
        "UPDATE backup_config SET \
            schedule_enabled = $1, \
            schedule_type = $2, \
            cron_expression = $3, \
            retention_count = $4, \
            encryption_required = $5, \
            encryption_password = $6 \
         WHERE id = $7 \
         RETURNING *",
    )
    .bind(schedule_enabled)
    .bind(schedule_type)
    .bind(cron_expression)
    .bind(retention_count)
    .bind(encryption_required)
    .bind(encryption_password)
    .bind(BackupConfig::SINGLETON_ID)
    .fetch_one(pool)
    .await
    .context("failed to update backup config")?;

    Ok(config)
}

/// Set `next_backup_at` without touching any other field. Used by the
/// Recurring Scheduler after it submits a scheduled-backup task, so the
/// next due-check doesn't resubmit until the newly computed occurrence.
pub async fn set_next_backup_at(pool: &PgPool, next_backup_at: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query("UPDATE backup_config SET next_backup_at = $1 WHERE id = $2")
        .bind(next_backup_at)
        .bind(BackupConfig::SINGLETON_ID)
        .execute(pool)
        .await
        .context("failed to set next backup time")?;

    Ok(())
}

/// Record that a backup just ran, advancing `last_backup_at`.
/// `next_backup_at` is a separate concern, owned by the Recurring
/// Scheduler via [`set_next_backup_at`].
pub async fn record_backup_ran(pool: &PgPool) -> Result<()> {
    sqlx::query("UPDATE backup_config SET last_backup_at = NOW() WHERE id = $1")
        .bind(BackupConfig::SINGLETON_ID)
        .execute(pool)
        .await
        .context("failed to record backup run")?;

    Ok(())
}
