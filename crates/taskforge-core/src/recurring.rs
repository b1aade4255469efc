//! Recurring scheduler: submits backup and retention tasks on a cron
//! cadence, driven by the `backup_config` singleton row.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use tokio_cron_scheduler::{Job, JobScheduler};

use taskforge_db::models::{BackupScheduleType, TaskPriority, TaskType};
use taskforge_db::queries::backup_config::{get_or_init_backup_config, set_next_backup_at};

use crate::service::{system_capabilities, SubmitRequest, TaskService, SYSTEM_ACTOR};

/// Fixed cron expression for the nightly backup-retention sweep. Not
/// configurable: retention cleanup runs regardless of the backup schedule
/// itself, so a stale `backup_config` row never leaves old backups
/// unpruned.
const RETENTION_CRON: &str = "0 0 3 * * *";

/// Start the recurring scheduler. The returned [`JobScheduler`] must be
/// kept alive (and started) for as long as recurring jobs should fire;
/// dropping it stops scheduling. Submissions go through `service`, with a
/// system actor, so the same policy/audit path applies as for user-submitted
/// tasks.
pub async fn start_scheduler(service: TaskService) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let backup_service = service.clone();
    let backup_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let service = backup_service.clone();
        Box::pin(async move {
            if let Err(err) = maybe_submit_scheduled_backup(&service).await {
                tracing::error!(error = %err, "failed to evaluate scheduled backup cadence");
            }
        })
    })?;
    scheduler.add(backup_job).await?;

    let retention_service = service.clone();
    let retention_job = Job::new_async(RETENTION_CRON, move |_uuid, _l| {
        let service = retention_service.clone();
        Box::pin(async move {
            if let Err(err) = submit_retention_task(&service).await {
                tracing::error!(error = %err, "failed to submit backup retention task");
            }
        })
    })?;
    scheduler.add(retention_job).await?;

    scheduler.start().await?;
    Ok(scheduler)
}

/// Checked hourly: submit a `backup_scheduled` task if the configured
/// cadence says one is due.
async fn maybe_submit_scheduled_backup(service: &TaskService) -> anyhow::Result<()> {
    let pool = service.pool();
    let config = get_or_init_backup_config(pool).await?;
    if !config.schedule_enabled {
        return Ok(());
    }

    let due = match config.next_backup_at {
        Some(next) => Utc::now() >= next,
        None => true,
    };
    if !due {
        return Ok(());
    }

    tracing::info!(
        schedule_type = %config.schedule_type,
        "submitting scheduled backup task"
    );

    service
        .submit(
            SYSTEM_ACTOR,
            &system_capabilities(),
            SubmitRequest {
                task_type: TaskType::BackupScheduled,
                name: "Scheduled backup".to_string(),
                description: Some(format!("Automatic {} backup", config.schedule_type)),
                priority: TaskPriority::High,
                input: serde_json::json!({ "schedule_type": config.schedule_type.to_string() }),
                max_retries: 2,
                timeout_seconds: Some(3600),
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await?;

    let now = Utc::now();
    let next = compute_next_backup_at(config.schedule_type, config.cron_expression.as_deref(), now);
    set_next_backup_at(pool, next).await?;

    Ok(())
}

/// Run nightly at 03:00: submit a `backup_retention` task to prune old
/// backups down to the configured retention count.
async fn submit_retention_task(service: &TaskService) -> anyhow::Result<()> {
    let config = get_or_init_backup_config(service.pool()).await?;

    tracing::info!(retention_count = config.retention_count, "submitting backup retention task");

    service
        .submit(
            SYSTEM_ACTOR,
            &system_capabilities(),
            SubmitRequest {
                task_type: TaskType::BackupRetention,
                name: "Backup retention sweep".to_string(),
                description: Some(format!(
                    "Prune backups beyond the last {} retained",
                    config.retention_count
                )),
                priority: TaskPriority::Low,
                input: serde_json::json!({ "retention_count": config.retention_count }),
                max_retries: 1,
                timeout_seconds: Some(900),
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await?;

    Ok(())
}

/// Compute a schedule's next occurrence strictly after `after`. Nightly and
/// weekly are fixed cron triggers (`0 2 * * *` / `0 2 * * 0`); custom uses
/// the operator-supplied expression. Returns `None` if the expression can't
/// be parsed or has no future occurrence.
pub fn compute_next_backup_at(
    schedule_type: BackupScheduleType,
    cron_expression: Option<&str>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let expr = match schedule_type {
        BackupScheduleType::Nightly => "0 0 2 * * *",
        BackupScheduleType::Weekly => "0 0 2 * * Sun",
        BackupScheduleType::Custom => cron_expression?,
    };
    let schedule = cron::Schedule::from_str(expr).ok()?;
    schedule.after(&after).next()
}

/// Used by the Façade when an operator changes the backup schedule type to
/// `Custom`: validates the provided cron expression parses, without
/// actually scheduling it (custom cadences are still evaluated through the
/// hourly `maybe_submit_scheduled_backup` check against `next_backup_at`).
pub fn validate_cron_expression(expr: &str) -> anyhow::Result<()> {
    // tokio-cron-scheduler validates lazily on `Job::new`; constructing and
    // discarding a job is the cheapest way to reuse that validation here.
    let _ = Job::new(expr, |_uuid, _l| {})?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_cron_expression_is_accepted() {
        assert!(validate_cron_expression("0 0 2 * * *").is_ok());
    }

    #[test]
    fn garbage_cron_expression_is_rejected() {
        assert!(validate_cron_expression("not a cron expression").is_err());
    }

    #[test]
    fn nightly_next_occurrence_is_tomorrow_0200() {
        let after = chrono::DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_backup_at(BackupScheduleType::Nightly, None, after).unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-16 02:00:00");
    }

    #[test]
    fn weekly_next_occurrence_is_next_sunday_0200() {
        let after = chrono::DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z") // a Thursday
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_backup_at(BackupScheduleType::Weekly, None, after).unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-18 02:00:00");
    }

    #[test]
    fn custom_with_no_expression_has_no_next_occurrence() {
        assert!(compute_next_backup_at(BackupScheduleType::Custom, None, Utc::now()).is_none());
    }

    #[test]
    fn custom_uses_the_supplied_expression() {
        let after = chrono::DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_backup_at(BackupScheduleType::Custom, Some("0 30 4 * * *"), after).unwrap();
        assert_eq!(next.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-16 04:30:00");
    }
}
