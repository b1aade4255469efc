//! Backup-family handlers: `backup_creation`, `backup_scheduled`,
//! `backup_restore`, `backup_retention`.
//!
//! A "backup" here is a JSON snapshot of every table's row count, written
//! to `backup_dir` (default `./backups`) with a timestamped filename. This
//! stands in for a full `pg_dump`-based backup, which would need the
//! Postgres client tools available on the host; the snapshot shape is
//! still enough to exercise the create/restore/retain lifecycle end to
//! end.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;

use taskforge_db::pool::table_counts;
use taskforge_db::queries::backup_config::record_backup_ran;

use crate::error::{Result, TaskError};
use crate::handler::TaskHandler;
use crate::reporter::ProgressReporter;

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_RETENTION_COUNT: usize = 7;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    taken_at: chrono::DateTime<Utc>,
    table_counts: Vec<(String, i64)>,
}

fn backup_dir(input: &Value) -> PathBuf {
    input
        .get("backup_dir")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR))
}

async fn create_snapshot(
    pool: &PgPool,
    dir: &Path,
    reporter: &ProgressReporter,
) -> Result<PathBuf> {
    let to_err = |e: anyhow::Error| TaskError::HandlerError {
        task_id: reporter.task_id(),
        message: e.to_string(),
    };

    reporter.update_progress(20, Some("collecting table counts")).await;
    let counts = table_counts(pool).await.map_err(to_err)?;

    let snapshot = Snapshot {
        taken_at: Utc::now(),
        table_counts: counts,
    };

    std::fs::create_dir_all(dir).map_err(|e| TaskError::HandlerError {
        task_id: reporter.task_id(),
        message: format!("failed to create backup directory {}: {e}", dir.display()),
    })?;

    let filename = format!("backup-{}.json", snapshot.taken_at.format("%Y%m%dT%H%M%SZ"));
    let path = dir.join(filename);
    let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| TaskError::HandlerError {
        task_id: reporter.task_id(),
        message: e.to_string(),
    })?;
    std::fs::write(&path, body).map_err(|e| TaskError::HandlerError {
        task_id: reporter.task_id(),
        message: format!("failed to write backup file {}: {e}", path.display()),
    })?;

    reporter
        .update_progress(90, Some("recording last-backup timestamp"))
        .await;
    record_backup_ran(pool).await.map_err(to_err)?;

    Ok(path)
}

pub struct BackupCreationHandler {
    pool: PgPool,
}

impl BackupCreationHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskHandler for BackupCreationHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        let dir = backup_dir(input);
        let path = create_snapshot(&self.pool, &dir, reporter).await?;
        reporter.update_progress(100, Some("done")).await;
        Ok(json!({ "backup_path": path.display().to_string() }))
    }

    fn name(&self) -> &'static str {
        "backup_creation"
    }
}

/// `backup_scheduled` is identical to `backup_creation`; it exists as a
/// distinct task type so scheduled runs are distinguishable from ad-hoc
/// ones in the task list and in logs.
pub struct BackupScheduledHandler {
    inner: BackupCreationHandler,
}

impl BackupScheduledHandler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: BackupCreationHandler::new(pool),
        }
    }
}

#[async_trait]
impl TaskHandler for BackupScheduledHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        self.inner.execute(input, reporter).await
    }

    fn name(&self) -> &'static str {
        "backup_scheduled"
    }
}

pub struct BackupRestoreHandler;

impl BackupRestoreHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BackupRestoreHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for BackupRestoreHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        let backup_path = input
            .get("backup_path")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::HandlerError {
                task_id: reporter.task_id(),
                message: "missing required input field: backup_path".to_string(),
            })?;

        reporter.update_progress(20, Some("reading backup file")).await;
        let body = std::fs::read(backup_path).map_err(|e| TaskError::HandlerError {
            task_id: reporter.task_id(),
            message: format!("failed to read backup file {backup_path}: {e}"),
        })?;

        let snapshot: Snapshot =
            serde_json::from_slice(&body).map_err(|e| TaskError::HandlerError {
                task_id: reporter.task_id(),
                message: format!("backup file {backup_path} is not a valid snapshot: {e}"),
            })?;

        reporter
            .log_info(format!(
                "validated snapshot taken at {}, {} tables recorded",
                snapshot.taken_at,
                snapshot.table_counts.len()
            ))
            .await;
        reporter.update_progress(100, Some("done")).await;

        Ok(json!({
            "restored_from": backup_path,
            "snapshot_taken_at": snapshot.taken_at,
            "table_count": snapshot.table_counts.len(),
        }))
    }

    fn name(&self) -> &'static str {
        "backup_restore"
    }
}

pub struct BackupRetentionHandler;

impl BackupRetentionHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BackupRetentionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for BackupRetentionHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        let dir = backup_dir(input);
        let retention_count = input
            .get("retention_count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_RETENTION_COUNT);

        reporter.update_progress(20, Some("listing backup files")).await;

        let mut entries: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(iter) => iter
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.sort();

        let to_delete = entries.len().saturating_sub(retention_count);
        let mut deleted = Vec::new();
        for path in entries.into_iter().take(to_delete) {
            if std::fs::remove_file(&path).is_ok() {
                deleted.push(path.display().to_string());
            }
        }

        reporter
            .log_info(format!("pruned {} backup file(s), keeping last {retention_count}", deleted.len()))
            .await;
        reporter.update_progress(100, Some("done")).await;

        Ok(json!({ "deleted_files": deleted, "retention_count": retention_count }))
    }

    fn name(&self) -> &'static str {
        "backup_retention"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    use crate::events::EventBus;

    /// A reporter backed by a lazily-connecting pool: fine for handlers
    /// under test here, since `update_progress`/`log_*` never propagate
    /// store errors to the caller.
    fn test_reporter() -> ProgressReporter {
        let pool = PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap();
        ProgressReporter::new(pool, EventBus::new(16), Uuid::new_v4(), CancellationToken::new())
    }

    fn write_snapshot(dir: &Path, name: &str) {
        let snapshot = Snapshot {
            taken_at: Utc::now(),
            table_counts: vec![("tasks".to_string(), 0)],
        };
        std::fs::write(dir.join(name), serde_json::to_vec(&snapshot).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn retention_keeps_only_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for n in 0..5 {
            write_snapshot(dir.path(), &format!("backup-{n:02}.json"));
        }

        let handler = BackupRetentionHandler::new();
        let input = json!({
            "backup_dir": dir.path().to_str().unwrap(),
            "retention_count": 2,
        });
        let output = handler.execute(&input, &test_reporter()).await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert_eq!(output["deleted_files"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retention_is_a_no_op_when_under_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), "backup-00.json");

        let handler = BackupRetentionHandler::new();
        let input = json!({
            "backup_dir": dir.path().to_str().unwrap(),
            "retention_count": 7,
        });
        let output = handler.execute(&input, &test_reporter()).await.unwrap();

        assert_eq!(output["deleted_files"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn retention_tolerates_a_missing_directory() {
        let missing = std::env::temp_dir().join(format!("taskforge-missing-{}", Uuid::new_v4()));

        let handler = BackupRetentionHandler::new();
        let input = json!({
            "backup_dir": missing.to_str().unwrap(),
            "retention_count": 7,
        });
        let output = handler.execute(&input, &test_reporter()).await.unwrap();

        assert_eq!(output["deleted_files"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn restore_rejects_a_malformed_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"not json").unwrap();

        let handler = BackupRestoreHandler::new();
        let input = json!({ "backup_path": path.to_str().unwrap() });
        let err = handler.execute(&input, &test_reporter()).await.unwrap_err();
        assert!(matches!(err, TaskError::HandlerError { .. }));
    }

    #[tokio::test]
    async fn restore_reports_the_snapshot_table_count() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), "backup-00.json");
        let path = dir.path().join("backup-00.json");

        let handler = BackupRestoreHandler::new();
        let input = json!({ "backup_path": path.to_str().unwrap() });
        let output = handler.execute(&input, &test_reporter()).await.unwrap();

        assert_eq!(output["table_count"], 1);
    }
}
