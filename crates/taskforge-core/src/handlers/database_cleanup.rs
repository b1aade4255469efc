//! `database_cleanup`: deletes terminal task rows past their retention
//! window, so the `tasks` table does not grow without bound.

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::PgPool;

use taskforge_db::queries::tasks::delete_terminal_older_than;

use crate::error::{Result, TaskError};
use crate::handler::TaskHandler;
use crate::reporter::ProgressReporter;

const DEFAULT_RETENTION_DAYS: i64 = 30;

pub struct DatabaseCleanupHandler {
    pool: PgPool,
}

impl DatabaseCleanupHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskHandler for DatabaseCleanupHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        let retention_days = input
            .get("retention_days")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        reporter
            .update_progress(10, Some("scanning terminal tasks"))
            .await;

        let max_age = chrono::Duration::days(retention_days);
        let deleted = delete_terminal_older_than(&self.pool, max_age)
            .await
            .map_err(|e| TaskError::HandlerError {
                task_id: reporter.task_id(),
                message: e.to_string(),
            })?;

        reporter
            .log_info(format!("deleted {deleted} terminal task rows older than {retention_days}d"))
            .await;
        reporter.update_progress(100, Some("done")).await;

        Ok(json!({ "deleted_rows": deleted, "retention_days": retention_days }))
    }

    fn name(&self) -> &'static str {
        "database_cleanup"
    }
}
