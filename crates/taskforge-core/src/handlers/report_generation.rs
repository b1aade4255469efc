//! `report_generation`: produces a JSON summary of task-subsystem activity
//! over a caller-specified window (default 24h).

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;

use taskforge_db::models::TaskType;
use taskforge_db::queries::tasks::{counts_by_type_since, queue_depth};

use crate::error::{Result, TaskError};
use crate::handler::TaskHandler;
use crate::reporter::ProgressReporter;

const DEFAULT_WINDOW_HOURS: i64 = 24;

pub struct ReportGenerationHandler {
    pool: PgPool,
}

impl ReportGenerationHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskHandler for ReportGenerationHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        let window_hours = input
            .get("window_hours")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_WINDOW_HOURS);

        let to_err = |e: anyhow::Error| TaskError::HandlerError {
            task_id: reporter.task_id(),
            message: e.to_string(),
        };

        reporter.update_progress(30, Some("computing queue depth")).await;
        let depth = queue_depth(&self.pool).await.map_err(to_err)?;

        reporter.update_progress(70, Some("counting submissions")).await;
        let since = Utc::now() - chrono::Duration::hours(window_hours);
        let counts = counts_by_type_since(&self.pool, since).await.map_err(to_err)?;

        let by_type: serde_json::Map<String, Value> = counts
            .into_iter()
            .map(|(t, n): (TaskType, i64)| (t.as_str().to_string(), json!(n)))
            .collect();

        reporter.update_progress(100, Some("done")).await;

        Ok(json!({
            "generated_at": Utc::now(),
            "window_hours": window_hours,
            "queue_depth": {
                "pending": depth.pending,
                "running": depth.running,
                "retry": depth.retry,
            },
            "submissions_by_type": by_type,
        }))
    }

    fn name(&self) -> &'static str {
        "report_generation"
    }
}
