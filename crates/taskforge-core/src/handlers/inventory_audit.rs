//! `inventory_audit`: audits the task subsystem's own queue health as a
//! stand-in for a full inventory audit, which would otherwise delegate to
//! an external parts/inventory service this crate does not own.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;

use taskforge_db::models::TaskType;
use taskforge_db::queries::tasks::{counts_by_type_since, queue_depth};

use crate::error::{Result, TaskError};
use crate::handler::TaskHandler;
use crate::reporter::ProgressReporter;

pub struct InventoryAuditHandler {
    pool: PgPool,
}

impl InventoryAuditHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskHandler for InventoryAuditHandler {
    async fn execute(&self, _input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        reporter.update_progress(20, Some("computing queue depth")).await;

        let depth = queue_depth(&self.pool).await.map_err(|e| TaskError::HandlerError {
            task_id: reporter.task_id(),
            message: e.to_string(),
        })?;

        reporter.update_progress(60, Some("counting submissions by type")).await;

        let since = Utc::now() - chrono::Duration::hours(24);
        let counts = counts_by_type_since(&self.pool, since)
            .await
            .map_err(|e| TaskError::HandlerError {
                task_id: reporter.task_id(),
                message: e.to_string(),
            })?;

        let by_type: serde_json::Map<String, Value> = counts
            .into_iter()
            .map(|(t, n): (TaskType, i64)| (t.as_str().to_string(), json!(n)))
            .collect();

        reporter.update_progress(100, Some("done")).await;

        Ok(json!({
            "queue_depth": {
                "pending": depth.pending,
                "running": depth.running,
                "retry": depth.retry,
            },
            "submissions_last_24h_by_type": by_type,
        }))
    }

    fn name(&self) -> &'static str {
        "inventory_audit"
    }
}
