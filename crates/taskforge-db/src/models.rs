use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retry,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retry" => Ok(Self::Retry),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

impl TaskStatus {
    /// Terminal statuses are stable until the row is deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Dispatch priority. Higher variants are dispatched ahead of lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Closed set of task types the subsystem knows how to dispatch.
///
/// Wire/DB representation matches the exact strings used across the
/// submit API; see `TaskType::as_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PartEnrichment,
    BulkEnrichment,
    FetchDatasheet,
    FetchImage,
    FetchPricing,
    FetchStock,
    FetchSpecifications,
    PriceUpdate,
    DatabaseCleanup,
    InventoryAudit,
    PartValidation,
    FileImportEnrichment,
    BackupCreation,
    BackupRestore,
    BackupScheduled,
    BackupRetention,
    DatasheetDownload,
    PrinterDiscovery,
    EmailNotification,
    ReportGeneration,
}

impl TaskType {
    pub const ALL: &'static [TaskType] = &[
        Self::PartEnrichment,
        Self::BulkEnrichment,
        Self::FetchDatasheet,
        Self::FetchImage,
        Self::FetchPricing,
        Self::FetchStock,
        Self::FetchSpecifications,
        Self::PriceUpdate,
        Self::DatabaseCleanup,
        Self::InventoryAudit,
        Self::PartValidation,
        Self::FileImportEnrichment,
        Self::BackupCreation,
        Self::BackupRestore,
        Self::BackupScheduled,
        Self::BackupRetention,
        Self::DatasheetDownload,
        Self::PrinterDiscovery,
        Self::EmailNotification,
        Self::ReportGeneration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PartEnrichment => "part_enrichment",
            Self::BulkEnrichment => "bulk_enrichment",
            Self::FetchDatasheet => "fetch_datasheet",
            Self::FetchImage => "fetch_image",
            Self::FetchPricing => "fetch_pricing",
            Self::FetchStock => "fetch_stock",
            Self::FetchSpecifications => "fetch_specifications",
            Self::PriceUpdate => "price_update",
            Self::DatabaseCleanup => "database_cleanup",
            Self::InventoryAudit => "inventory_audit",
            Self::PartValidation => "part_validation",
            Self::FileImportEnrichment => "file_import_enrichment",
            Self::BackupCreation => "backup_creation",
            Self::BackupRestore => "backup_restore",
            Self::BackupScheduled => "backup_scheduled",
            Self::BackupRetention => "backup_retention",
            Self::DatasheetDownload => "datasheet_download",
            Self::PrinterDiscovery => "printer_discovery",
            Self::EmailNotification => "email_notification",
            Self::ReportGeneration => "report_generation",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TaskTypeParseError(s.to_owned()))
    }
}

#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Security level a policy row is defined at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    System,
    User,
    PowerUser,
    Admin,
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::PowerUser => "power_user",
            Self::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Risk class a policy row is defined at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// How a scheduled backup's cadence is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackupScheduleType {
    Nightly,
    Weekly,
    Custom,
}

impl fmt::Display for BackupScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nightly => "nightly",
            Self::Weekly => "weekly",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupScheduleType {
    type Err = BackupScheduleTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nightly" => Ok(Self::Nightly),
            "weekly" => Ok(Self::Weekly),
            "custom" => Ok(Self::Custom),
            other => Err(BackupScheduleTypeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupScheduleTypeParseError(pub String);

impl fmt::Display for BackupScheduleTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backup schedule type: {:?}", self.0)
    }
}

impl std::error::Error for BackupScheduleTypeParseError {}

/// Severity of a task log line published on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A background task row, as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub name: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: i32,
    pub current_step: Option<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub max_retries: i32,
    pub retry_count: i32,
    pub timeout_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by_user_id: Option<Uuid>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    /// Materialized from the `task_dependencies` join table; not a real column.
    #[sqlx(skip)]
    pub depends_on_task_ids: Vec<Uuid>,
}

impl Task {
    /// Whether every dependency in `depends_on_task_ids` has a Completed status,
    /// given the statuses of those dependencies.
    pub fn dependencies_satisfied(&self, dependency_statuses: &[TaskStatus]) -> bool {
        dependency_statuses
            .iter()
            .all(|s| matches!(s, TaskStatus::Completed))
    }
}

/// One row of the `task_dependencies` join table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// Row-count summary used by the dispatcher and the Façade's status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub running: i64,
    pub retry: i64,
}

/// The singleton backup configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupConfig {
    pub id: i32,
    pub schedule_enabled: bool,
    pub schedule_type: BackupScheduleType,
    pub cron_expression: Option<String>,
    pub retention_count: i32,
    pub encryption_required: bool,
    pub encryption_password: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub next_backup_at: Option<DateTime<Utc>>,
}

impl BackupConfig {
    pub const SINGLETON_ID: i32 = 1;
}

// ---------------------------------------------------------------------------
// Request/patch shapes at the store boundary
// ---------------------------------------------------------------------------

/// Fields needed to insert a new task row. Server-assigned fields (id,
/// status, progress, retry_count, created_at) are not part of this shape.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub name: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub input: serde_json::Value,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by_user_id: Option<Uuid>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub depends_on_task_ids: Vec<Uuid>,
}

/// Fields an external caller (the Façade) is permitted to patch on an
/// existing row. Handler-initiated patches go through the same shape but
/// are only ever issued by the Reporter.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub current_step: Option<Option<String>>,
    pub result: Option<Option<serde_json::Value>>,
    pub error_message: Option<Option<String>>,
}

/// Direction for `TaskFilter::order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Column `TaskFilter` may sort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSortColumn {
    CreatedAt,
    Priority,
    Status,
}

/// Filter shape accepted by `TaskStore::list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Vec<TaskStatus>,
    pub task_type: Vec<TaskType>,
    pub priority: Vec<TaskPriority>,
    pub user_id: Option<Uuid>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order_by: Option<(TaskSortColumn, SortDirection)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrips_through_from_str() {
        for (status, text) in [
            (TaskStatus::Pending, "pending"),
            (TaskStatus::Running, "running"),
            (TaskStatus::Completed, "completed"),
            (TaskStatus::Failed, "failed"),
            (TaskStatus::Cancelled, "cancelled"),
            (TaskStatus::Retry, "retry"),
        ] {
            assert_eq!(status.to_string(), text);
            assert_eq!(TaskStatus::from_str(text).unwrap(), status);
        }
    }

    #[test]
    fn task_status_rejects_unknown_strings() {
        assert!(TaskStatus::from_str("bogus").is_err());
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn task_priority_orders_low_to_urgent() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
    }

    #[test]
    fn task_type_roundtrips_every_variant() {
        for t in TaskType::ALL {
            let s = t.as_str();
            assert_eq!(TaskType::from_str(s).unwrap(), *t);
        }
    }

    #[test]
    fn task_type_rejects_legacy_aliases() {
        // `specifications_fetch` is a historical alias that never made it
        // into the wire enumeration; only `fetch_specifications` is valid.
        assert!(TaskType::from_str("specifications_fetch").is_err());
    }

    #[test]
    fn backup_schedule_type_roundtrips() {
        for (v, s) in [
            (BackupScheduleType::Nightly, "nightly"),
            (BackupScheduleType::Weekly, "weekly"),
            (BackupScheduleType::Custom, "custom"),
        ] {
            assert_eq!(v.to_string(), s);
            assert_eq!(BackupScheduleType::from_str(s).unwrap(), v);
        }
    }
}
