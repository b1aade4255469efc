mod db_cmd;
mod serve_cmd;
mod task_cmds;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskforge_core::config::Config;
use taskforge_core::dispatcher::InFlightRegistry;
use taskforge_core::events::EventBus;
use taskforge_core::handlers::{backup, database_cleanup, inventory_audit, reference, report_generation};
use taskforge_core::service::TaskService;
use taskforge_core::{dispatcher, recurring, registry::HandlerRegistry};
use taskforge_db::config::DbConfig;
use taskforge_db::models::{TaskPriority, TaskStatus, TaskType};
use taskforge_db::pool;

#[derive(Parser)]
#[command(name = "taskforge", about = "Background task subsystem for an inventory/parts-management service")]
struct Cli {
    /// Database URL (overrides TASKFORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, the dispatcher, and the recurring scheduler
    Serve,
    /// Initialize the database (create it if missing, then migrate)
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Submit a new task
    Submit {
        /// Task type (e.g. database_cleanup, part_enrichment, backup_creation)
        task_type: TaskType,
        /// Human-readable name
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,
        /// JSON input payload
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long, default_value_t = 3)]
        max_retries: i32,
        #[arg(long)]
        timeout_seconds: Option<i32>,
        #[arg(long)]
        scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
        #[arg(long)]
        related_entity_type: Option<String>,
        #[arg(long)]
        related_entity_id: Option<String>,
        /// Comma-separated task IDs this task depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<Uuid>,
        /// Acting user ID (defaults to a freshly generated UUID)
        #[arg(long)]
        actor: Option<Uuid>,
        /// Comma-separated capabilities held by the acting user
        #[arg(long, value_delimiter = ',', default_value = "tasks:user")]
        capabilities: Vec<String>,
    },
    /// Fetch a task by ID
    Get {
        task_id: String,
    },
    /// List tasks, optionally filtered
    List {
        /// Comma-separated statuses to filter on
        #[arg(long, value_delimiter = ',')]
        status: Vec<TaskStatus>,
        /// Comma-separated task types to filter on
        #[arg(long, value_delimiter = ',')]
        task_type: Vec<TaskType>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Cancel a pending or running task
    Cancel {
        task_id: String,
    },
    /// Reset a failed task back to pending, if retries remain
    Retry {
        task_id: String,
    },
    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create the database if missing and run all migrations
    Init,
    /// Run any pending migrations against an existing database
    Migrate,
}

fn resolve_db_config(cli_database_url: Option<&str>) -> DbConfig {
    match cli_database_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    }
}

fn build_registry(pool: sqlx::PgPool) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(TaskType::DatabaseCleanup, database_cleanup::DatabaseCleanupHandler::new(pool.clone()));
    registry.register(TaskType::InventoryAudit, inventory_audit::InventoryAuditHandler::new(pool.clone()));
    registry.register(TaskType::ReportGeneration, report_generation::ReportGenerationHandler::new(pool.clone()));
    registry.register(TaskType::BackupCreation, backup::BackupCreationHandler::new(pool.clone()));
    registry.register(TaskType::BackupScheduled, backup::BackupScheduledHandler::new(pool.clone()));
    registry.register(TaskType::BackupRestore, backup::BackupRestoreHandler::new());
    registry.register(TaskType::BackupRetention, backup::BackupRetentionHandler::new());

    for task_type in [
        TaskType::PartEnrichment,
        TaskType::BulkEnrichment,
        TaskType::FetchDatasheet,
        TaskType::FetchImage,
        TaskType::FetchPricing,
        TaskType::FetchStock,
        TaskType::FetchSpecifications,
        TaskType::PriceUpdate,
        TaskType::PartValidation,
        TaskType::FileImportEnrichment,
        TaskType::DatasheetDownload,
        TaskType::PrinterDiscovery,
        TaskType::EmailNotification,
    ] {
        registry.register(task_type, reference::ReferenceHandler::new(task_type.as_str()));
    }

    registry
}

/// Run the serve loop: HTTP API, dispatcher, and recurring scheduler share
/// one cancellation tree so Ctrl+C drains in-flight work before exiting.
async fn run_serve_command(db_config: &DbConfig) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db_pool = pool::create_pool(db_config).await?;
    let bus = EventBus::new(config.event_bus_capacity);
    let registry = Arc::new(build_registry(db_pool.clone()));

    let cancel = CancellationToken::new();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    {
        let cancel = cancel.clone();
        let got_first_signal = Arc::clone(&got_first_signal);
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                if got_first_signal.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
                cancel.cancel();
            }
        });
    }

    let in_flight = InFlightRegistry::new();

    let dispatcher_handle = tokio::spawn(dispatcher::run_dispatcher(
        db_pool.clone(),
        bus.clone(),
        registry,
        config.dispatcher.clone(),
        cancel.child_token(),
        in_flight.clone(),
    ));

    let scheduler_service = TaskService::new(db_pool.clone(), bus.clone(), in_flight.clone());
    let mut scheduler = recurring::start_scheduler(scheduler_service).await?;

    let serve_result = serve_cmd::run_serve(
        db_pool.clone(),
        bus.clone(),
        in_flight,
        config.http_bind_addr,
        cancel.child_token(),
    )
    .await;

    cancel.cancel();
    let _ = scheduler.shutdown().await;
    dispatcher_handle
        .await
        .context("dispatcher task panicked")??;

    db_pool.close().await;
    serve_result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            return Ok(());
        }
        Commands::Db { command } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            match command {
                DbCommands::Init => db_cmd::run_db_init(&db_config).await?,
                DbCommands::Migrate => db_cmd::run_db_migrate(&db_config).await?,
            }
        }
        Commands::Serve => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            run_serve_command(&db_config).await?;
        }
        Commands::Submit {
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
            depends_on,
            actor,
            capabilities,
        } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let result = task_cmds::run_submit(
                &db_pool,
                actor.unwrap_or_else(Uuid::new_v4),
                capabilities.into_iter().collect(),
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
                depends_on,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Get { task_id } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let result = task_cmds::run_get(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::List {
            status,
            task_type,
            limit,
            offset,
        } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let result = task_cmds::run_list(&db_pool, status, task_type, limit, offset).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cancel { task_id } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let result = task_cmds::run_cancel(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Retry { task_id } => {
            let db_config = resolve_db_config(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&db_config).await?;
            let result = task_cmds::run_retry(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
