//! End-to-end scenarios run against a real Postgres database: a submission
//! denied by the rate limit, a handler that overruns its timeout, a task
//! gated on an unfinished dependency, and a running task cancelled through
//! the Façade.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskforge_core::dispatcher::{self, DispatcherConfig, InFlightRegistry};
use taskforge_core::error::Result as TaskResult;
use taskforge_core::events::EventBus;
use taskforge_core::handler::TaskHandler;
use taskforge_core::policy;
use taskforge_core::registry::HandlerRegistry;
use taskforge_core::reporter::ProgressReporter;
use taskforge_core::service::{SubmitRequest, TaskService};
use taskforge_db::models::{NewTask, Task, TaskPriority, TaskStatus, TaskType};
use taskforge_db::queries::tasks as db;
use taskforge_test_utils::{create_test_db, drop_test_db};

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

/// Completes immediately, ignoring `input`.
struct ImmediateHandler;

#[async_trait]
impl TaskHandler for ImmediateHandler {
    async fn execute(&self, _input: &Value, _reporter: &ProgressReporter) -> TaskResult<Value> {
        Ok(json!({ "done": true }))
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}

/// Sleeps for a fixed duration before completing. Used to exercise the
/// timeout path (sleep longer than the task's timeout) and the
/// cancellation path (sleep longer than the test, then get cancelled).
struct SleepHandler {
    sleep_for: Duration,
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, _input: &Value, _reporter: &ProgressReporter) -> TaskResult<Value> {
        tokio::time::sleep(self.sleep_for).await;
        Ok(json!({ "slept": true }))
    }

    fn name(&self) -> &'static str {
        "sleep"
    }
}

fn test_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(50),
        idle_backoff: Duration::from_millis(50),
        max_concurrency: 4,
        default_task_timeout: Duration::from_secs(60),
        cancel_grace: Duration::from_millis(200),
        stale_sweep_interval: Duration::from_secs(600),
    }
}

fn caps(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn wait_for_status(service: &TaskService, task_id: Uuid, want: TaskStatus) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = service.get(task_id).await.unwrap();
        if task.status == want {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for task {task_id} to reach {want}, last seen {}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// S1: rate-limit denial
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_actor_is_denied_past_the_hourly_cap() {
    let (pool, db_name) = create_test_db().await;
    let actor = Uuid::new_v4();
    let actor_caps = caps(&["parts:write", "pricing:update", "tasks:power_user"]);

    // PriceUpdate allows 5/hour; seed exactly that many prior submissions.
    for _ in 0..5 {
        db::create_task(
            &pool,
            NewTask {
                task_type: TaskType::PriceUpdate,
                name: "price update".to_string(),
                description: None,
                priority: TaskPriority::Normal,
                input: json!({}),
                max_retries: 1,
                timeout_seconds: None,
                scheduled_at: None,
                created_by_user_id: Some(actor),
                related_entity_type: None,
                related_entity_id: None,
                parent_task_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await
        .unwrap();
    }

    let decision = policy::evaluate(&pool, actor, &actor_caps, TaskType::PriceUpdate, &json!({}))
        .await
        .unwrap();

    let denial = decision.expect_err("the 6th submission within the hour should be denied");
    assert!(denial.0.contains("Hourly rate limit exceeded (5/5)"), "unexpected message: {}", denial.0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S3: handler timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handler_that_overruns_its_timeout_fails_with_the_timeout_message() {
    let (pool, db_name) = create_test_db().await;
    let bus = EventBus::new(16);
    let in_flight = InFlightRegistry::new();

    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskType::FetchSpecifications,
        SleepHandler {
            sleep_for: Duration::from_secs(5),
        },
    );
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher::run_dispatcher(
        pool.clone(),
        bus.clone(),
        registry,
        test_dispatcher_config(),
        cancel.child_token(),
        in_flight.clone(),
    ));

    let service = TaskService::new(pool.clone(), bus.clone(), in_flight.clone());
    let task = service
        .submit(
            Uuid::new_v4(),
            &caps(&["tasks:user"]),
            SubmitRequest {
                task_type: TaskType::FetchSpecifications,
                name: "slow fetch".to_string(),
                description: None,
                priority: TaskPriority::Normal,
                input: json!({}),
                max_retries: 1,
                timeout_seconds: Some(1),
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await
        .unwrap();

    let failed = wait_for_status(&service, task.id, TaskStatus::Failed).await;
    let message = failed.error_message.expect("a failed task carries an error message");
    assert!(message.contains("timed out after 1s"), "unexpected message: {message}");

    cancel.cancel();
    dispatcher_handle.await.unwrap().unwrap();
    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S4: dependency gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependent_task_waits_for_its_dependency_to_complete() {
    let (pool, db_name) = create_test_db().await;
    let bus = EventBus::new(16);
    let in_flight = InFlightRegistry::new();

    let mut registry = HandlerRegistry::new();
    registry.register(TaskType::FetchImage, ImmediateHandler);
    registry.register(TaskType::FetchStock, ImmediateHandler);
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher::run_dispatcher(
        pool.clone(),
        bus.clone(),
        registry,
        test_dispatcher_config(),
        cancel.child_token(),
        in_flight.clone(),
    ));

    let service = TaskService::new(pool.clone(), bus.clone(), in_flight.clone());
    let actor_caps = caps(&["tasks:user"]);

    let parent = service
        .submit(
            Uuid::new_v4(),
            &actor_caps,
            SubmitRequest {
                task_type: TaskType::FetchImage,
                name: "parent".to_string(),
                description: None,
                priority: TaskPriority::Normal,
                input: json!({}),
                max_retries: 1,
                timeout_seconds: None,
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await
        .unwrap();

    let dependent = service
        .submit(
            Uuid::new_v4(),
            &actor_caps,
            SubmitRequest {
                task_type: TaskType::FetchStock,
                name: "dependent".to_string(),
                description: None,
                priority: TaskPriority::Normal,
                input: json!({}),
                max_retries: 1,
                timeout_seconds: None,
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: vec![parent.id],
            },
        )
        .await
        .unwrap();

    wait_for_status(&service, parent.id, TaskStatus::Completed).await;
    let dependent_after_parent = wait_for_status(&service, dependent.id, TaskStatus::Completed).await;
    assert_eq!(dependent_after_parent.status, TaskStatus::Completed);

    cancel.cancel();
    dispatcher_handle.await.unwrap().unwrap();
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dependent_task_stays_pending_while_its_dependency_is_unfinished() {
    let (pool, db_name) = create_test_db().await;

    let actor = Uuid::new_v4();
    let parent = db::create_task(
        &pool,
        NewTask {
            task_type: TaskType::FetchImage,
            name: "parent".to_string(),
            description: None,
            priority: TaskPriority::Normal,
            input: json!({}),
            max_retries: 1,
            timeout_seconds: None,
            scheduled_at: None,
            created_by_user_id: Some(actor),
            related_entity_type: None,
            related_entity_id: None,
            parent_task_id: None,
            depends_on_task_ids: Vec::new(),
        },
    )
    .await
    .unwrap();

    let dependent = db::create_task(
        &pool,
        NewTask {
            task_type: TaskType::FetchStock,
            name: "dependent".to_string(),
            description: None,
            priority: TaskPriority::Normal,
            input: json!({}),
            max_retries: 1,
            timeout_seconds: None,
            scheduled_at: None,
            created_by_user_id: Some(actor),
            related_entity_type: None,
            related_entity_id: None,
            parent_task_id: None,
            depends_on_task_ids: vec![parent.id],
        },
    )
    .await
    .unwrap();

    let dep_statuses = db::get_dependency_statuses(&pool, dependent.id).await.unwrap();
    assert_eq!(dep_statuses, vec![TaskStatus::Pending]);
    assert!(!dependent.dependencies_satisfied(&dep_statuses));

    // `ready_to_run` only filters on status/schedule; dependency gating is
    // the dispatcher's job, checked separately per candidate.
    let ready = db::ready_to_run(&pool).await.unwrap();
    assert!(ready.iter().any(|t| t.id == dependent.id));

    let patch = taskforge_db::models::TaskPatch {
        status: Some(TaskStatus::Completed),
        progress: Some(100),
        ..Default::default()
    };
    db::apply_patch(&pool, parent.id, TaskStatus::Pending, &patch).await.unwrap();

    let dep_statuses = db::get_dependency_statuses(&pool, dependent.id).await.unwrap();
    assert_eq!(dep_statuses, vec![TaskStatus::Completed]);
    assert!(dependent.dependencies_satisfied(&dep_statuses));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// S6: cancellation reaches a running handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_running_task_stops_the_handler_promptly() {
    let (pool, db_name) = create_test_db().await;
    let bus = EventBus::new(16);
    let in_flight = InFlightRegistry::new();

    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskType::PartValidation,
        SleepHandler {
            sleep_for: Duration::from_secs(30),
        },
    );
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher::run_dispatcher(
        pool.clone(),
        bus.clone(),
        registry,
        test_dispatcher_config(),
        cancel.child_token(),
        in_flight.clone(),
    ));

    let service = TaskService::new(pool.clone(), bus.clone(), in_flight.clone());
    let task = service
        .submit(
            Uuid::new_v4(),
            &caps(&["tasks:user"]),
            SubmitRequest {
                task_type: TaskType::PartValidation,
                name: "long validation".to_string(),
                description: None,
                priority: TaskPriority::Normal,
                input: json!({}),
                max_retries: 1,
                timeout_seconds: None,
                scheduled_at: None,
                related_entity_type: None,
                related_entity_id: None,
                depends_on_task_ids: Vec::new(),
            },
        )
        .await
        .unwrap();

    wait_for_status(&service, task.id, TaskStatus::Running).await;

    let cancelled = service.cancel(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let final_task = wait_for_status(&service, task.id, TaskStatus::Cancelled).await;
    assert_eq!(final_task.current_step.as_deref(), Some("cancelled by user"));

    cancel.cancel();
    dispatcher_handle.await.unwrap().unwrap();
    pool.close().await;
    drop_test_db(&db_name).await;
}
