use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use taskforge_core::dispatcher::InFlightRegistry;
use taskforge_core::error::TaskError;
use taskforge_core::events::EventBus;
use taskforge_core::service::{SubmitRequest, TaskService};
use taskforge_db::models::{
    QueueDepth, SortDirection, Task, TaskFilter, TaskPriority, TaskSortColumn, TaskStatus, TaskType,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        let status = if err.is_caller_error() {
            match &err {
                TaskError::NotFound(_) => StatusCode::NOT_FOUND,
                TaskError::PolicyDenied(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::CONFLICT,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

/// The acting identity for a request. Resolved from `X-Actor-Id` /
/// `X-Actor-Capabilities` headers; absent headers default to an anonymous
/// actor holding only `tasks:user`. A production deployment would resolve
/// this from a real session instead.
struct Actor {
    id: Uuid,
    capabilities: HashSet<String>,
}

fn resolve_actor(headers: &HeaderMap) -> Actor {
    let id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let capabilities = headers
        .get("x-actor-capabilities")
        .and_then(|v| v.to_str().ok())
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<HashSet<_>>()
        })
        .filter(|caps| !caps.is_empty())
        .unwrap_or_else(|| HashSet::from(["tasks:user".to_string()]));

    Actor { id, capabilities }
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskBody {
    pub task_type: TaskType,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default = "default_input")]
    pub input: serde_json::Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    #[serde(default)]
    pub depends_on_task_ids: Vec<Uuid>,
}

fn default_input() -> serde_json::Value {
    serde_json::json!({})
}

fn default_max_retries() -> i32 {
    3
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue_depth: QueueDepth,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    service: TaskService,
    bus: EventBus,
}

pub fn build_router(pool: PgPool, bus: EventBus, in_flight: InFlightRegistry) -> Router {
    let state = AppState {
        service: TaskService::new(pool, bus.clone(), in_flight),
        bus,
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/stream", get(stream_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(
    pool: PgPool,
    bus: EventBus,
    in_flight: InFlightRegistry,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(pool, bus, in_flight);
    tracing::info!("taskforge serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("taskforge serve shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let queue_depth = state.service.queue_depth().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        queue_depth,
    }))
}

async fn submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitTaskBody>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let actor = resolve_actor(&headers);

    let request = SubmitRequest {
        task_type: body.task_type,
        name: body.name,
        description: body.description,
        priority: body.priority.unwrap_or_default(),
        input: body.input,
        max_retries: body.max_retries,
        timeout_seconds: body.timeout_seconds,
        scheduled_at: body.scheduled_at,
        related_entity_type: body.related_entity_type,
        related_entity_id: body.related_entity_id,
        depends_on_task_ids: body.depends_on_task_ids,
    };

    let task = state
        .service
        .submit(actor.id, &actor.capabilities, request)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.get(id).await?))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let mut filter = TaskFilter::default();

    if let Some(status) = query.status {
        filter.status = status
            .split(',')
            .filter_map(|s| s.parse::<TaskStatus>().ok())
            .collect();
    }
    if let Some(task_type) = query.task_type {
        filter.task_type = task_type
            .split(',')
            .filter_map(|s| s.parse::<TaskType>().ok())
            .collect();
    }
    filter.limit = query.limit;
    filter.offset = query.offset;
    filter.order_by = Some((TaskSortColumn::CreatedAt, SortDirection::Desc));

    Ok(Json(state.service.list(filter).await?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.cancel(id).await?))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.retry(id).await?))
}

async fn stream_tasks(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = async_stream::stream! {
        let mut rx = rx;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use taskforge_core::events::EventBus;
    use taskforge_test_utils::{create_test_db, drop_test_db};

    use super::*;

    async fn send_request(pool: PgPool, method: &str, uri: &str, body: Body) -> axum::response::Response {
        let app = super::build_router(pool, EventBus::new(16), InFlightRegistry::new());
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_zero_queue_depth_on_fresh_db() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), "GET", "/api/health", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["queue_depth"]["pending"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_then_get_round_trips() {
        let (pool, db_name) = create_test_db().await;

        let submit_body = serde_json::json!({
            "task_type": "database_cleanup",
            "name": "nightly cleanup",
        });
        let resp = send_request(
            pool.clone(),
            "POST",
            "/api/tasks",
            Body::from(submit_body.to_string()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap();

        let resp = send_request(pool.clone(), "GET", &format!("/api/tasks/{id}"), Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["status"], "pending");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_missing_task_is_404() {
        let (pool, db_name) = create_test_db().await;

        let random_id = Uuid::new_v4();
        let resp = send_request(pool.clone(), "GET", &format!("/api/tasks/{random_id}"), Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_pending_task_succeeds() {
        let (pool, db_name) = create_test_db().await;

        let submit_body = serde_json::json!({
            "task_type": "database_cleanup",
            "name": "cancel me",
        });
        let resp = send_request(pool.clone(), "POST", "/api/tasks", Body::from(submit_body.to_string())).await;
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap();

        let resp = send_request(pool.clone(), "POST", &format!("/api/tasks/{id}/cancel"), Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cancelled = body_json(resp).await;
        assert_eq!(cancelled["status"], "cancelled");

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
