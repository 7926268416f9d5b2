//! API routes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use beacon_scheduler::{NewTask, Run, Scheduler, Task, TaskStatus};

use crate::error::ApiError;
use crate::metrics::{ApiMetrics, track_requests};
use crate::rate_limit::{ClientRateLimiter, RateLimitConfig, limit_requests};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

const DEFAULT_RUNS_LIMIT: usize = 50;

/// Shared state for the API server.
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<ApiMetrics>,
}

/// Router options.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Directory served for unmatched paths.
    pub static_dir: Option<PathBuf>,
    /// Per-client limit; `None` turns limiting off.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            static_dir: None,
            rate_limit: Some(RateLimitConfig::default()),
        }
    }
}

/// `{id, status}` as returned by create and control endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub status: TaskStatus,
}

impl TaskRef {
    fn new(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

impl From<&Task> for TaskRef {
    fn from(task: &Task) -> Self {
        Self::new(task.id.clone(), task.status)
    }
}

/// A task without its run history, as listed by `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub done_count: u32,
    pub failed_count: u32,
    pub repeat: u32,
    pub interval_ms: u64,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            url: task.url,
            status: task.status,
            created_at: task.created_at,
            done_count: task.done_count,
            failed_count: task.failed_count,
            repeat: task.repeat,
            interval_ms: task.interval_ms,
            next_run_at: task.next_run_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    tasks: usize,
    active: usize,
    queued: usize,
    version: &'static str,
}

/// Create the API router.
///
/// Fails only if the metrics registry cannot be built.
pub fn create_router(
    scheduler: Arc<Scheduler>,
    config: &ApiConfig,
) -> Result<Router, prometheus::Error> {
    let metrics = Arc::new(ApiMetrics::new()?);
    let state = Arc::new(AppState {
        scheduler,
        metrics: Arc::clone(&metrics),
    });

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/batch", post(create_batch))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/runs", get(list_runs))
        .route("/tasks/{id}/pause", post(pause_task))
        .route("/tasks/{id}/resume", post(resume_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router = router.layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    match config.rate_limit {
        Some(limit) => match ClientRateLimiter::new(limit) {
            Some(limiter) => {
                info!(
                    max_requests = limit.max_requests,
                    window_ms = limit.window.as_millis() as u64,
                    "rate limiting enabled"
                );
                router = router.layer(middleware::from_fn_with_state(
                    Arc::new(limiter),
                    limit_requests,
                ));
            }
            None => warn!(?limit, "rate limit cannot be applied, limiting disabled"),
        },
        None => debug!("rate limiting disabled"),
    }

    Ok(router
        .layer(middleware::from_fn_with_state(metrics, track_requests))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(rejection.body_text())
    } else {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scheduler = &state.scheduler;
    Json(HealthResponse {
        status: "ok",
        tasks: scheduler.store().len().await,
        active: scheduler.pool().active(),
        queued: scheduler.pool().queued(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let scheduler = &state.scheduler;
    state.metrics.set_load(
        scheduler.store().len().await,
        scheduler.pool().active(),
        scheduler.pool().queued(),
    );
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(spec) = body.map_err(json_rejection)?;
    let task = state.scheduler.create_task(spec).await?;
    Ok((StatusCode::CREATED, Json(TaskRef::from(&task))))
}

async fn create_batch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Vec<NewTask>>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(specs) = body.map_err(json_rejection)?;
    let tasks = state.scheduler.create_tasks(specs).await?;
    let created: Vec<TaskRef> = tasks.iter().map(TaskRef::from).collect();
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let Query(query) = query.map_err(query_rejection)?;
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_status(raw)?),
        None => None,
    };

    let tasks = state.scheduler.list_tasks(status).await;
    Ok(Json(tasks.into_iter().map(TaskSummary::from).collect()))
}

fn parse_status(raw: &str) -> Result<TaskStatus, ApiError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| ApiError::BadRequest(format!("unknown status: {raw}")))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.scheduler.get_task(&id).await?))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<RunsQuery>, QueryRejection>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let Query(query) = query.map_err(query_rejection)?;
    let task = state.scheduler.get_task(&id).await?;

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    Ok(Json(task.runs.into_iter().skip(offset).take(limit).collect()))
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRef>, ApiError> {
    let status = state.scheduler.pause_task(&id).await?;
    Ok(Json(TaskRef::new(id, status)))
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRef>, ApiError> {
    let status = state.scheduler.resume_task(&id).await?;
    Ok(Json(TaskRef::new(id, status)))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRef>, ApiError> {
    let status = state.scheduler.cancel_task(&id).await?;
    Ok(Json(TaskRef::new(id, status)))
}

async fn delete_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    if !state.scheduler.remove_task(&id).await {
        debug!(task_id = %id, "delete of unknown task");
    }
    StatusCode::NO_CONTENT
}
