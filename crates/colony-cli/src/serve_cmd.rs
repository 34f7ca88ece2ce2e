//! HTTP boundary adapter: a thin axum surface over the client facade plus an
//! SSE bridge from the event bus.

use std::convert::Infallible;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use colony_core::error::ErrorKind;
use colony_core::task::{StatusMeta, TaskSpec};
use colony_core::worker::RunOutcome;
use colony_core::{Client, Error};
use colony_db::models::{ExecutionPlan, Run, RunStatus, Task, TaskStatus, Worker, WorkerStatus};

use crate::config::ColonyConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::StateError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::AgentError => StatusCode::BAD_GATEWAY,
            ErrorKind::StorageError
            | ErrorKind::ConfigurationError
            | ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
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
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    task_type: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_priority")]
    priority: i64,
    payload: Option<serde_json::Value>,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_priority() -> i64 {
    1
}

#[derive(Debug, Serialize)]
struct IdResponse {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct TaskDetailResponse {
    #[serde(flatten)]
    task: Task,
    dependencies: Vec<Uuid>,
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    status: Option<TaskStatus>,
    #[serde(default = "default_limit")]
    limit: i64,
    task_type: Option<String>,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: TaskStatus,
    assigned_worker: Option<String>,
    current_phase: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterWorkerRequest {
    worker_id: String,
    role: String,
    #[serde(default)]
    capabilities: Vec<String>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    status: Option<WorkerStatus>,
}

#[derive(Debug, Deserialize)]
struct WorkersQuery {
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    capability: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    task: Task,
    run: Run,
}

#[derive(Debug, Deserialize)]
struct CompleteRunRequest {
    status: RunStatus,
    result_data: Option<serde_json::Value>,
    error_message: Option<String>,
    output_log: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(client: Client) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/tasks/{id}/status", post(update_task_status))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/{id}/heartbeat", post(heartbeat))
        .route("/api/workers/{id}/claim", post(claim))
        .route("/api/runs/{id}/start", post(start_run))
        .route("/api/runs/{id}/complete", post(complete_run))
        .route("/api/plans/{id}", get(get_plan))
        .route("/api/plans/{id}/start", post(start_plan))
        .route("/api/plans/{id}/materialize", post(materialize_plan))
        .route("/api/plans/{id}/next", get(next_subtask))
        .route("/api/agents/health", get(agents_health))
        .route("/api/events", get(event_stream))
        .layer(CorsLayer::permissive())
        .with_state(client)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html("<h1>colony</h1><p>Task orchestration core. See /api.</p>")
}

async fn create_task(
    State(client): State<Client>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<IdResponse>, AppError> {
    let mut spec = TaskSpec::new(req.title, req.task_type);
    spec.description = req.description;
    spec.priority = req.priority;
    spec.payload = req.payload;
    spec.tags = req.tags;
    let id = client.create_task(spec).await?;
    Ok(Json(IdResponse { id }))
}

async fn get_task_detail(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>, AppError> {
    let task = client
        .get_task(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    let dependencies = client.tasks().get_task_dependencies(id).await?;
    let runs = client.get_runs_for_task(id).await?;
    Ok(Json(TaskDetailResponse {
        task,
        dependencies,
        runs,
    }))
}

async fn list_tasks(
    State(client): State<Client>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = match query.status {
        Some(status) => client.get_tasks_by_status(status).await?,
        None => {
            client
                .get_queued_tasks(query.limit, query.task_type.as_deref())
                .await?
        }
    };
    Ok(Json(tasks))
}

async fn update_task_status(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<StatusCode, AppError> {
    client
        .update_task_status(
            id,
            req.status,
            Some(StatusMeta {
                assigned_worker: req.assigned_worker,
                current_phase: req.current_phase,
                error_message: req.error_message,
                metadata: None,
            }),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_task(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    client.cancel_task(id, Some("cancelled via API")).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workers(
    State(client): State<Client>,
    Query(query): Query<WorkersQuery>,
) -> Result<Json<Vec<Worker>>, AppError> {
    Ok(Json(client.get_active_workers(query.role.as_deref()).await?))
}

async fn register_worker(
    State(client): State<Client>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<StatusCode, AppError> {
    client
        .register_worker(&req.worker_id, &req.role, req.capabilities, req.metadata)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn heartbeat(
    State(client): State<Client>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, AppError> {
    let known = client.update_worker_heartbeat(&id, req.status).await?;
    if known {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("worker {id} not registered")))
    }
}

async fn claim(
    State(client): State<Client>,
    Path(id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Option<ClaimResponse>>, AppError> {
    let claimed = client.claim_task(&id, req.capability.as_deref()).await?;
    Ok(Json(claimed.map(|(task, run)| ClaimResponse { task, run })))
}

async fn start_run(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    client.start_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete_run(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRunRequest>,
) -> Result<StatusCode, AppError> {
    client
        .complete_run(
            id,
            RunOutcome {
                status: req.status,
                result_data: req.result_data,
                error_message: req.error_message,
                output_log: req.output_log,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_plan(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionPlan>, AppError> {
    let plan = client
        .get_execution_plan(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("plan {id} not found")))?;
    Ok(Json(plan))
}

async fn start_plan(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    client.mark_plan_execution_started(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn materialize_plan(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = client.create_planned_subtasks_from_plan(id).await?;
    Ok(Json(serde_json::json!({ "created": count })))
}

async fn next_subtask(
    State(client): State<Client>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<Task>>, AppError> {
    Ok(Json(client.get_next_planned_subtask(id).await?))
}

async fn agents_health(
    State(client): State<Client>,
) -> Result<Json<serde_json::Value>, AppError> {
    let health = client.health_check_agents().await;
    Ok(Json(serde_json::to_value(health).unwrap_or_default()))
}

/// Server-sent event bridge from the in-process bus.
///
/// Best-effort: a slow consumer that lags behind the broadcast buffer skips
/// the missed events.
async fn event_stream(
    State(client): State<Client>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = client.get_event_bus().watch();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default()
                .event(event.event_type.to_string())
                .data(data)))
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "event stream consumer lagging");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------


pub async fn run_serve(
    client: Client,
    config: ColonyConfig,
    bind: &str,
    port: u16,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let sweeper = client.spawn_liveness_sweeper(config.sweep_interval, cancel.clone());

    let app = build_router(client);
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "colony API listening");
    println!("colony API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    cancel.cancel();
    let _ = sweeper.await;
    Ok(())
}
