//! HTTP API gateway.
//!
//! Synchronous endpoints manage projects and report job state. Indexing,
//! search, chat, and reset are asynchronous: the handler validates the
//! request, enqueues a job, and answers `202 Accepted` with the job id. The
//! client then polls `GET /jobs/{id}`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Service info |
//! | `GET` | `/health` | Health check |
//! | `GET` | `/metrics` | Prometheus exposition |
//! | `POST` | `/projects` | Create a project |
//! | `GET` | `/projects` | List projects |
//! | `GET` | `/projects/{id}` | Get a project |
//! | `PUT` | `/projects/{id}` | Partial update |
//! | `DELETE` | `/projects/{id}` | Delete a project and its storage |
//! | `GET` | `/projects/{id}/stats` | Stats view |
//! | `POST` | `/projects/{id}/index/text/async` | Index raw text |
//! | `POST` | `/projects/{id}/index/file/async` | Upload and index one file (multipart `file`) |
//! | `POST` | `/projects/{id}/index/folder/async` | Index a server-side folder |
//! | `POST` | `/projects/{id}/search/async` | Search |
//! | `POST` | `/projects/{id}/chat/async` | Retrieval-augmented chat |
//! | `POST` | `/projects/{id}/reset/async` | Drop the index and zero stats |
//! | `GET` | `/jobs/{id}` | Job status |
//! | `GET` | `/jobs` | Recent jobs (`status`, `limit`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "name must not be empty" } }
//! ```
//!
//! `code` is the stable error kind. Validation, unsupported-format, and
//! not-indexed errors are 400; missing projects and jobs are 404;
//! everything else is 500.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db;
use crate::error::KbError;
use crate::jobs;
use crate::llm::LlmRouter;
use crate::metrics;
use crate::migrate::migrate;
use crate::models::{
    ChatRequest, IndexFolderRequest, IndexTextRequest, Job, JobError, JobPayload, JobStatus,
    Project, ProjectCreate, ProjectStats, ProjectUpdate, QueueClass, SearchRequest,
};
use crate::queue::JobQueue;
use crate::registry::ProjectRegistry;
use crate::storage::{sanitize_filename, StorageLayout};
use crate::worker;

const DEFAULT_JOB_LIST_LIMIT: usize = 50;
const MAX_JOB_LIST_LIMIT: usize = 500;

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: ProjectRegistry,
    queue: JobQueue,
    llm: LlmRouter,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: ProjectRegistry,
        queue: JobQueue,
        llm: LlmRouter,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            llm,
            metrics,
        }
    }
}

/// How `run_server` wires the process.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Workers embedded in the API process. 0 means jobs wait for a
    /// separate `kbhub worker`.
    pub workers: usize,
    /// Language backend routing; `None` builds one from `[llm]`.
    pub llm: Option<LlmRouter>,
}

/// Serve on `[server].bind` until ctrl-c, then drain embedded workers.
pub async fn run_server(config: &Config, options: ServerOptions) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate(&pool).await?;

    let registry = ProjectRegistry::new(pool.clone(), StorageLayout::from_config(&config));
    let queue = JobQueue::new(pool.clone());
    let llm = options
        .llm
        .unwrap_or_else(|| LlmRouter::from_config(config.llm.clone()));
    let handle = if config.metrics.enabled {
        metrics::install()
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = if options.workers > 0 {
        worker::spawn_pool(
            &config,
            pool.clone(),
            queue.clone(),
            llm.clone(),
            options.workers,
            &config.worker.queues,
            shutdown_rx,
        )
    } else {
        Vec::new()
    };

    let state = AppState::new(config.clone(), registry, queue, llm, handle);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, workers = options.workers, "kbhub API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for w in workers {
        let _ = w.await;
    }
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Multipart framing on top of the largest accepted file
    let body_limit = state.config.indexing.max_upload_bytes + 64 * 1024;

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/projects", post(handle_create_project).get(handle_list_projects))
        .route(
            "/projects/{id}",
            get(handle_get_project)
                .put(handle_update_project)
                .delete(handle_delete_project),
        )
        .route("/projects/{id}/stats", get(handle_project_stats))
        .route("/projects/{id}/index/text/async", post(handle_index_text))
        .route("/projects/{id}/index/file/async", post(handle_index_file))
        .route("/projects/{id}/index/folder/async", post(handle_index_folder))
        .route("/projects/{id}/search/async", post(handle_search))
        .route("/projects/{id}/chat/async", post(handle_chat))
        .route("/projects/{id}/reset/async", post(handle_reset))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}", get(handle_job_status))
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let response = next.run(req).await;
    metrics::record_http_request(&method, response.status().as_u16());
    response
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match &err {
            KbError::Validation(_) | KbError::UnsupportedFormat(_) | KbError::NotIndexed(_) => {
                StatusCode::BAD_REQUEST
            }
            KbError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation_error".to_string(),
        message: message.into(),
    }
}

/// Unwrap a JSON body, reporting malformed input in the error envelope.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(v)| v)
        .map_err(|e| bad_request(e.body_text()))
}

// ============ Service ============

async fn handle_root() -> Json<Value> {
    Json(serde_json::json!({
        "name": "kbhub",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "GET /health, /projects, /jobs; POST /projects/{id}/{index/text,index/file,index/folder,search,chat,reset}/async",
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    projects: u64,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let projects = state.registry.count().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        projects,
    }))
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };
    match state.registry.list().await {
        Ok(projects) => metrics::refresh_project_gauges(&projects),
        Err(e) => tracing::warn!(error = %e, "could not refresh project gauges"),
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

// ============ Projects ============

async fn handle_create_project(
    State(state): State<AppState>,
    body: Result<Json<ProjectCreate>, JsonRejection>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let req = json_body(body)?;
    let project = state.registry.create(req).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn handle_list_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.registry.list().await?))
}

async fn handle_get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, AppError> {
    Ok(Json(state.registry.get(&id).await?))
}

async fn handle_update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ProjectUpdate>, JsonRejection>,
) -> Result<Json<Project>, AppError> {
    let update = json_body(body)?;
    Ok(Json(state.registry.update(&id, update).await?))
}

async fn handle_delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !state.registry.delete(&id).await? {
        return Err(KbError::project_not_found(&id).into());
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Project {} deleted", id),
    })))
}

async fn handle_project_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectStats>, AppError> {
    Ok(Json(state.registry.stats(&id).await?))
}

// ============ Async submission ============

#[derive(Serialize)]
struct JobAccepted {
    job_id: String,
    status: JobStatus,
    project_id: String,
    queue: QueueClass,
    message: String,
}

/// Enqueue for an existing project and answer 202.
async fn submit(
    state: &AppState,
    project_id: &str,
    payload: JobPayload,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let job = state.queue.enqueue(project_id, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            message: format!("{} job queued; poll GET /jobs/{}", job.kind, job.id),
            job_id: job.id,
            status: job.status,
            project_id: job.project_id,
            queue: job.queue,
        }),
    ))
}

async fn handle_index_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<IndexTextRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;
    let payload = jobs::prepare_index_text(json_body(body)?)?;
    submit(&state, &id, payload).await
}

async fn handle_index_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        upload = Some((filename, bytes));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("multipart field 'file' is required"))?;

    let filename = sanitize_filename(&filename)?;
    jobs::check_upload(&filename, bytes.len(), &state.config.indexing)?;
    let path = state
        .registry
        .storage()
        .store_upload(&id, &filename, &bytes)?;

    submit(&state, &id, JobPayload::IndexFile { path, filename }).await
}

async fn handle_index_folder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<IndexFolderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;
    let payload = jobs::prepare_index_folder(json_body(body)?, &state.config.indexing)?;
    submit(&state, &id, payload).await
}

async fn handle_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;
    let payload = jobs::prepare_search(json_body(body)?, &state.config.retrieval)?;
    submit(&state, &id, payload).await
}

async fn handle_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;
    let payload = jobs::prepare_chat(json_body(body)?, &state.config.retrieval, &state.llm)?;
    submit(&state, &id, payload).await
}

async fn handle_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    state.registry.get(&id).await?;
    submit(&state, &id, JobPayload::Reset).await
}

// ============ Jobs ============

/// Job status as reported to clients. The payload is omitted so large
/// indexing requests are not echoed back on every poll.
#[derive(Serialize)]
struct JobView {
    id: String,
    queue: QueueClass,
    kind: String,
    project_id: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            kind: job.kind,
            project_id: job.project_id,
            status: job.status,
            result: job.result,
            error: job.error,
            worker_id: job.worker_id,
            created_at: job.created_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

async fn handle_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(state.queue.status(&id).await?.into()))
}

#[derive(Deserialize)]
struct JobListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct JobList {
    jobs: Vec<JobView>,
    total: usize,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    query: Result<Query<JobListQuery>, QueryRejection>,
) -> Result<Json<JobList>, AppError> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    // An empty `status=` means no filter
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT);
    if limit == 0 || limit > MAX_JOB_LIST_LIMIT {
        return Err(bad_request(format!(
            "limit must be in [1, {}]",
            MAX_JOB_LIST_LIMIT
        )));
    }
    let jobs: Vec<JobView> = state
        .queue
        .list(status, limit)
        .await?
        .into_iter()
        .map(JobView::from)
        .collect();
    let total = jobs.len();
    Ok(Json(JobList { jobs, total }))
}
