use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use jobs_core::{
    EnqueueRequest, EnqueueResponse, Job, JobId, JobStore, Outbox, OutboxEntry, QueueError,
    QueueStats,
};
use jobs_worker::{Worker, WorkerStatus};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub outbox: Arc<dyn Outbox>,
    /// This process's worker; its loops only run when embedded workers are enabled.
    pub worker: Arc<Worker>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub worker: WorkerStatus,
    pub queue: QueueStats,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct OutboxResponse {
    pub entries: Vec<OutboxEntry>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct FailedJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct OutboxQuery {
    /// Job type to filter on.
    #[serde(rename = "type")]
    pub kind: String,
    /// Max number of entries to return (1–500).
    pub limit: Option<i64>,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct LimitQuery {
    /// Max number of jobs to return (1–500).
    pub limit: Option<i64>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AI Job Queue API",
        version = "0.1.0",
        description = "Enqueue AI jobs, read their results and inspect worker health."
    ),
    paths(
        enqueue_job,
        get_job,
        job_outbox,
        outbox_by_type,
        status,
        admin_failed,
        admin_requeue
    ),
    components(schemas(
        jobs_core::EnqueueRequest,
        jobs_core::EnqueueResponse,
        jobs_core::Job,
        jobs_core::JobState,
        jobs_core::OutboxEntry,
        jobs_core::QueueStats,
        jobs_worker::WorkerStatus,
        jobs_worker::BreakerSnapshot,
        jobs_worker::BreakerState,
        StatusResponse,
        OutboxResponse,
        FailedJobsResponse,
        OutboxQuery,
        LimitQuery
    ))
)]
struct ApiDoc;

async fn metrics_handler(
    State(state): State<AppState>,
) -> ([(axum::http::header::HeaderName, &'static str); 1], String) {
    match state.store.stats().await {
        Ok(stats) => metrics::observe(&stats, &state.worker.breaker().snapshot().await),
        Err(e) => tracing::warn!(error = %e, "stats unavailable for metrics"),
    }
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics::gather(),
    )
}

pub fn build_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .route("/v1/jobs", post(enqueue_job))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/outbox", get(job_outbox))
        .route("/v1/outbox", get(outbox_by_type))
        .route("/v1/status", get(status))
        .route("/v1/admin/failed", get(admin_failed))
        .route("/v1/admin/jobs/{id}/requeue", post(admin_requeue))
        .with_state(state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api)
}

/// Enqueue a new job.
#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Job enqueued", body = EnqueueResponse),
        (status = 400, description = "Unknown job type or invalid options"),
        (status = 500, description = "Internal error")
    )
)]
async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let registry = state.worker.registry();
    if !registry.is_empty() && !registry.contains(&req.kind) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown job type: {}", req.kind),
        ));
    }
    if req.max_attempts.is_some_and(|m| m < 1) {
        return Err((
            StatusCode::BAD_REQUEST,
            "maxAttempts must be at least 1".to_string(),
        ));
    }

    let kind = req.kind.clone();
    let job_id = state.store.enqueue(req).await.map_err(map_err)?;

    metrics::JOBS_ENQUEUED.inc();
    tracing::debug!(job_id = %job_id, kind = %kind, "job enqueued");
    Ok(Json(EnqueueResponse { job_id }))
}

/// Read a job's state and last error.
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = uuid::Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job", body = Job),
        (status = 404, description = "Job not found"),
        (status = 500, description = "Internal error")
    )
)]
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let job = state.store.get(id).await.map_err(map_err)?;
    job.map(Json).ok_or_else(|| map_err(QueueError::NotFound))
}

/// Results written for one job, in write order. Empty while the job is still
/// pending, and briefly possible even after it is done.
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/outbox",
    params(("id" = uuid::Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Outbox entries", body = OutboxResponse),
        (status = 500, description = "Internal error")
    )
)]
async fn job_outbox(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<OutboxResponse>, (StatusCode, String)> {
    let entries = state.outbox.by_job(id).await.map_err(map_err)?;
    Ok(Json(OutboxResponse { entries }))
}

/// Newest results of one job type.
#[utoipa::path(
    get,
    path = "/v1/outbox",
    params(OutboxQuery),
    responses(
        (status = 200, description = "Outbox entries", body = OutboxResponse),
        (status = 500, description = "Internal error")
    )
)]
async fn outbox_by_type(
    State(state): State<AppState>,
    Query(q): Query<OutboxQuery>,
) -> Result<Json<OutboxResponse>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let entries = state
        .outbox
        .by_type(&q.kind, limit)
        .await
        .map_err(map_err)?;
    Ok(Json(OutboxResponse { entries }))
}

/// Worker and queue health. Read-only.
///
/// The breaker reported is the one owned by this process. With
/// `EMBEDDED_WORKERS=0` no loop ever calls upstream, so `isRunning` is false
/// and the breaker stays `closed` with zero failures; the state of remote
/// worker processes is not visible here. Queue counts come from the shared
/// store and are accurate in either mode.
#[utoipa::path(
    get,
    path = "/v1/status",
    responses(
        (status = 200, description = "Status", body = StatusResponse),
        (status = 500, description = "Internal error")
    )
)]
async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let queue = state.store.stats().await.map_err(map_err)?;
    let worker = state.worker.status().await;
    Ok(Json(StatusResponse { worker, queue }))
}

/// List terminally failed jobs, most recent first.
#[utoipa::path(
    get,
    path = "/v1/admin/failed",
    params(LimitQuery),
    responses(
        (status = 200, description = "Failed jobs", body = FailedJobsResponse),
        (status = 500, description = "Internal error")
    )
)]
async fn admin_failed(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<FailedJobsResponse>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let jobs = state.store.list_failed(limit).await.map_err(map_err)?;
    Ok(Json(FailedJobsResponse { jobs }))
}

/// Requeue a failed job with a fresh attempt budget.
#[utoipa::path(
    post,
    path = "/v1/admin/jobs/{id}/requeue",
    params(("id" = uuid::Uuid, Path, description = "Job ID")),
    responses(
        (status = 204, description = "Job requeued"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not failed"),
        (status = 500, description = "Internal error")
    )
)]
async fn admin_requeue(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.store.requeue_failed(id).await.map_err(map_err)?;
    metrics::JOBS_REQUEUED.inc();
    tracing::info!(job_id = %id, "failed job requeued");
    Ok(StatusCode::NO_CONTENT)
}

fn map_err(e: QueueError) -> (StatusCode, String) {
    match e {
        QueueError::NotFound => (StatusCode::NOT_FOUND, e.to_string()),
        QueueError::InvalidState => (StatusCode::CONFLICT, e.to_string()),
        QueueError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        QueueError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
