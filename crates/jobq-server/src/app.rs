use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobq_core::{Job, JobId, JobRun, JobStatus, JobStore, NewJob, QueueError, RunStatus};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::metrics;

pub const SERVICE_NAME: &str = "jobq-server";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct EnqueueBody {
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    pub payload: Option<serde_json::Value>,
    /// Offset from now, in milliseconds; must be non-negative.
    pub run_after_ms: Option<i64>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub ok: bool,
    pub job: Job,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub ok: bool,
    pub jobs: Vec<Job>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct RunListResponse {
    pub ok: bool,
    pub runs: Vec<JobRun>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    /// Epoch milliseconds.
    pub time: i64,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct DbHealthResponse {
    pub ok: bool,
    #[serde(rename = "dbTime")]
    pub db_time: i64,
    pub time: i64,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct ListJobsQuery {
    /// Filter by job status (queued|running|retrying|succeeded|dead).
    pub status: Option<String>,
    /// Max rows to return (clamped to 1–200, default 50).
    pub limit: Option<i64>,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct ListRunsQuery {
    /// Max rows to return (clamped to 1–200, default 50).
    pub limit: Option<i64>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Job Queue Admission API",
        version = "0.1.0",
        description = "Enqueue background jobs and inspect jobs and their runs."
    ),
    paths(enqueue_job, list_jobs, get_job, list_runs, health, db_health),
    components(schemas(
        Job,
        JobRun,
        JobStatus,
        RunStatus,
        EnqueueBody,
        JobResponse,
        JobListResponse,
        RunListResponse,
        HealthResponse,
        DbHealthResponse,
        ErrorResponse,
        ListJobsQuery,
        ListRunsQuery
    ))
)]
struct ApiDoc;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: code.to_string(),
        }),
    )
}

fn map_err(e: QueueError) -> ApiError {
    match e {
        QueueError::InvalidInput(_) => error(StatusCode::BAD_REQUEST, "invalid_input"),
        QueueError::NotFound => error(StatusCode::NOT_FOUND, "not_found"),
        QueueError::Transient(_) => error(StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        QueueError::Internal(detail) => {
            // Internal detail goes to the log, never over the wire.
            tracing::error!(%detail, "queue engine error");
            error(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

/// Turn a non-negative offset into an absolute schedule.
fn resolve_run_after(
    now: DateTime<Utc>,
    run_after_ms: Option<i64>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    match run_after_ms {
        None => Ok(None),
        Some(ms) if ms < 0 => Err(error(StatusCode::BAD_REQUEST, "invalid_input")),
        Some(ms) => Ok(Some(now + chrono::Duration::milliseconds(ms))),
    }
}

fn parse_status(status: Option<&str>) -> Result<Option<JobStatus>, ApiError> {
    match status {
        None | Some("") => Ok(None),
        Some(s) => JobStatus::parse(s)
            .map(Some)
            .map_err(|_| error(StatusCode::BAD_REQUEST, "invalid_status")),
    }
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse::<JobId>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "invalid_id"))
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health))
        .route("/db/health", get(db_health))
        .route("/metrics", get(metrics_handler))
        .route("/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/runs", get(list_runs))
        .with_state(state)
}

async fn metrics_handler() -> ([(axum::http::header::HeaderName, &'static str); 1], String) {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics::gather(),
    )
}

/// Enqueue a job, coalescing with any existing row for the same (type, key).
#[utoipa::path(
    post,
    path = "/jobs",
    request_body = EnqueueBody,
    responses(
        (status = 201, description = "Job enqueued", body = JobResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 503, description = "Database unavailable", body = ErrorResponse)
    )
)]
async fn enqueue_job(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let run_after = resolve_run_after(Utc::now(), body.run_after_ms).inspect_err(|_| {
        metrics::ENQUEUES_REJECTED.inc();
    })?;

    let req = NewJob {
        job_type: body.job_type,
        key: body.key,
        payload: body.payload,
        run_after,
        max_attempts: body.max_attempts,
    };

    let job = state.store.enqueue(req).await.map_err(|e| {
        if matches!(e, QueueError::InvalidInput(_)) {
            metrics::ENQUEUES_REJECTED.inc();
        }
        map_err(e)
    })?;

    metrics::JOBS_ENQUEUED.inc();
    Ok((StatusCode::CREATED, Json(JobResponse { ok: true, job })))
}

/// List jobs, newest update first, optionally filtered by status.
#[utoipa::path(
    get,
    path = "/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs", body = JobListResponse),
        (status = 400, description = "Unknown status", body = ErrorResponse)
    )
)]
async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let status = parse_status(q.status.as_deref())?;
    let jobs = state
        .store
        .list_jobs(status, q.limit)
        .await
        .map_err(map_err)?;
    Ok(Json(JobListResponse { ok: true, jobs }))
}

/// Fetch one job by id.
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job", body = JobResponse),
        (status = 400, description = "Invalid id", body = ErrorResponse),
        (status = 404, description = "No such job", body = ErrorResponse)
    )
)]
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = parse_id(&id)?;
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(map_err)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "not_found"))?;
    Ok(Json(JobResponse { ok: true, job }))
}

/// List runs for one job, latest attempt first.
#[utoipa::path(
    get,
    path = "/jobs/{id}/runs",
    params(("id" = String, Path, description = "Job id"), ListRunsQuery),
    responses(
        (status = 200, description = "Runs", body = RunListResponse),
        (status = 400, description = "Invalid id", body = ErrorResponse),
        (status = 404, description = "No such job", body = ErrorResponse)
    )
)]
async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ListRunsQuery>,
) -> Result<Json<RunListResponse>, ApiError> {
    let id = parse_id(&id)?;
    state
        .store
        .get_job(id)
        .await
        .map_err(map_err)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "not_found"))?;

    let runs = state
        .store
        .list_runs(id, q.limit)
        .await
        .map_err(map_err)?;
    Ok(Json(RunListResponse { ok: true, runs }))
}

/// Process liveness.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service up", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: SERVICE_NAME,
        time: Utc::now().timestamp_millis(),
    })
}

/// Database round-trip health.
#[utoipa::path(
    get,
    path = "/db/health",
    responses(
        (status = 200, description = "Database reachable", body = DbHealthResponse),
        (status = 503, description = "Database unreachable", body = ErrorResponse)
    )
)]
async fn db_health(State(state): State<AppState>) -> Result<Json<DbHealthResponse>, ApiError> {
    let db_time = state
        .store
        .db_now()
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "database health check failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "db_unreachable")
        })?;

    Ok(Json(DbHealthResponse {
        ok: true,
        db_time: db_time.timestamp_millis(),
        time: Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_after_offset_resolves_against_now() {
        let now = Utc::now();
        assert_eq!(resolve_run_after(now, None).unwrap(), None);
        assert_eq!(
            resolve_run_after(now, Some(0)).unwrap(),
            Some(now)
        );
        assert_eq!(
            resolve_run_after(now, Some(5000)).unwrap(),
            Some(now + chrono::Duration::milliseconds(5000))
        );
        assert!(resolve_run_after(now, Some(-1)).is_err());
    }

    #[test]
    fn status_filter_parses_or_rejects() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(parse_status(Some("")).unwrap(), None);
        assert_eq!(parse_status(Some("dead")).unwrap(), Some(JobStatus::Dead));
        assert!(parse_status(Some("zombie")).is_err());
    }

    #[test]
    fn ids_must_be_positive_integers() {
        assert_eq!(parse_id("17").unwrap(), 17);
        assert!(parse_id("abc").is_err());
        assert!(parse_id("-2").is_err());
        assert!(parse_id("0").is_err());
        assert!(parse_id("").is_err());
    }
}
