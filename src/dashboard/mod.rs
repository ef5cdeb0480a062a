use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::StoreError;
use crate::farm::{Job, JobStatus, Worker};
use crate::manager::Manager;
use crate::scanner::ScanReport;
use crate::store::MemoryStore;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<Manager>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    name: String,
    processor: String,
    status: JobStatus,
    priority: i64,
    failure_count: u32,
    assigned_worker: Option<String>,
    built_by: Option<String>,
    log_tail: Option<String>,
    failure_reason: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name,
            processor: job.processor,
            status: job.status,
            priority: job.priority,
            failure_count: job.failure_count,
            assigned_worker: job.assigned_worker,
            built_by: job.built_by,
            log_tail: job.log_tail,
            failure_reason: job.failure_reason,
        }
    }
}

#[derive(Serialize)]
struct WorkerResponse {
    name: String,
    url: String,
    processors: Vec<String>,
    virtualized: bool,
    ok: bool,
    manual: bool,
    failure_count: u32,
    failure_notes: Option<String>,
    current_job: Option<String>,
}

impl From<Worker> for WorkerResponse {
    fn from(worker: Worker) -> Self {
        Self {
            name: worker.name,
            url: worker.url,
            processors: worker.processors,
            virtualized: worker.virtualized,
            ok: worker.ok,
            manual: worker.manual,
            failure_count: worker.failure_count,
            failure_notes: worker.failure_notes,
            current_job: worker.current_job.map(|id| id.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    name: String,
    processor: String,
    chroot: String,
    #[serde(default)]
    virtualized: bool,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RegisterWorkerRequest {
    name: String,
    url: String,
    processors: Vec<String>,
    #[serde(default)]
    virtualized: bool,
}

#[derive(Deserialize)]
struct ManualRequest {
    manual: bool,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            job_id: None,
            status: None,
            error: None,
        }
    }

    fn error(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                job_id: None,
                status: None,
                error: Some(error.into()),
            }),
        )
    }
}

fn store_error(e: StoreError) -> (StatusCode, Json<ActionResponse>) {
    let status = match e {
        StoreError::WorkerNotFound(_) | StoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    ActionResponse::error(status, e.to_string())
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/workers",
            get(list_workers_handler).post(register_worker_handler),
        )
        .route("/api/workers/{name}/manual", post(set_manual_handler))
        .route("/api/workers/{name}/reenable", post(reenable_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/scanners", get(scanners_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers: Vec<WorkerResponse> = state
        .store
        .workers()
        .await
        .into_iter()
        .map(WorkerResponse::from)
        .collect();
    Json(workers)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .store
        .jobs()
        .await
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn scanners_handler(State(state): State<DashboardState>) -> Json<Vec<ScanReport>> {
    Json(state.manager.reports().await)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let mut job = Job::new(payload.name, payload.processor, payload.chroot)
        .with_priority(payload.priority)
        .with_virtualized(payload.virtualized);
    job.files = payload.files;
    job.args = payload.args;
    let job_id = job.id;

    if !state.store.enqueue(job).await {
        return ActionResponse::error(StatusCode::SERVICE_UNAVAILABLE, "Job queue is at capacity");
    }
    (
        StatusCode::OK,
        Json(ActionResponse {
            job_id: Some(job_id.to_string()),
            status: Some(JobStatus::Pending),
            ..ActionResponse::ok()
        }),
    )
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return ActionResponse::error(StatusCode::BAD_REQUEST, format!("invalid job id {:?}", id));
    };
    match state.store.request_cancel(job_id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(ActionResponse {
                job_id: Some(job_id.to_string()),
                status: Some(status),
                ..ActionResponse::ok()
            }),
        ),
        Err(e) => store_error(e),
    }
}

async fn register_worker_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<RegisterWorkerRequest>,
) -> impl IntoResponse {
    if payload.processors.is_empty() {
        return ActionResponse::error(StatusCode::BAD_REQUEST, "processors must not be empty");
    }
    let processors: Vec<&str> = payload.processors.iter().map(String::as_str).collect();
    let worker =
        Worker::new(payload.name, payload.url, &processors).with_virtualized(payload.virtualized);
    let name = worker.name.clone();

    if !state.store.add_worker(worker).await {
        return ActionResponse::error(
            StatusCode::CONFLICT,
            format!("worker {} already registered", name),
        );
    }
    (StatusCode::OK, Json(ActionResponse::ok()))
}

async fn set_manual_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
    Json(payload): Json<ManualRequest>,
) -> impl IntoResponse {
    match state.store.set_manual(&name, payload.manual).await {
        Ok(()) => (StatusCode::OK, Json(ActionResponse::ok())),
        Err(e) => store_error(e),
    }
}

async fn reenable_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.reenable_worker(&name).await {
        Ok(()) => {
            tracing::info!(worker = %name, "Worker re-enabled by operator");
            (StatusCode::OK, Json(ActionResponse::ok()))
        }
        Err(e) => store_error(e),
    }
}
