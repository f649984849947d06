//! Control API
//!
//! HTTP routes that turn external requests into submissions on the shared
//! [`Scheduler`] and report aggregated state:
//!
//! - `GET /health`: liveness
//! - `GET /status`: queue depth, active jobs, outcome counters
//! - `GET /config`, `POST /config`: active template and directories
//! - `POST /job`: convert one file from the input directory
//! - `GET /job/:id`: state of a job submitted through the API
//! - `POST /batch`: sweep the input directory now

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::fingerprint::Fingerprint;
use crate::jobs::{current_timestamp_ms, JobReport, JobStatus, Trigger};
use crate::metrics::{SharedMetrics, SystemMetrics};
use crate::metrics_server::{bind, serve_on, ServerError};
use crate::pool::{Backpressure, CompletionTicket};
use crate::scheduler::{Scheduler, Submission, SubmitError};
use crate::template::TemplateSnapshot;

/// How many API-submitted jobs `GET /job/:id` remembers.
pub const TRACKED_JOBS: usize = 1024;

/// Static facts about the running service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: u32,
    pub queue_capacity: usize,
    pub engines: Vec<String>,
    pub bypass_validation: bool,
}

impl ServiceInfo {
    pub fn new(cfg: &Config, scheduler: &Scheduler) -> Self {
        let plan = scheduler.pool().plan();
        Self {
            input_dir: cfg.paths.input_dir.clone(),
            output_dir: cfg.paths.output_dir.clone(),
            workers: plan.max_concurrent_jobs,
            queue_capacity: plan.queue_capacity,
            engines: scheduler.pool().executor().chain().labels(),
            bypass_validation: cfg.conversion.bypass_validation,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one API-submitted job, as returned by `GET /job/:id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    /// `queued` until the worker reports, then the job's status.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    pub source: PathBuf,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobView {
    fn queued(job_id: &str, source: PathBuf, fingerprint: &Fingerprint) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: "queued".to_string(),
            classification: None,
            source,
            fingerprint: fingerprint.to_string(),
            engine_used: None,
            artifact: None,
            log_path: None,
            error: None,
        }
    }

    fn finished(report: &JobReport) -> Self {
        let state = match report.status {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Degraded => "degraded",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        };
        Self {
            job_id: report.job_id.clone(),
            state: state.to_string(),
            classification: Some(report.classification().to_string()),
            source: report.source.clone(),
            fingerprint: report.fingerprint.to_string(),
            engine_used: report.engine_used.clone(),
            artifact: report.artifact.clone(),
            log_path: report.log_path.clone(),
            error: report.failure.as_ref().map(|f| f.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    order: VecDeque<String>,
    jobs: HashMap<String, JobView>,
}

/// Bounded record of jobs submitted through the API, oldest evicted first.
#[derive(Debug)]
pub struct JobTracker {
    capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::with_capacity(TRACKED_JOBS)
    }
}

impl JobTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    fn upsert(&self, view: JobView) {
        let mut inner = lock(&self.inner);
        if !inner.jobs.contains_key(&view.job_id) {
            inner.order.push_back(view.job_id.clone());
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.jobs.remove(&oldest);
                }
            }
        }
        inner.jobs.insert(view.job_id.clone(), view);
    }

    pub fn record(&self, report: &JobReport) {
        self.upsert(JobView::finished(report));
    }

    pub fn get(&self, job_id: &str) -> Option<JobView> {
        lock(&self.inner).jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by every API handler
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: SharedMetrics,
    pub info: Arc<ServiceInfo>,
    pub jobs: Arc<JobTracker>,
    background: Arc<Mutex<JoinSet<()>>>,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>, metrics: SharedMetrics, info: ServiceInfo) -> Self {
        Self {
            scheduler,
            metrics,
            info: Arc::new(info),
            jobs: Arc::new(JobTracker::default()),
            background: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Record `ticket` as queued and replace it with its report when done.
    fn track(&self, source: PathBuf, ticket: CompletionTicket) {
        self.jobs.upsert(JobView::queued(ticket.job_id(), source, ticket.fingerprint()));
        let jobs = self.jobs.clone();
        self.spawn(async move {
            if let Some(report) = ticket.wait().await {
                jobs.record(&report);
            }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut set = lock(&self.background);
        while let Some(finished) = set.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "API background task failed");
            }
        }
        set.spawn(task);
    }

    /// Wait for API-triggered sweeps and job trackers to finish.
    pub async fn drain(&self) {
        let mut set = std::mem::take(&mut *lock(&self.background));
        while let Some(finished) = set.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "API background task failed");
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Counters {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub degraded: u64,
    /// `failed` split by classification: `input_error`, `validation_error`,
    /// `resource_error`, `terminal_failure`, `worker_crashed`.
    pub failed_by_kind: BTreeMap<String, u64>,
    pub template_validation_failures: u64,
    pub validation_bypassed: u64,
    pub cache_write_errors: u64,
}

/// Body of `GET /status`
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_secs: f64,
    pub queue_depth: usize,
    pub active_jobs: usize,
    pub in_flight: usize,
    pub counters: Counters,
    pub engine_usage: BTreeMap<String, u64>,
    pub last_success_unix_ms: Option<i64>,
    pub system: SystemMetrics,
}

/// Body of `GET /config` and `POST /config`
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub template_file: Option<PathBuf>,
    pub template_fingerprint: Option<String>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: u32,
    pub queue_capacity: usize,
    pub engines: Vec<String>,
    pub bypass_validation: bool,
}

/// Body of `POST /config`. An empty `template_file` clears the template.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub template_file: Option<String>,
}

/// Body of `POST /job`
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub file_path: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub force: bool,
}

/// Body of every `POST /job` and `POST /batch` response
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResponse {
    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }
}

fn error_response(status: StatusCode, label: &str, message: impl Into<String>) -> Response {
    let body = JobResponse {
        error: Some(message.into()),
        ..JobResponse::with_status(label)
    };
    (status, Json(body)).into_response()
}

/// HTTP status for a rejected submission.
pub fn submit_error_status(err: &SubmitError) -> StatusCode {
    match err {
        SubmitError::Input(_) | SubmitError::Template(_) => StatusCode::BAD_REQUEST,
        SubmitError::QueueFull | SubmitError::Closed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let m = state.metrics.snapshot().await;
    Json(StatusResponse {
        status: "running".to_string(),
        uptime_secs: m.uptime_secs(current_timestamp_ms()),
        queue_depth: m.queue_depth,
        active_jobs: m.active_jobs,
        in_flight: state.scheduler.pool().in_flight_count(),
        counters: Counters {
            processed: m.files_processed_total,
            failed: m.files_failed_total,
            skipped: m.files_skipped_total,
            degraded: m.files_degraded_total,
            failed_by_kind: m.failures_by_kind,
            template_validation_failures: m.template_validation_failures_total,
            validation_bypassed: m.validation_bypassed_total,
            cache_write_errors: m.cache_write_errors_total,
        },
        engine_usage: m.engine_usage,
        last_success_unix_ms: m.last_success_unix_ms,
        system: m.system,
    })
}

async fn config_response(state: &ApiState) -> ConfigResponse {
    let template = state.scheduler.template_snapshot().await.ok().flatten();
    ConfigResponse {
        template_file: state.scheduler.template().await,
        template_fingerprint: template.map(|t| t.fingerprint),
        input_dir: state.info.input_dir.clone(),
        output_dir: state.info.output_dir.clone(),
        workers: state.info.workers,
        queue_capacity: state.info.queue_capacity,
        engines: state.info.engines.clone(),
        bypass_validation: state.info.bypass_validation,
    }
}

async fn get_config(State(state): State<ApiState>) -> Json<ConfigResponse> {
    Json(config_response(&state).await)
}

/// The new template is only read here to reject unreadable paths; it is
/// validated when the next job uses it.
async fn post_config(State(state): State<ApiState>, Json(update): Json<ConfigUpdate>) -> Response {
    match update.template_file.as_deref().map(str::trim) {
        None => {}
        Some("") => state.scheduler.set_template(None).await,
        Some(path) => {
            let path = PathBuf::from(path);
            if let Err(e) = TemplateSnapshot::read(&path) {
                warn!(template = %path.display(), error = %e, "rejected template update");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "rejected",
                    format!("cannot read template {}: {}", path.display(), e),
                );
            }
            state.scheduler.set_template(Some(path)).await;
        }
    }
    Json(config_response(&state).await).into_response()
}

async fn post_job(State(state): State<ApiState>, Json(req): Json<JobRequest>) -> Response {
    let path = match state.scheduler.resolve_input_path(&req.file_path) {
        Ok(path) => path,
        Err(e) => {
            state.metrics.record_rejection(e.kind()).await;
            return error_response(submit_error_status(&e), e.kind(), e.to_string());
        }
    };

    match state
        .scheduler
        .submit_file(&path, req.force, Trigger::Api, Backpressure::Reject)
        .await
    {
        Ok(Submission::Queued(ticket)) => {
            let body = JobResponse {
                job_id: Some(ticket.job_id().to_string()),
                fingerprint: Some(ticket.fingerprint().to_string()),
                ..JobResponse::with_status("accepted")
            };
            state.track(path, ticket);
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Ok(Submission::Skipped(report)) => {
            state.jobs.record(&report);
            let body = JobResponse {
                job_id: Some(report.job_id),
                fingerprint: Some(report.fingerprint.to_string()),
                artifact: report.artifact,
                ..JobResponse::with_status("skipped")
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(Submission::InFlight(fp)) => {
            let body = JobResponse {
                fingerprint: Some(fp.to_string()),
                ..JobResponse::with_status("in_flight")
            };
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        Err(e) => error_response(submit_error_status(&e), e.kind(), e.to_string()),
    }
}

async fn get_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    match state.jobs.get(&job_id) {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown_job", format!("no job {}", job_id)),
    }
}

async fn post_batch(State(state): State<ApiState>, body: Option<Json<BatchRequest>>) -> Response {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let scheduler = state.scheduler.clone();
    let jobs = state.jobs.clone();
    state.spawn(async move {
        let summary = scheduler.run_sweep(force, Trigger::Api).await;
        for report in summary.reports() {
            jobs.record(report);
        }
        info!(
            files = summary.outcomes.len(),
            succeeded = summary.count(JobStatus::Succeeded),
            degraded = summary.count(JobStatus::Degraded),
            skipped = summary.count(JobStatus::Skipped),
            failed = summary.failure_count(),
            force,
            "API-triggered sweep finished"
        );
    });
    (StatusCode::ACCEPTED, Json(JobResponse::with_status("started"))).into_response()
}

/// Creates the control API router
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/config", get(get_config).post(post_config))
        .route("/job", post(post_job))
        .route("/job/:id", get(get_job))
        .route("/batch", post(post_batch))
        .with_state(state)
}

/// Serve the control API on a bound listener until `shutdown` flips to true
pub async fn serve_api(
    listener: TcpListener,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    serve_on(listener, create_api_router(state), shutdown, "api").await
}

/// Runs the control API until `shutdown` flips to true
pub async fn run_api_server(
    addr: SocketAddr,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    serve_api(bind(addr).await?, state, shutdown).await
}
