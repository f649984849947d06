//! md2pdf daemon
//!
//! Markdown to PDF conversion job engine: content-addressed deduplication,
//! template validation, an ordered engine fallback chain with DOCX
//! degradation, and a bounded worker pool fed by batch, watch and API
//! producers.

pub mod api;
pub mod cache;
pub mod concurrency;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod pool;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod template;
pub mod toolchain;

#[cfg(test)]
mod testing;

pub use md2pdf_config as config;
pub use md2pdf_config::Config;
pub use api::{create_api_router, run_api_server, serve_api, ApiState, JobTracker, JobView, ServiceInfo};
pub use cache::{CacheEntry, CacheError, CachedOutcome, JobCache};
pub use concurrency::{derive_plan, WorkerPlan};
pub use daemon::{wait_for_signal, Daemon, DaemonError};
pub use engine::{Engine, EngineError, FallbackChain, FallbackStep, PandocDocx, PandocLatex};
pub use executor::{ConversionExecutor, ExecutorSettings};
pub use fingerprint::Fingerprint;
pub use jobs::{EngineAttempt, Job, JobFailure, JobReport, JobState, JobStatus, Trigger};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, Metrics, MetricsError, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{bind, create_metrics_router, run_metrics_server, serve_metrics, ServerError};
pub use pool::{AdmitError, Backpressure, CompletionTicket, WorkerPool};
pub use scheduler::{BatchSummary, FileOutcome, Scheduler, Submission, SubmitError};
pub use startup::{run_startup_checks, PidFile, StartupError};
pub use template::{TemplateSnapshot, TemplateValidator, ValidationReport};
pub use toolchain::{DependencyIndex, SystemIndex};
