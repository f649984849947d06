//! Process-wide metrics registry.
//!
//! [`Metrics`] is created once at startup and handed to the pool, executor,
//! scheduler and HTTP surfaces. Every event updates two views together: a
//! [`MetricsSnapshot`] served as JSON by `/status`, and a Prometheus
//! [`Registry`] encoded by `/metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `md2pdf_files_processed_total` | Counter | |
//! | `md2pdf_files_failed_total` | Counter | |
//! | `md2pdf_files_skipped_total` | Counter | |
//! | `md2pdf_files_degraded_total` | Counter | |
//! | `md2pdf_failures_total` | Counter | `kind` |
//! | `md2pdf_template_validation_failures_total` | Counter | |
//! | `md2pdf_validation_bypassed_total` | Counter | |
//! | `md2pdf_cache_write_errors_total` | Counter | |
//! | `md2pdf_engine_usage_total` | Counter | `engine` |
//! | `md2pdf_engine_attempts_total` | Counter | `step`, `outcome` |
//! | `md2pdf_processing_time_seconds_total` | Counter | |
//! | `md2pdf_queue_depth` | Gauge | |
//! | `md2pdf_active_jobs` | Gauge | |
//! | `md2pdf_uptime_seconds` | Gauge | |
//! | `md2pdf_last_success_timestamp_seconds` | Gauge | |
//! | `md2pdf_system_cpu_usage_percent` | Gauge | |
//! | `md2pdf_system_memory_usage_percent` | Gauge | |
//! | `md2pdf_system_load_average` | Gauge | `window` |

use crate::jobs::{current_timestamp_ms, AttemptStatus, JobReport, JobStatus};
use prometheus::{Counter, Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Prefix of every exported metric name.
pub const METRIC_PREFIX: &str = "md2pdf";

/// Errors from the metrics registry
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Cumulative counters and current gauges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub started_at_unix_ms: i64,
    pub files_processed_total: u64,
    pub files_failed_total: u64,
    pub files_skipped_total: u64,
    pub files_degraded_total: u64,
    /// Failed submissions by classification (`input_error`, `terminal_failure`, ...).
    pub failures_by_kind: BTreeMap<String, u64>,
    pub template_validation_failures_total: u64,
    pub validation_bypassed_total: u64,
    pub cache_write_errors_total: u64,
    /// Successful attempts by engine name.
    pub engine_usage: BTreeMap<String, u64>,
    pub queue_depth: usize,
    pub active_jobs: usize,
    pub last_success_unix_ms: Option<i64>,
    pub processing_time_ms_total: u64,
    pub system: SystemMetrics,
}

impl MetricsSnapshot {
    pub fn uptime_secs(&self, now_ms: i64) -> f64 {
        if self.started_at_unix_ms == 0 {
            return 0.0;
        }
        ((now_ms - self.started_at_unix_ms).max(0) as f64) / 1000.0
    }

    /// Fold one terminal report into the counters.
    pub fn record_report(&mut self, report: &JobReport) {
        match report.status {
            JobStatus::Succeeded => self.files_processed_total += 1,
            JobStatus::Degraded => self.files_degraded_total += 1,
            JobStatus::Skipped => {
                self.files_skipped_total += 1;
                return;
            }
            JobStatus::Failed => self.record_failure(report.classification()),
        }

        if matches!(report.status, JobStatus::Succeeded | JobStatus::Degraded) {
            if let Some(winner) = report.attempts.iter().find(|a| a.status.is_success()) {
                *self.engine_usage.entry(winner.engine.clone()).or_insert(0) += 1;
            }
            self.last_success_unix_ms = Some(report.finished_at);
        }
        self.processing_time_ms_total += report.duration_ms;
    }

    /// Count a failed submission under its classification.
    pub fn record_failure(&mut self, kind: &str) {
        self.files_failed_total += 1;
        *self.failures_by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn failures_of(&self, kind: &str) -> u64 {
        self.failures_by_kind.get(kind).copied().unwrap_or(0)
    }
}

/// Label for an attempt's outcome in `md2pdf_engine_attempts_total`.
fn attempt_outcome(status: &AttemptStatus) -> &'static str {
    match status {
        AttemptStatus::Succeeded => "succeeded",
        AttemptStatus::Exited(_) => "exited",
        AttemptStatus::Signaled => "signaled",
        AttemptStatus::TimedOut => "timed_out",
        AttemptStatus::EmptyOutput => "empty_output",
        AttemptStatus::SpawnFailed(_) => "spawn_failed",
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(format!("{}_{}", METRIC_PREFIX, name), help)
}

/// Prometheus handles, registered once.
#[derive(Clone)]
struct Exporter {
    files_processed: IntCounter,
    files_failed: IntCounter,
    files_skipped: IntCounter,
    files_degraded: IntCounter,
    failures: IntCounterVec,
    validation_failures: IntCounter,
    validation_bypassed: IntCounter,
    cache_write_errors: IntCounter,
    engine_usage: IntCounterVec,
    engine_attempts: IntCounterVec,
    processing_time: Counter,
    queue_depth: IntGauge,
    active_jobs: IntGauge,
    uptime: Gauge,
    last_success: Gauge,
    cpu_usage: Gauge,
    memory_usage: Gauge,
    load_average: GaugeVec,
}

impl Exporter {
    fn new(registry: &Registry) -> Result<Self, MetricsError> {
        fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
            let c = IntCounter::with_opts(opts(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        }
        fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, MetricsError> {
            let g = Gauge::with_opts(opts(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        }

        let failures = IntCounterVec::new(opts("failures_total", "Failed submissions by classification"), &["kind"])?;
        registry.register(Box::new(failures.clone()))?;
        let engine_usage = IntCounterVec::new(opts("engine_usage_total", "Successful conversions by engine"), &["engine"])?;
        registry.register(Box::new(engine_usage.clone()))?;
        let engine_attempts = IntCounterVec::new(
            opts("engine_attempts_total", "Fallback attempts by step label and outcome"),
            &["step", "outcome"],
        )?;
        registry.register(Box::new(engine_attempts.clone()))?;
        let processing_time = Counter::with_opts(opts("processing_time_seconds_total", "Wall-clock time spent converting"))?;
        registry.register(Box::new(processing_time.clone()))?;
        let queue_depth = IntGauge::with_opts(opts("queue_depth", "Jobs waiting for a worker"))?;
        registry.register(Box::new(queue_depth.clone()))?;
        let active_jobs = IntGauge::with_opts(opts("active_jobs", "Jobs currently executing"))?;
        registry.register(Box::new(active_jobs.clone()))?;
        let load_average = GaugeVec::new(opts("system_load_average", "Host load average"), &["window"])?;
        registry.register(Box::new(load_average.clone()))?;

        Ok(Self {
            files_processed: counter(registry, "files_processed_total", "Files converted to PDF")?,
            files_failed: counter(registry, "files_failed_total", "Submissions that ended in a failure")?,
            files_skipped: counter(registry, "files_skipped_total", "Submissions satisfied from the job cache")?,
            files_degraded: counter(registry, "files_degraded_total", "Files converted only by the DOCX fallback")?,
            failures,
            validation_failures: counter(
                registry,
                "template_validation_failures_total",
                "Jobs rejected because the template was invalid or unreadable",
            )?,
            validation_bypassed: counter(
                registry,
                "validation_bypassed_total",
                "Jobs that proceeded with an invalid template",
            )?,
            cache_write_errors: counter(
                registry,
                "cache_write_errors_total",
                "Job cache writes that failed after retries",
            )?,
            engine_usage,
            engine_attempts,
            processing_time,
            queue_depth,
            active_jobs,
            uptime: gauge(registry, "uptime_seconds", "Seconds since startup")?,
            last_success: gauge(
                registry,
                "last_success_timestamp_seconds",
                "Unix time of the last successful conversion",
            )?,
            cpu_usage: gauge(registry, "system_cpu_usage_percent", "Host CPU usage")?,
            memory_usage: gauge(registry, "system_memory_usage_percent", "Host memory usage")?,
            load_average,
        })
    }

    fn failure(&self, kind: &str) {
        self.files_failed.inc();
        self.failures.with_label_values(&[kind]).inc();
    }
}

/// The metrics registry shared across daemon components.
pub struct Metrics {
    started_at_unix_ms: i64,
    snapshot: RwLock<MetricsSnapshot>,
    registry: Registry,
    exporter: Exporter,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<Metrics>;

impl Metrics {
    /// Register every metric and start the uptime clock.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = Exporter::new(&registry)?;
        let started_at_unix_ms = current_timestamp_ms();
        Ok(Self {
            started_at_unix_ms,
            snapshot: RwLock::new(MetricsSnapshot {
                started_at_unix_ms,
                ..MetricsSnapshot::default()
            }),
            registry,
            exporter,
        })
    }

    /// Read access to the JSON view.
    pub async fn read(&self) -> RwLockReadGuard<'_, MetricsSnapshot> {
        self.snapshot.read().await
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Fold one terminal report into both views.
    pub async fn record_report(&self, report: &JobReport) {
        self.snapshot.write().await.record_report(report);

        let e = &self.exporter;
        match report.status {
            JobStatus::Succeeded => e.files_processed.inc(),
            JobStatus::Degraded => e.files_degraded.inc(),
            JobStatus::Skipped => {
                e.files_skipped.inc();
                return;
            }
            JobStatus::Failed => e.failure(report.classification()),
        }
        for attempt in &report.attempts {
            e.engine_attempts
                .with_label_values(&[attempt.label().as_str(), attempt_outcome(&attempt.status)])
                .inc();
        }
        if matches!(report.status, JobStatus::Succeeded | JobStatus::Degraded) {
            if let Some(winner) = report.attempts.iter().find(|a| a.status.is_success()) {
                e.engine_usage.with_label_values(&[winner.engine.as_str()]).inc();
            }
            e.last_success.set(report.finished_at as f64 / 1000.0);
        }
        e.processing_time.inc_by(report.duration_ms as f64 / 1000.0);
    }

    /// Count a submission rejected before it reached a worker.
    pub async fn record_rejection(&self, kind: &str) {
        self.snapshot.write().await.record_failure(kind);
        self.exporter.failure(kind);
    }

    pub async fn validation_failed(&self) {
        self.snapshot.write().await.template_validation_failures_total += 1;
        self.exporter.validation_failures.inc();
    }

    pub async fn validation_bypassed(&self) {
        self.snapshot.write().await.validation_bypassed_total += 1;
        self.exporter.validation_bypassed.inc();
    }

    pub async fn cache_write_failed(&self) {
        self.snapshot.write().await.cache_write_errors_total += 1;
        self.exporter.cache_write_errors.inc();
    }

    pub async fn job_enqueued(&self) {
        let mut m = self.snapshot.write().await;
        m.queue_depth += 1;
        self.exporter.queue_depth.set(m.queue_depth as i64);
    }

    pub async fn job_dequeued(&self) {
        let mut m = self.snapshot.write().await;
        m.queue_depth = m.queue_depth.saturating_sub(1);
        self.exporter.queue_depth.set(m.queue_depth as i64);
    }

    pub async fn job_started(&self) {
        let mut m = self.snapshot.write().await;
        m.active_jobs += 1;
        self.exporter.active_jobs.set(m.active_jobs as i64);
    }

    pub async fn job_finished(&self) {
        let mut m = self.snapshot.write().await;
        m.active_jobs = m.active_jobs.saturating_sub(1);
        self.exporter.active_jobs.set(m.active_jobs as i64);
    }

    pub async fn set_system(&self, system: SystemMetrics) {
        let e = &self.exporter;
        e.cpu_usage.set(system.cpu_usage_percent as f64);
        e.memory_usage.set(system.mem_usage_percent as f64);
        e.load_average.with_label_values(&["1m"]).set(system.load_avg_1 as f64);
        e.load_average.with_label_values(&["5m"]).set(system.load_avg_5 as f64);
        e.load_average.with_label_values(&["15m"]).set(system.load_avg_15 as f64);
        self.snapshot.write().await.system = system;
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let now = current_timestamp_ms();
        self.exporter
            .uptime
            .set(((now - self.started_at_unix_ms).max(0) as f64) / 1000.0);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Creates the shared registry with the uptime clock started now
pub fn new_shared_metrics() -> Result<SharedMetrics, MetricsError> {
    Ok(Arc::new(Metrics::new()?))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::jobs::{EngineAttempt, Job, JobFailure, JobState, Trigger};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn report(state: JobState, winner: Option<&str>) -> JobReport {
        let mut job = Job::new(
            PathBuf::from("/in/doc.md"),
            Fingerprint::compute(b"doc", None, &[]),
            None,
            false,
            Trigger::Batch,
        );
        if let Some(engine) = winner {
            job.attempts.push(EngineAttempt {
                step: 4,
                engine: engine.to_string(),
                with_template: false,
                status: AttemptStatus::Succeeded,
                duration_ms: 10,
                diagnostics: String::new(),
            });
        }
        job.state = state;
        if state == JobState::Failed {
            job.failure = Some(JobFailure::Terminal { attempts: 7 });
        }
        job.into_report(None)
    }

    fn failed_with(failure: JobFailure) -> JobReport {
        let mut r = report(JobState::Failed, None);
        r.failure = Some(failure);
        r
    }

    fn skipped() -> JobReport {
        JobReport {
            status: JobStatus::Skipped,
            ..report(JobState::Queued, None)
        }
    }

    #[test]
    fn test_record_report_counters() {
        let mut m = MetricsSnapshot::default();
        m.record_report(&report(JobState::Succeeded, Some("xelatex")));
        m.record_report(&report(JobState::Succeeded, Some("xelatex")));
        m.record_report(&report(JobState::Degraded, Some("docx")));
        m.record_report(&report(JobState::Failed, None));
        m.record_report(&skipped());

        assert_eq!(m.files_processed_total, 2);
        assert_eq!(m.files_degraded_total, 1);
        assert_eq!(m.files_failed_total, 1);
        assert_eq!(m.files_skipped_total, 1);
        assert_eq!(m.failures_of("terminal_failure"), 1);
        assert_eq!(m.engine_usage.get("xelatex"), Some(&2));
        assert_eq!(m.engine_usage.get("docx"), Some(&1));
        assert!(m.last_success_unix_ms.is_some());
    }

    #[tokio::test]
    async fn test_each_failure_kind_has_its_own_counter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_report(&failed_with(JobFailure::Validation("no class".into()))).await;
        metrics.record_report(&failed_with(JobFailure::Resource("disk full".into()))).await;
        metrics.record_report(&failed_with(JobFailure::Terminal { attempts: 7 })).await;
        metrics.record_report(&failed_with(JobFailure::Crashed("panic".into()))).await;
        metrics.record_report(&failed_with(JobFailure::Crashed("panic".into()))).await;
        metrics.record_rejection("input_error").await;

        let m = metrics.snapshot().await;
        assert_eq!(m.files_failed_total, 6);
        assert_eq!(m.failures_of("input_error"), 1);
        assert_eq!(m.failures_of("validation_error"), 1);
        assert_eq!(m.failures_of("resource_error"), 1);
        assert_eq!(m.failures_of("terminal_failure"), 1);
        assert_eq!(m.failures_of("worker_crashed"), 2);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("md2pdf_files_failed_total 6\n"));
        assert!(text.contains("md2pdf_failures_total{kind=\"worker_crashed\"} 2\n"));
        assert!(text.contains("md2pdf_failures_total{kind=\"input_error\"} 1\n"));
    }

    #[tokio::test]
    async fn test_registry_encodes_counters_and_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.record_report(&report(JobState::Succeeded, Some("lualatex"))).await;
        metrics.record_report(&skipped()).await;
        metrics.job_enqueued().await;
        metrics.job_enqueued().await;
        metrics.job_dequeued().await;
        metrics.job_started().await;
        metrics.validation_failed().await;
        metrics.cache_write_failed().await;

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE md2pdf_files_processed_total counter"));
        assert!(text.contains("md2pdf_files_processed_total 1\n"));
        assert!(text.contains("md2pdf_files_skipped_total 1\n"));
        assert!(text.contains("md2pdf_engine_usage_total{engine=\"lualatex\"} 1\n"));
        assert!(text.lines().any(|l| l.starts_with("md2pdf_engine_attempts_total{")
            && l.contains("outcome=\"succeeded\"")
            && l.contains("step=\"lualatex\"")
            && l.ends_with(" 1")));
        assert!(text.contains("md2pdf_queue_depth 1\n"));
        assert!(text.contains("md2pdf_active_jobs 1\n"));
        assert!(text.contains("md2pdf_template_validation_failures_total 1\n"));
        assert!(text.contains("md2pdf_cache_write_errors_total 1\n"));
        assert!(text.contains("# TYPE md2pdf_uptime_seconds gauge"));

        let m = metrics.snapshot().await;
        assert_eq!(m.queue_depth, 1);
        assert_eq!(m.active_jobs, 1);
        assert_eq!(m.cache_write_errors_total, 1);
    }

    #[tokio::test]
    async fn test_gauges_never_go_negative() {
        let metrics = Metrics::new().unwrap();
        metrics.job_dequeued().await;
        metrics.job_finished().await;
        let m = metrics.snapshot().await;
        assert_eq!(m.queue_depth, 0);
        assert_eq!(m.active_jobs, 0);
        assert!(metrics.encode_text().unwrap().contains("md2pdf_queue_depth 0\n"));
    }

    #[tokio::test]
    async fn test_new_shared_metrics_starts_clock() {
        let metrics = new_shared_metrics().unwrap();
        let snapshot = metrics.read().await;
        assert!(snapshot.started_at_unix_ms > 1_577_836_800_000);
        assert_eq!(snapshot.files_processed_total, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_round_trip(
            processed in any::<u32>(),
            failed in any::<u32>(),
            queue_depth in 0usize..1000,
            active in 0usize..100,
            cpu_usage in 0.0f32..100.0,
            engines in proptest::collection::btree_map("[a-z]{1,10}", any::<u32>(), 0..4),
        ) {
            let snapshot = MetricsSnapshot {
                started_at_unix_ms: 1_701_388_800_000,
                files_processed_total: processed as u64,
                files_failed_total: failed as u64,
                engine_usage: engines.into_iter().map(|(k, v)| (k, v as u64)).collect(),
                queue_depth,
                active_jobs: active,
                system: SystemMetrics {
                    cpu_usage_percent: cpu_usage,
                    ..SystemMetrics::default()
                },
                ..MetricsSnapshot::default()
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: MetricsSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");
            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
