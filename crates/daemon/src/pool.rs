//! Worker pool: one bounded intake, N concurrent workers, and at most one
//! in-flight job per fingerprint.
//!
//! A fingerprint is claimed when its job is admitted and released only after
//! the job's outcome is in the cache, so a concurrent submitter either sees
//! "already in flight" or a cache hit, never a second execution.

use crate::cache::{CacheEntry, JobCache};
use crate::concurrency::WorkerPlan;
use crate::executor::ConversionExecutor;
use crate::fingerprint::Fingerprint;
use crate::jobs::{Job, JobFailure, JobReport, JobStatus};
use crate::metrics::SharedMetrics;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Cache writes are retried this many times before being reported.
const CACHE_WRITE_ATTEMPTS: u32 = 3;

/// What a producer does when the intake is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait for room (batch and watch producers).
    Wait,
    /// Fail immediately with [`AdmitError::QueueFull`] (API callers).
    Reject,
}

/// Error type for job admission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("fingerprint {0} is already in flight")]
    InFlight(Fingerprint),

    #[error("intake queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    Closed,
}

/// Handle to await the terminal report of an admitted job.
#[derive(Debug)]
pub struct CompletionTicket {
    job_id: String,
    fingerprint: Fingerprint,
    rx: oneshot::Receiver<JobReport>,
}

impl CompletionTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait for the job's report. `None` only if the pool was torn down
    /// without draining.
    pub async fn wait(self) -> Option<JobReport> {
        self.rx.await.ok()
    }
}

type InFlightSet = Arc<Mutex<HashSet<Fingerprint>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Claim on a fingerprint; released on drop.
#[derive(Debug)]
struct InFlightGuard {
    set: InFlightSet,
    fingerprint: Fingerprint,
}

impl InFlightGuard {
    fn claim(set: &InFlightSet, fingerprint: &Fingerprint) -> Option<Self> {
        if lock(set).insert(fingerprint.clone()) {
            Some(Self {
                set: set.clone(),
                fingerprint: fingerprint.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.fingerprint);
    }
}

struct QueuedJob {
    job: Job,
    guard: InFlightGuard,
    done: oneshot::Sender<JobReport>,
}

/// Bounded concurrent execution of conversion jobs
pub struct WorkerPool {
    executor: Arc<ConversionExecutor>,
    cache: Arc<JobCache>,
    metrics: SharedMetrics,
    plan: WorkerPlan,
    semaphore: Arc<Semaphore>,
    in_flight: InFlightSet,
    intake: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    cache_failures: bool,
}

impl WorkerPool {
    /// Create the pool and start its dispatcher task.
    ///
    /// With `cache_failures` set, terminal failures are recorded as permanent
    /// and not retried until forced.
    pub fn start(
        plan: WorkerPlan,
        executor: Arc<ConversionExecutor>,
        cache: Arc<JobCache>,
        metrics: SharedMetrics,
        cache_failures: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(plan.queue_capacity.max(1));
        let pool = Arc::new(Self {
            executor,
            cache,
            metrics,
            semaphore: Arc::new(Semaphore::new(plan.max_concurrent_jobs.max(1) as usize)),
            plan,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            intake: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(None),
            cache_failures,
        });

        let handle = tokio::spawn(pool.clone().dispatch(rx));
        *lock(&pool.dispatcher) = Some(handle);
        info!(
            workers = pool.plan.max_concurrent_jobs,
            queue_capacity = pool.plan.queue_capacity,
            "worker pool started"
        );
        pool
    }

    pub fn plan(&self) -> &WorkerPlan {
        &self.plan
    }

    pub fn executor(&self) -> &ConversionExecutor {
        &self.executor
    }

    /// Get the number of idle worker slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.in_flight).contains(fingerprint)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Admit a job into the intake.
    ///
    /// Fails with [`AdmitError::InFlight`] if its fingerprint is already
    /// queued or executing.
    pub async fn submit(&self, job: Job, mode: Backpressure) -> Result<CompletionTicket, AdmitError> {
        let guard = InFlightGuard::claim(&self.in_flight, &job.fingerprint)
            .ok_or_else(|| AdmitError::InFlight(job.fingerprint.clone()))?;
        let sender = lock(&self.intake).clone().ok_or(AdmitError::Closed)?;

        let (done, rx) = oneshot::channel();
        let ticket = CompletionTicket {
            job_id: job.id.clone(),
            fingerprint: job.fingerprint.clone(),
            rx,
        };
        let queued = QueuedJob { job, guard, done };

        self.metrics.job_enqueued().await;
        // A rejected QueuedJob is dropped with the error, releasing its claim.
        let sent = match mode {
            Backpressure::Wait => sender.send(queued).await.map_err(|_| AdmitError::Closed),
            Backpressure::Reject => sender.try_send(queued).map_err(|e| match e {
                TrySendError::Full(_) => AdmitError::QueueFull,
                TrySendError::Closed(_) => AdmitError::Closed,
            }),
        };

        if let Err(e) = &sent {
            self.metrics.job_dequeued().await;
            debug!(fingerprint = %ticket.fingerprint, error = %e, "admission refused");
        }
        sent.map(|()| ticket)
    }

    /// Stop accepting jobs, run everything already admitted, and wait for
    /// all workers to finish.
    pub async fn shutdown(&self) {
        drop(lock(&self.intake).take());
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "worker pool dispatcher failed");
            }
        }
        info!("worker pool drained");
    }

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedJob>) {
        let mut workers = JoinSet::new();

        while let Some(queued) = rx.recv().await {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            self.metrics.job_dequeued().await;
            workers.spawn(self.clone().run_job(queued, permit));

            while let Some(finished) = workers.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "worker task failed");
                }
            }
        }

        while let Some(finished) = workers.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "worker task failed");
            }
        }
    }

    async fn run_job(self: Arc<Self>, queued: QueuedJob, _permit: OwnedSemaphorePermit) {
        let QueuedJob { job, guard, done } = queued;
        self.metrics.job_started().await;

        let report = match self.cached_outcome(&job).await {
            Some(entry) => {
                debug!(fingerprint = %job.fingerprint, "cache hit at execution time");
                job.into_skipped_report(entry.artifact, None)
            }
            None => self.execute_isolated(job).await,
        };

        self.metrics.job_finished().await;
        self.metrics.record_report(&report).await;
        self.persist_outcome(&report).await;

        // Release the fingerprint only once the cache reflects the outcome.
        drop(guard);
        let _ = done.send(report);
    }

    async fn cached_outcome(&self, job: &Job) -> Option<CacheEntry> {
        if job.force {
            return None;
        }
        self.cache.lookup(&job.fingerprint).await
    }

    /// Run the executor on its own task so a panic becomes a `Failed` report.
    async fn execute_isolated(&self, job: Job) -> JobReport {
        let fallback = job.clone();
        let executor = self.executor.clone();
        match tokio::spawn(async move { executor.execute(job).await }).await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    source = %fallback.source.display(),
                    fingerprint = %fallback.fingerprint,
                    error = %e,
                    "worker crashed"
                );
                let mut job = fallback;
                job.fail(JobFailure::Crashed(e.to_string()));
                job.into_report(None)
            }
        }
    }

    async fn persist_outcome(&self, report: &JobReport) {
        let cacheable = match report.status {
            JobStatus::Succeeded | JobStatus::Degraded => true,
            JobStatus::Failed => {
                self.cache_failures && matches!(report.failure, Some(JobFailure::Terminal { .. }))
            }
            JobStatus::Skipped => false,
        };
        if !cacheable {
            return;
        }
        let Some(entry) = CacheEntry::from_report(report) else {
            return;
        };

        for attempt in 1..=CACHE_WRITE_ATTEMPTS {
            match self.cache.record(entry.clone()).await {
                Ok(()) => return,
                Err(e) if attempt < CACHE_WRITE_ATTEMPTS => {
                    warn!(fingerprint = %report.fingerprint, attempt, error = %e, "cache write failed; retrying");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(e) => {
                    error!(
                        fingerprint = %report.fingerprint,
                        source = %report.source.display(),
                        error = %e,
                        "cache write failed; outcome will not be remembered"
                    );
                    self.metrics.cache_write_failed().await;
                }
            }
        }
    }
}
