//! Job producers: batch sweep, watch loop and single-file submissions.
//!
//! All three go through [`Scheduler::admit`], so a file's fingerprint, cache
//! check and in-flight exclusion are the same whatever triggered it.

use crate::cache::JobCache;
use crate::fingerprint::Fingerprint;
use crate::jobs::{Job, JobReport, JobStatus, Trigger};
use crate::metrics::SharedMetrics;
use crate::pool::{AdmitError, Backpressure, CompletionTicket, WorkerPool};
use crate::scan::{is_markdown_file, scan_markdown};
use crate::template::TemplateSnapshot;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Result of submitting one file
#[derive(Debug)]
pub enum Submission {
    /// Admitted into the pool.
    Queued(CompletionTicket),
    /// An earlier outcome for the same fingerprint satisfies it.
    Skipped(JobReport),
    /// The same fingerprint is already queued or running.
    InFlight(Fingerprint),
}

/// Error type for rejected submissions
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Input(String),

    /// The active template cannot be read.
    #[error("{0}")]
    Template(String),

    #[error("intake queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    Closed,
}

impl SubmitError {
    /// Label used in API error bodies and the `failures_total` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Input(_) => "input_error",
            SubmitError::Template(_) => "validation_error",
            SubmitError::QueueFull => "queue_full",
            SubmitError::Closed => "shutting_down",
        }
    }
}

/// Per-file result of a batch run.
#[derive(Debug)]
pub enum FileOutcome {
    Finished(JobReport),
    /// Identical content was already being converted for another file.
    Coalesced { source: PathBuf, fingerprint: Fingerprint },
    Rejected { source: PathBuf, reason: String },
}

impl FileOutcome {
    pub fn source(&self) -> &Path {
        match self {
            FileOutcome::Finished(r) => &r.source,
            FileOutcome::Coalesced { source, .. } | FileOutcome::Rejected { source, .. } => source,
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            FileOutcome::Finished(r) => r.status == JobStatus::Failed,
            FileOutcome::Coalesced { .. } => false,
            FileOutcome::Rejected { .. } => true,
        }
    }

    /// `STATUS\tpath\tartifact\tlog`
    pub fn summary_line(&self) -> String {
        fn opt(p: &Option<PathBuf>) -> String {
            p.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string())
        }
        match self {
            FileOutcome::Finished(r) => format!(
                "{}\t{}\t{}\t{}",
                r.status.summary_tag(),
                r.source.display(),
                opt(&r.artifact),
                opt(&r.log_path)
            ),
            FileOutcome::Coalesced { source, fingerprint } => {
                format!("SKIP\t{}\t-\tsame content as {}", source.display(), fingerprint.short())
            }
            FileOutcome::Rejected { source, reason } => {
                format!("FAIL\t{}\t-\t{}", source.display(), reason)
            }
        }
    }
}

/// Everything a batch run did, in submission order.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<FileOutcome>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(FileOutcome::is_failure)
    }

    /// Process exit code for batch mode.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            2
        } else {
            0
        }
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Reports of the files that finished or were skipped.
    pub fn reports(&self) -> impl Iterator<Item = &JobReport> {
        self.outcomes.iter().filter_map(|o| match o {
            FileOutcome::Finished(r) => Some(r),
            _ => None,
        })
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, FileOutcome::Finished(r) if r.status == status))
            .count()
    }

    pub fn lines(&self) -> Vec<String> {
        self.outcomes.iter().map(FileOutcome::summary_line).collect()
    }
}

/// What one watch pass did
#[derive(Debug, Default)]
pub struct WatchPass {
    pub submitted: Vec<CompletionTicket>,
    /// Same fingerprint as last pass and already satisfied or running.
    pub unchanged: usize,
    pub skipped: usize,
    pub in_flight: usize,
    pub rejected: usize,
}

/// Turns files into jobs for the worker pool
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    cache: Arc<JobCache>,
    metrics: SharedMetrics,
    input_dir: PathBuf,
    template: RwLock<Option<PathBuf>>,
    chain_labels: Vec<String>,
}

impl Scheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        cache: Arc<JobCache>,
        metrics: SharedMetrics,
        input_dir: PathBuf,
        template: Option<PathBuf>,
    ) -> Self {
        let chain_labels = pool.executor().chain().labels();
        Self {
            pool,
            cache,
            metrics,
            input_dir,
            template: RwLock::new(template),
            chain_labels,
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn template(&self) -> Option<PathBuf> {
        self.template.read().await.clone()
    }

    /// Replace the active template. Jobs already admitted keep the snapshot
    /// they were fingerprinted with.
    pub async fn set_template(&self, template: Option<PathBuf>) {
        info!(template = ?template, "active template changed");
        *self.template.write().await = template;
    }

    /// Read the active template.
    ///
    /// A configured template that cannot be read is an error: converting
    /// without it would produce a PDF the caller did not ask for.
    pub async fn template_snapshot(&self) -> Result<Option<TemplateSnapshot>, SubmitError> {
        let Some(path) = self.template().await else {
            return Ok(None);
        };
        TemplateSnapshot::read(&path)
            .map(Some)
            .map_err(|e| SubmitError::Template(format!("cannot read template {}: {}", path.display(), e)))
    }

    /// Count a file turned away because the template is unreadable.
    async fn reject_for_template(&self, source: &Path, err: &SubmitError) {
        self.metrics.validation_failed().await;
        self.metrics.record_rejection(err.kind()).await;
        warn!(path = %source.display(), error = %err, failure = err.kind(), "job rejected");
    }

    /// Fingerprint of a source under a template and the current engine chain.
    pub fn fingerprint(&self, source: &[u8], template: Option<&TemplateSnapshot>) -> Fingerprint {
        let extra: Vec<&str> = self.chain_labels.iter().map(String::as_str).collect();
        Fingerprint::compute(source, template.map(|t| t.bytes.as_slice()), &extra)
    }

    /// Resolve an externally named file against the input root.
    ///
    /// Relative paths are taken relative to the input directory. The result
    /// must be an existing `.md` file inside the root after symlinks and
    /// `..` are resolved.
    pub fn resolve_input_path(&self, file_path: &str) -> Result<PathBuf, SubmitError> {
        let requested = Path::new(file_path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.input_dir.join(requested)
        };

        let root = self.input_dir.canonicalize().map_err(|e| {
            SubmitError::Input(format!("input directory {} unavailable: {}", self.input_dir.display(), e))
        })?;
        let resolved = joined
            .canonicalize()
            .map_err(|e| SubmitError::Input(format!("cannot resolve {}: {}", file_path, e)))?;

        if !resolved.starts_with(&root) {
            return Err(SubmitError::Input(format!("{} is outside the input directory", file_path)));
        }
        if !is_markdown_file(&resolved) {
            return Err(SubmitError::Input(format!("{} is not a Markdown (.md) file", file_path)));
        }
        if !resolved.is_file() {
            return Err(SubmitError::Input(format!("{} is not a regular file", file_path)));
        }
        Ok(resolved)
    }

    /// Submit one file with the active template.
    pub async fn submit_file(
        &self,
        path: &Path,
        force: bool,
        trigger: Trigger,
        mode: Backpressure,
    ) -> Result<Submission, SubmitError> {
        let template = match self.template_snapshot().await {
            Ok(template) => template,
            Err(e) => {
                self.reject_for_template(path, &e).await;
                return Err(e);
            }
        };
        let bytes = self.read_source(path).await?;
        let fp = self.fingerprint(&bytes, template.as_ref());
        self.admit(path.to_path_buf(), fp, template, force, trigger, mode).await
    }

    /// Submit every Markdown file in the input directory once.
    pub async fn sweep(&self, force: bool, trigger: Trigger) -> Vec<(PathBuf, Result<Submission, SubmitError>)> {
        let candidates = scan_markdown(&self.input_dir);
        let template = self.template_snapshot().await;
        info!(files = candidates.len(), force, trigger = %trigger, "sweeping input directory");

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let template = match &template {
                Ok(template) => template,
                Err(e) => {
                    self.reject_for_template(&candidate.path, e).await;
                    results.push((candidate.path, Err(e.clone())));
                    continue;
                }
            };
            let result = match self.read_source(&candidate.path).await {
                Ok(bytes) => {
                    let fp = self.fingerprint(&bytes, template.as_ref());
                    self.admit(candidate.path.clone(), fp, template.clone(), force, trigger, Backpressure::Wait)
                        .await
                }
                Err(e) => Err(e),
            };
            results.push((candidate.path, result));
        }
        results
    }

    /// One batch-mode sweep, waiting for every admitted job to finish.
    pub async fn run_batch(&self, force: bool) -> BatchSummary {
        self.run_sweep(force, Trigger::Batch).await
    }

    /// One sweep, waiting for every admitted job to finish.
    pub async fn run_sweep(&self, force: bool, trigger: Trigger) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (source, result) in self.sweep(force, trigger).await {
            let outcome = match result {
                Ok(Submission::Queued(ticket)) => match ticket.wait().await {
                    Some(report) => FileOutcome::Finished(report),
                    None => FileOutcome::Rejected {
                        source,
                        reason: "worker pool stopped before the job finished".to_string(),
                    },
                },
                Ok(Submission::Skipped(report)) => FileOutcome::Finished(report),
                Ok(Submission::InFlight(fingerprint)) => FileOutcome::Coalesced { source, fingerprint },
                Err(e) => FileOutcome::Rejected {
                    source,
                    reason: e.to_string(),
                },
            };
            summary.outcomes.push(outcome);
        }
        summary
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    ///
    /// `force_first` forces only the first pass; later passes rely on the
    /// cache.
    pub async fn watch(&self, interval: Duration, force_first: bool, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs_f64(), dir = %self.input_dir.display(), "watching input directory");
        let mut seen = HashMap::new();
        let mut force = force_first;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pass = self.watch_pass(&mut seen, force).await;
            if !pass.submitted.is_empty() || pass.rejected > 0 {
                info!(
                    submitted = pass.submitted.len(),
                    unchanged = pass.unchanged,
                    skipped = pass.skipped,
                    in_flight = pass.in_flight,
                    rejected = pass.rejected,
                    "watch pass"
                );
            }
            force = false;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("watch loop stopped");
    }

    /// One watch sweep. `seen` maps each path to the fingerprint it had on the
    /// previous pass; a file whose fingerprint is unchanged and already
    /// satisfied (or running) is a no-op and does not count as a cache skip.
    pub async fn watch_pass(&self, seen: &mut HashMap<PathBuf, Fingerprint>, force: bool) -> WatchPass {
        let candidates = scan_markdown(&self.input_dir);
        let mut pass = WatchPass::default();

        seen.retain(|path, _| candidates.iter().any(|c| &c.path == path));

        let template = match self.template_snapshot().await {
            Ok(template) => template,
            Err(e) => {
                for candidate in &candidates {
                    self.reject_for_template(&candidate.path, &e).await;
                }
                pass.rejected = candidates.len();
                return pass;
            }
        };

        for candidate in candidates {
            let bytes = match self.read_source(&candidate.path).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    pass.rejected += 1;
                    continue;
                }
            };
            let fp = self.fingerprint(&bytes, template.as_ref());

            if !force
                && seen.get(&candidate.path) == Some(&fp)
                && (self.pool.is_in_flight(&fp) || self.cache.lookup(&fp).await.is_some())
            {
                pass.unchanged += 1;
                continue;
            }
            seen.insert(candidate.path.clone(), fp.clone());

            match self
                .admit(candidate.path, fp, template.clone(), force, Trigger::Watch, Backpressure::Wait)
                .await
            {
                Ok(Submission::Queued(ticket)) => pass.submitted.push(ticket),
                Ok(Submission::Skipped(_)) => pass.skipped += 1,
                Ok(Submission::InFlight(_)) => pass.in_flight += 1,
                Err(_) => pass.rejected += 1,
            }
        }
        pass
    }

    async fn read_source(&self, path: &Path) -> Result<Vec<u8>, SubmitError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.metrics.record_rejection("input_error").await;
                warn!(path = %path.display(), error = %e, failure = "input_error", "cannot read source");
                Err(SubmitError::Input(format!("cannot read {}: {}", path.display(), e)))
            }
        }
    }

    async fn admit(
        &self,
        source: PathBuf,
        fp: Fingerprint,
        template: Option<TemplateSnapshot>,
        force: bool,
        trigger: Trigger,
        mode: Backpressure,
    ) -> Result<Submission, SubmitError> {
        if !force {
            if let Some(entry) = self.cache.lookup(&fp).await {
                debug!(path = %source.display(), fingerprint = %fp.short(), "cache skip");
                let report = Job::new(source, fp, template, false, trigger).into_skipped_report(entry.artifact, None);
                self.metrics.record_report(&report).await;
                return Ok(Submission::Skipped(report));
            }
        }

        let job = Job::new(source, fp, template, force, trigger);
        let path = job.source.clone();
        match self.pool.submit(job, mode).await {
            Ok(ticket) => {
                info!(
                    path = %path.display(),
                    fingerprint = %ticket.fingerprint().short(),
                    job_id = %ticket.job_id(),
                    trigger = %trigger,
                    force,
                    "job admitted"
                );
                Ok(Submission::Queued(ticket))
            }
            Err(AdmitError::InFlight(fp)) => {
                debug!(path = %path.display(), fingerprint = %fp.short(), "already in flight");
                Ok(Submission::InFlight(fp))
            }
            Err(AdmitError::QueueFull) => Err(SubmitError::QueueFull),
            Err(AdmitError::Closed) => Err(SubmitError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::step_label;
    use crate::testing::{scripted_chain, slow_chain, total_invocations, TestStack, TEST_TEMPLATE};
    use std::fs;

    #[tokio::test]
    async fn test_batch_end_to_end_then_cache_skip() {
        let (chain, engines) = scripted_chain([false, false, false, true, true, true, true]);
        let fx = TestStack::new(chain, true);
        fx.write("doc.md", "# Jane Doe\n\nExperience\n");

        let first = fx.scheduler.run_batch(false).await;
        assert_eq!(first.outcomes.len(), 1);
        let report = match &first.outcomes[0] {
            FileOutcome::Finished(r) => r.clone(),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.engine_used.as_deref(), Some(step_label("xelatex", false).as_str()));
        assert_eq!(report.winning_step, Some(4));
        assert_eq!(first.exit_code(), 0);

        let template = fx.scheduler.template_snapshot().await.unwrap().unwrap();
        let expected = fx.scheduler.fingerprint(b"# Jane Doe\n\nExperience\n", Some(&template));
        assert_eq!(report.fingerprint, expected);
        let entry = fx.cache.lookup(&expected).await.unwrap();
        assert_eq!(entry.engine_used.as_deref(), Some("xelatex"));

        let artifact = report.artifact.clone().unwrap();
        let mtime = fs::metadata(&artifact).unwrap().modified().unwrap();
        let invocations = total_invocations(&engines);
        assert_eq!(invocations, 4);
        let skipped_before = fx.metrics.read().await.files_skipped_total;

        let second = fx.scheduler.run_batch(false).await;
        assert_eq!(second.count(JobStatus::Skipped), 1);
        assert_eq!(total_invocations(&engines), invocations);
        assert_eq!(fx.metrics.read().await.files_skipped_total, skipped_before + 1);
        assert_eq!(fs::metadata(&artifact).unwrap().modified().unwrap(), mtime);
        assert!(second.lines()[0].starts_with("SKIP\t"));

        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_force_reconverts() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, false);
        fx.write("doc.md", "# forced");

        fx.scheduler.run_batch(false).await;
        fx.scheduler.run_batch(true).await;
        assert_eq!(total_invocations(&engines), 2);
        assert_eq!(fx.metrics.read().await.files_processed_total, 2);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_template_change_invalidates() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, true);
        fx.write("doc.md", "# cv");

        fx.scheduler.run_batch(false).await;
        let other = fx.temp.path().join("other.tex");
        fs::write(&other, TEST_TEMPLATE.replace("geometry", "hyperref")).unwrap();
        fx.scheduler.set_template(Some(other.clone())).await;
        assert_eq!(fx.scheduler.template().await, Some(other));

        let summary = fx.scheduler.run_batch(false).await;
        assert_eq!(summary.count(JobStatus::Succeeded), 1);
        assert_eq!(total_invocations(&engines), 2);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_unreadable_template_rejects_admission() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, false);
        fx.write("a.md", "# a");
        fx.write("b.md", "# b");
        let as_dir = fx.temp.path().join("template.tex");
        fs::create_dir_all(&as_dir).unwrap();
        fx.scheduler.set_template(Some(as_dir)).await;

        assert!(matches!(
            fx.scheduler.template_snapshot().await,
            Err(SubmitError::Template(_))
        ));

        let summary = fx.scheduler.run_batch(false).await;
        assert_eq!(summary.outcomes.len(), 2);
        assert!(summary
            .outcomes
            .iter()
            .all(|o| matches!(o, FileOutcome::Rejected { reason, .. } if reason.contains("cannot read template"))));
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(total_invocations(&engines), 0);
        {
            let m = fx.metrics.read().await;
            assert_eq!(m.template_validation_failures_total, 2);
            assert_eq!(m.failures_of("validation_error"), 2);
            assert_eq!(m.files_failed_total, 2);
        }

        let source = fx.temp.path().join("input/a.md");
        let err = fx
            .scheduler
            .submit_file(&source, false, Trigger::Api, Backpressure::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let mut seen = HashMap::new();
        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.rejected, 2);
        assert!(pass.submitted.is_empty());
        assert_eq!(fx.metrics.read().await.failures_of("validation_error"), 5);

        // A readable template lets the same files through.
        fx.scheduler.set_template(None).await;
        let summary = fx.scheduler.run_batch(false).await;
        assert_eq!(summary.count(JobStatus::Succeeded), 2);
        assert_eq!(total_invocations(&engines), 2);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_submissions_coalesce() {
        let (chain, engine) = slow_chain(Duration::from_millis(300));
        let fx = TestStack::new(chain, false);
        let path = fx.write("doc.md", "# one");

        let (a, b) = tokio::join!(
            fx.scheduler.submit_file(&path, false, Trigger::Api, Backpressure::Reject),
            fx.scheduler.submit_file(&path, false, Trigger::Watch, Backpressure::Reject),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let queued: Vec<_> = outcomes
            .into_iter()
            .filter_map(|s| match s {
                Submission::Queued(t) => Some(t),
                Submission::InFlight(_) => None,
                Submission::Skipped(r) => panic!("unexpected skip {:?}", r),
            })
            .collect();
        assert_eq!(queued.len(), 1);
        for t in queued {
            t.wait().await.unwrap();
        }
        assert_eq!(engine.invocations(), 1);
        assert_eq!(engine.max_concurrent(), 1);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_identical_files_in_one_batch_coalesce() {
        let (chain, engine) = slow_chain(Duration::from_millis(200));
        let fx = TestStack::new(chain, false);
        fx.write("a.md", "# same");
        fx.write("b.md", "# same");

        let summary = fx.scheduler.run_batch(false).await;
        assert_eq!(summary.outcomes.len(), 2);
        assert!(matches!(summary.outcomes[1], FileOutcome::Coalesced { .. }));
        assert!(!summary.has_failures());
        assert_eq!(engine.invocations(), 1);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batch_exit_code() {
        let (chain, _) = scripted_chain([false; 7]);
        let fx = TestStack::new(chain, false);
        fx.write("bad.md", "# nope");

        let summary = fx.scheduler.run_batch(false).await;
        assert!(summary.has_failures());
        assert_eq!(summary.exit_code(), 2);
        let line = &summary.lines()[0];
        assert!(line.starts_with("FAIL\t"));
        assert!(line.ends_with(".log"));
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_source_is_input_error() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, false);
        let result = fx
            .scheduler
            .submit_file(&fx.input().join("ghost.md"), false, Trigger::Api, Backpressure::Reject)
            .await;
        assert!(matches!(result, Err(SubmitError::Input(_))));
        assert_eq!(total_invocations(&engines), 0);
        assert_eq!(fx.metrics.read().await.files_failed_total, 1);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_input_path() {
        let (chain, _) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, false);
        let doc = fx.write("doc.md", "# x");
        fx.write("notes.txt", "x");
        fs::write(fx.temp.path().join("outside.md"), "# out").unwrap();

        let resolved = fx.scheduler.resolve_input_path("doc.md").unwrap();
        assert_eq!(resolved, doc.canonicalize().unwrap());
        assert!(fx.scheduler.resolve_input_path(doc.to_str().unwrap()).is_ok());
        assert!(fx.scheduler.resolve_input_path("../outside.md").is_err());
        assert!(fx.scheduler.resolve_input_path("notes.txt").is_err());
        assert!(fx.scheduler.resolve_input_path("ghost.md").is_err());
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_pass_diffs_against_previous_pass() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = TestStack::new(chain, false);
        let doc = fx.write("doc.md", "# v1");
        let mut seen = HashMap::new();

        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.submitted.len(), 1);
        for t in pass.submitted {
            t.wait().await.unwrap();
        }

        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.unchanged, 1);
        assert!(pass.submitted.is_empty());
        assert_eq!(fx.metrics.read().await.files_skipped_total, 0);

        fs::write(&doc, "# v2").unwrap();
        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.submitted.len(), 1);
        for t in pass.submitted {
            t.wait().await.unwrap();
        }
        assert_eq!(total_invocations(&engines), 2);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_retries_failures_each_pass() {
        let (chain, engines) = scripted_chain([false; 7]);
        let fx = TestStack::new(chain, false);
        fx.write("doc.md", "# broken");
        let mut seen = HashMap::new();

        for _ in 0..2 {
            let pass = fx.scheduler.watch_pass(&mut seen, false).await;
            assert_eq!(pass.submitted.len(), 1);
            for t in pass.submitted {
                assert_eq!(t.wait().await.unwrap().status, JobStatus::Failed);
            }
        }
        assert_eq!(total_invocations(&engines), 8);
        assert_eq!(fx.metrics.read().await.failures_of("terminal_failure"), 2);

        // Once the engine recovers, the unchanged file converts on the next pass.
        engines[3].set_succeed(true);
        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.submitted.len(), 1);
        for t in pass.submitted {
            assert_eq!(t.wait().await.unwrap().status, JobStatus::Succeeded);
        }
        assert_eq!(total_invocations(&engines), 9);
        let pass = fx.scheduler.watch_pass(&mut seen, false).await;
        assert_eq!(pass.unchanged, 1);
        fx.scheduler.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_loop_stops_on_shutdown() {
        let (chain, engines) = scripted_chain([true; 7]);
        let fx = Arc::new(TestStack::new(chain, false));
        fx.write("doc.md", "# watched");

        let (tx, rx) = watch::channel(false);
        let runner = fx.clone();
        let handle = tokio::spawn(async move {
            runner.scheduler.watch(Duration::from_millis(50), false, rx).await;
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watch loop did not stop")
            .unwrap();

        fx.scheduler.pool().shutdown().await;
        assert_eq!(total_invocations(&engines), 1);
    }
}
