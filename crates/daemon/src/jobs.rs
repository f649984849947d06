//! Conversion jobs, their lifecycle states and terminal reports.
//!
//! A [`Job`] is created by a producer (batch sweep, watch pass or API call),
//! owned by exactly one worker until it reaches a terminal state, and then
//! turned into an immutable [`JobReport`]. Every report is also written to a
//! per-job log file under `<output>/logs/` for audit and replay.

use crate::fingerprint::Fingerprint;
use crate::template::TemplateSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Which producer created a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Batch,
    Watch,
    Api,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Batch => write!(f, "batch"),
            Trigger::Watch => write!(f, "watch"),
            Trigger::Api => write!(f, "api"),
        }
    }
}

/// State of a job in the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting for a worker slot.
    Queued,
    /// Preflight and template validation.
    Validating,
    /// Walking the engine fallback chain.
    Converting,
    /// A LaTeX engine produced the PDF.
    Succeeded,
    /// Only the non-LaTeX converter succeeded.
    Degraded,
    /// Rejected before conversion or every attempt failed.
    Failed,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Validating => "validating",
            JobState::Converting => "converting",
            JobState::Succeeded => "succeeded",
            JobState::Degraded => "degraded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Degraded | JobState::Failed
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job did not produce an artifact.
///
/// Engine attempt failures never appear here: they are recovered inside the
/// executor by advancing the fallback chain. Only exhaustion of the chain
/// ([`JobFailure::Terminal`]) and pre-conversion rejections propagate.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    /// Source missing or unreadable.
    #[error("input error: {0}")]
    Input(String),

    /// Active template failed validation.
    #[error("template validation failed: {0}")]
    Validation(String),

    /// Output root unusable (permissions, free space).
    #[error("resource error: {0}")]
    Resource(String),

    /// Every fallback step, including the degraded converter, failed.
    #[error("all {attempts} conversion attempts failed")]
    Terminal { attempts: usize },

    /// The worker task panicked.
    #[error("worker crashed: {0}")]
    Crashed(String),
}

impl JobFailure {
    /// Classification reported by the control surface.
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::Input(_) => "input_error",
            JobFailure::Validation(_) => "validation_error",
            JobFailure::Resource(_) => "resource_error",
            JobFailure::Terminal { .. } => "terminal_failure",
            JobFailure::Crashed(_) => "worker_crashed",
        }
    }
}

/// How a single engine attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Clean exit and a non-empty artifact.
    Succeeded,
    /// Non-zero exit code.
    Exited(i32),
    /// Killed by a signal.
    Signaled,
    /// Exceeded the per-attempt timeout and was killed.
    TimedOut,
    /// Clean exit but no (or an empty) artifact.
    EmptyOutput,
    /// The process could not be started.
    SpawnFailed(String),
}

impl AttemptStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Succeeded => write!(f, "OK"),
            AttemptStatus::Exited(code) => write!(f, "FAIL (exit code {})", code),
            AttemptStatus::Signaled => write!(f, "FAIL (terminated by signal)"),
            AttemptStatus::TimedOut => write!(f, "FAIL (timeout)"),
            AttemptStatus::EmptyOutput => write!(f, "FAIL (no output produced)"),
            AttemptStatus::SpawnFailed(e) => write!(f, "FAIL (spawn: {})", e),
        }
    }
}

/// One step of a job's fallback sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAttempt {
    /// 1-based position in the fallback chain.
    pub step: usize,
    pub engine: String,
    pub with_template: bool,
    pub status: AttemptStatus,
    pub duration_ms: u64,
    /// Combined stdout/stderr of the engine.
    pub diagnostics: String,
}

impl EngineAttempt {
    /// `xelatex+template`, `pdflatex`, `docx`.
    pub fn label(&self) -> String {
        step_label(&self.engine, self.with_template)
    }
}

pub fn step_label(engine: &str, with_template: bool) -> String {
    if with_template {
        format!("{}+template", engine)
    } else {
        engine.to_string()
    }
}

/// Final classification of a processed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Degraded,
    /// Satisfied by an existing cache entry; no engine ran.
    Skipped,
    Failed,
}

impl JobStatus {
    /// Column used in batch summaries.
    pub fn summary_tag(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "OK",
            JobStatus::Degraded => "DEGRADED",
            JobStatus::Skipped => "SKIP",
            JobStatus::Failed => "FAIL",
        }
    }
}

/// A conversion job owned by one worker slot.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: PathBuf,
    pub fingerprint: Fingerprint,
    /// Template captured at admission; the fingerprint covers these bytes.
    pub template: Option<TemplateSnapshot>,
    pub force: bool,
    pub trigger: Trigger,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    pub state: JobState,
    pub attempts: Vec<EngineAttempt>,
    pub artifact: Option<PathBuf>,
    pub failure: Option<JobFailure>,
}

impl Job {
    pub fn new(
        source: PathBuf,
        fingerprint: Fingerprint,
        template: Option<TemplateSnapshot>,
        force: bool,
        trigger: Trigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            fingerprint,
            template,
            force,
            trigger,
            created_at: current_timestamp_ms(),
            state: JobState::Queued,
            attempts: Vec::new(),
            artifact: None,
            failure: None,
        }
    }

    /// Mark the job as failed with a classified reason.
    pub fn fail(&mut self, failure: JobFailure) {
        self.state = JobState::Failed;
        self.failure = Some(failure);
    }

    /// Label of the winning attempt, if any.
    pub fn engine_used(&self) -> Option<String> {
        self.attempts
            .iter()
            .find(|a| a.status.is_success())
            .map(EngineAttempt::label)
    }

    /// Freeze the job into its terminal report.
    pub fn into_report(self, log_path: Option<PathBuf>) -> JobReport {
        let status = match self.state {
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Degraded => JobStatus::Degraded,
            _ => JobStatus::Failed,
        };
        let engine_used = self.engine_used();
        let winning_step = self
            .attempts
            .iter()
            .find(|a| a.status.is_success())
            .map(|a| a.step);
        let finished_at = current_timestamp_ms();
        JobReport {
            job_id: self.id,
            source: self.source,
            fingerprint: self.fingerprint,
            trigger: self.trigger,
            status,
            engine_used,
            winning_step,
            artifact: self.artifact,
            failure: self.failure,
            attempts: self.attempts,
            duration_ms: (finished_at - self.created_at).max(0) as u64,
            finished_at,
            log_path,
        }
    }

    /// Report for a job satisfied from the cache without running.
    pub fn into_skipped_report(self, artifact: Option<PathBuf>, log_path: Option<PathBuf>) -> JobReport {
        let mut report = self.into_report(log_path);
        report.status = JobStatus::Skipped;
        report.artifact = artifact;
        report.failure = None;
        report
    }
}

/// Immutable record of a terminal job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub source: PathBuf,
    pub fingerprint: Fingerprint,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub engine_used: Option<String>,
    pub winning_step: Option<usize>,
    pub artifact: Option<PathBuf>,
    pub failure: Option<JobFailure>,
    pub attempts: Vec<EngineAttempt>,
    pub duration_ms: u64,
    pub finished_at: i64,
    pub log_path: Option<PathBuf>,
}

impl JobReport {
    /// Most specific classification for status views.
    pub fn classification(&self) -> &'static str {
        match (&self.status, &self.failure) {
            (JobStatus::Failed, Some(f)) => f.kind(),
            (JobStatus::Failed, None) => "terminal_failure",
            (JobStatus::Succeeded, _) => "succeeded",
            (JobStatus::Degraded, _) => "degraded",
            (JobStatus::Skipped, _) => "skipped",
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// File stem with every character outside `[A-Za-z0-9-_.]` replaced by `_`.
pub fn safe_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Artifact location for a job; distinct fingerprints never collide.
pub fn artifact_path(output_dir: &Path, source: &Path, fp: &Fingerprint, extension: &str) -> PathBuf {
    output_dir.join(format!("{}.{}.{}", safe_stem(source), fp.short(), extension))
}

/// Per-job audit log, buffered in memory and written once the job is terminal.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    buf: String,
}

impl JobLog {
    /// `<logs_dir>/<unix_secs>.<stem>.<fp12>.log`
    pub fn new(logs_dir: &Path, job: &Job) -> Self {
        let secs = job.created_at / 1000;
        let path = logs_dir.join(format!(
            "{}.{}.{}.log",
            secs,
            safe_stem(&job.source),
            job.fingerprint.short()
        ));
        let mut log = Self {
            path,
            buf: String::new(),
        };
        log.line(format!(
            "job {} source={} fingerprint={} trigger={} force={}",
            job.id,
            job.source.display(),
            job.fingerprint,
            job.trigger,
            job.force
        ));
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        self.buf.push_str(text);
        if !text.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    pub fn attempt(&mut self, attempt: &EngineAttempt, command: &str) {
        let _ = write!(
            self.buf,
            "=== STEP {} [{}] ===\n{}\n=== OUTPUT ===\n{}\n=== RESULT === {} ({:.2}s)\n",
            attempt.step,
            attempt.label(),
            command,
            attempt.diagnostics.trim_end(),
            attempt.status,
            attempt.duration_ms as f64 / 1000.0
        );
    }

    /// Write the buffered log to disk.
    pub fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &self.buf)
    }

    pub fn contents(&self) -> &str {
        &self.buf
    }
}
