//! Conversion executor for one job.
//!
//! Drives a job through `Validating -> Converting -> {Succeeded | Degraded |
//! Failed}`. Engine attempt failures are handled here by advancing the
//! fallback chain; only pre-conversion rejections and exhaustion of the chain
//! leave this module, as the job's [`JobFailure`].

use crate::config::Config;
use crate::engine::{FallbackChain, FallbackStep, Invocation};
use crate::fingerprint::sha256_tagged;
use crate::jobs::{
    artifact_path, AttemptStatus, EngineAttempt, Job, JobFailure, JobLog, JobReport, JobState,
};
use crate::metrics::SharedMetrics;
use crate::startup::preflight_output;
use crate::template::{TemplateSnapshot, TemplateValidator};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Settings the executor needs from configuration
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub output_dir: PathBuf,
    pub attempt_timeout: Duration,
    /// Let jobs proceed with a template that failed validation
    pub bypass_validation: bool,
    pub min_free_disk_mb: u64,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            output_dir: cfg.paths.output_dir.clone(),
            attempt_timeout: Duration::from_secs(cfg.conversion.attempt_timeout_secs.max(1)),
            bypass_validation: cfg.conversion.bypass_validation,
            min_free_disk_mb: cfg.conversion.min_free_disk_mb,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    /// Where admitted template snapshots are written for the engines to read.
    pub fn templates_dir(&self) -> PathBuf {
        self.logs_dir().join("templates")
    }
}

/// Write a template snapshot to a content-addressed file so engines see the
/// exact bytes the job was fingerprinted with, even if the template changed
/// on disk since admission.
pub fn materialize_template(dir: &Path, template: &TemplateSnapshot) -> io::Result<PathBuf> {
    let hex = template
        .fingerprint
        .strip_prefix("sha256:")
        .unwrap_or(&template.fingerprint);
    let path = dir.join(format!("{}.tex", hex));
    if path.is_file() {
        return Ok(path);
    }
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tex.tmp-{}", hex, uuid::Uuid::new_v4()));
    fs::write(&tmp, template.bytes.as_slice())?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Runs the validation gate and the fallback chain for one job
pub struct ConversionExecutor {
    chain: FallbackChain,
    validator: Arc<TemplateValidator>,
    metrics: SharedMetrics,
    settings: ExecutorSettings,
}

impl ConversionExecutor {
    pub fn new(
        chain: FallbackChain,
        validator: Arc<TemplateValidator>,
        metrics: SharedMetrics,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            chain,
            validator,
            metrics,
            settings,
        }
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute a job to a terminal state and write its log.
    pub async fn execute(&self, mut job: Job) -> JobReport {
        job.state = JobState::Validating;
        let mut log = JobLog::new(&self.settings.logs_dir(), &job);

        let template_path = match self.gate(&job, &mut log).await {
            Ok(path) => path,
            Err(failure) => {
                log.line(format!("FAIL: {}", failure));
                warn!(
                    source = %job.source.display(),
                    fingerprint = %job.fingerprint,
                    failure = failure.kind(),
                    "job rejected before conversion: {}",
                    failure
                );
                job.fail(failure);
                return self.finish(job, log);
            }
        };

        job.state = JobState::Converting;
        for (index, step) in self.chain.steps().iter().enumerate() {
            if step.with_template && template_path.is_none() {
                continue;
            }
            let template = if step.with_template {
                template_path.as_deref()
            } else {
                None
            };

            let attempt = self.run_step(&job, index + 1, step, template, &mut log).await;
            let won = attempt.status.is_success();
            job.attempts.push(attempt);

            if won {
                let output = artifact_path(
                    &self.settings.output_dir,
                    &job.source,
                    &job.fingerprint,
                    step.engine.output_extension(),
                );
                if !step.with_template && template_path.is_some() {
                    log.line("NOTE: succeeded after dropping template");
                }
                match fs::read(&output) {
                    Ok(bytes) => log.line(format!(
                        "[ARTIFACT] {}={} cid={}",
                        step.engine.output_extension(),
                        output.display(),
                        sha256_tagged(&bytes)
                    )),
                    Err(e) => log.line(format!("[ARTIFACT] {} (unreadable: {})", output.display(), e)),
                }
                job.state = if step.engine.is_degraded() {
                    JobState::Degraded
                } else {
                    JobState::Succeeded
                };
                job.artifact = Some(output);
                break;
            }
        }

        if !job.state.is_terminal() {
            let attempts = job.attempts.len();
            log.line("FATAL: all conversion strategies failed");
            job.fail(JobFailure::Terminal { attempts });
        }

        self.finish(job, log)
    }

    /// Preflight and template validation. Returns the template file engines
    /// should use, if any.
    async fn gate(&self, job: &Job, log: &mut JobLog) -> Result<Option<PathBuf>, JobFailure> {
        preflight_output(&self.settings.output_dir, self.settings.min_free_disk_mb)
            .map_err(|e| JobFailure::Resource(e.to_string()))?;

        if !job.source.is_file() {
            return Err(JobFailure::Input(format!(
                "source not found: {}",
                job.source.display()
            )));
        }

        let template = match &job.template {
            Some(t) => t,
            None => {
                log.line("[DEP] No template active; converting without one");
                return Ok(None);
            }
        };

        let report = self.validator.validate(template).await;
        log.line(report.render());

        if !report.passed() {
            let reasons = report.hard_failures().join("; ");
            if self.settings.bypass_validation {
                self.metrics.validation_bypassed().await;
                log.line(format!("[DEP] Validation bypassed: {}", reasons));
                warn!(
                    template = %template.path.display(),
                    source = %job.source.display(),
                    "proceeding with invalid template: {}",
                    reasons
                );
            } else {
                self.metrics.validation_failed().await;
                return Err(JobFailure::Validation(reasons));
            }
        } else if !report.missing_dependencies.is_empty() || !report.missing_fonts.is_empty() {
            log.line("[DEP] Missing dependencies; will attempt fallbacks.");
        }

        materialize_template(&self.settings.templates_dir(), template)
            .map(Some)
            .map_err(|e| JobFailure::Resource(format!("cannot stage template: {}", e)))
    }

    async fn run_step(
        &self,
        job: &Job,
        step_number: usize,
        step: &FallbackStep,
        template: Option<&Path>,
        log: &mut JobLog,
    ) -> EngineAttempt {
        let output = artifact_path(
            &self.settings.output_dir,
            &job.source,
            &job.fingerprint,
            step.engine.output_extension(),
        );
        remove_partial(&output);

        let started = Instant::now();
        let result = step
            .engine
            .invoke(Invocation {
                source: &job.source,
                template,
                output: &output,
                timeout: self.settings.attempt_timeout,
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let status = match result.exit {
            AttemptStatus::Succeeded => match fs::metadata(&output) {
                Ok(m) if m.len() > 0 => AttemptStatus::Succeeded,
                _ => AttemptStatus::EmptyOutput,
            },
            other => other,
        };
        if !status.is_success() {
            remove_partial(&output);
        }

        let attempt = EngineAttempt {
            step: step_number,
            engine: step.engine.name().to_string(),
            with_template: step.with_template,
            status,
            duration_ms,
            diagnostics: result.diagnostics,
        };
        log.attempt(&attempt, &result.command);
        info!(
            source = %job.source.display(),
            fingerprint = %job.fingerprint.short(),
            attempt = step_number,
            engine = %attempt.label(),
            duration_ms,
            "attempt {}",
            attempt.status
        );
        attempt
    }

    fn finish(&self, job: Job, mut log: JobLog) -> JobReport {
        match job.state {
            JobState::Succeeded => info!(
                source = %job.source.display(),
                fingerprint = %job.fingerprint.short(),
                engine = job.engine_used().as_deref().unwrap_or("-"),
                outcome = "succeeded",
                "conversion finished"
            ),
            JobState::Degraded => warn!(
                source = %job.source.display(),
                fingerprint = %job.fingerprint.short(),
                outcome = "degraded",
                "only the DOCX fallback succeeded"
            ),
            _ => {
                if let Some(JobFailure::Terminal { attempts }) = &job.failure {
                    error!(
                        source = %job.source.display(),
                        fingerprint = %job.fingerprint.short(),
                        attempts,
                        outcome = "failed",
                        "all conversion attempts failed"
                    );
                }
            }
        }

        log.line(format!("OUTCOME: {}", job.state));
        let log_path = match log.persist() {
            Ok(()) => Some(log.path().to_path_buf()),
            Err(e) => {
                warn!(path = %log.path().display(), error = %e, "failed to write job log");
                None
            }
        };
        job.into_report(log_path)
    }
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::jobs::{JobStatus, Trigger};
    use crate::metrics::new_shared_metrics;
    use crate::testing::{scripted_chain, total_invocations, StaticIndex};
    use tempfile::TempDir;

    const GOOD_TEMPLATE: &str =
        "\\documentclass{article}\n\\usepackage{geometry}\n\\begin{document}\n$body$\n\\end{document}\n";

    struct Fixture {
        _temp: TempDir,
        input: PathBuf,
        output: PathBuf,
        metrics: SharedMetrics,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        let output = temp.path().join("output");
        fs::create_dir_all(&input).unwrap();
        Fixture {
            input,
            output,
            metrics: new_shared_metrics().unwrap(),
            _temp: temp,
        }
    }

    fn executor(fx: &Fixture, chain: FallbackChain, index: StaticIndex, bypass: bool) -> ConversionExecutor {
        ConversionExecutor::new(
            chain,
            Arc::new(TemplateValidator::new(Arc::new(index))),
            fx.metrics.clone(),
            ExecutorSettings {
                output_dir: fx.output.clone(),
                attempt_timeout: Duration::from_secs(5),
                bypass_validation: bypass,
                min_free_disk_mb: 0,
            },
        )
    }

    fn job(fx: &Fixture, template: Option<&str>) -> Job {
        let source = fx.input.join("doc.md");
        fs::write(&source, b"# Jane Doe\n\nEngineer.\n").unwrap();
        let snapshot = template.map(|t| {
            TemplateSnapshot::from_bytes(fx.input.join("template.tex"), t.as_bytes().to_vec())
        });
        let fp = Fingerprint::compute(
            b"# Jane Doe\n\nEngineer.\n",
            snapshot.as_ref().map(|s| s.bytes.as_slice()),
            &[],
        );
        Job::new(source, fp, snapshot, false, Trigger::Batch)
    }

    fn full_index() -> StaticIndex {
        StaticIndex::with_tex_files(&["article.cls", "geometry.sty"])
    }

    #[tokio::test]
    async fn test_first_step_success() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([true; 7]);
        let report = executor(&fx, chain, full_index(), false)
            .execute(job(&fx, Some(GOOD_TEMPLATE)))
            .await;

        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.engine_used.as_deref(), Some("xelatex+template"));
        assert_eq!(report.winning_step, Some(1));
        assert_eq!(total_invocations(&engines), 1);
        let artifact = report.artifact.unwrap();
        assert!(artifact.is_file());
        assert_eq!(artifact.extension().unwrap(), "pdf");
    }

    #[tokio::test]
    async fn test_fallback_to_degraded_keeps_order() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([false, false, false, false, false, false, true]);
        let report = executor(&fx, chain, full_index(), false)
            .execute(job(&fx, Some(GOOD_TEMPLATE)))
            .await;

        assert_eq!(report.status, JobStatus::Degraded);
        let labels: Vec<String> = report.attempts.iter().map(|a| a.label()).collect();
        assert_eq!(
            labels,
            vec![
                "xelatex+template",
                "lualatex+template",
                "pdflatex+template",
                "xelatex",
                "lualatex",
                "pdflatex",
                "docx",
            ]
        );
        let steps: Vec<usize> = report.attempts.iter().map(|a| a.step).collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(report.winning_step, Some(7));
        assert!(engines.iter().all(|e| e.invocations() == 1));
        assert_eq!(report.artifact.unwrap().extension().unwrap(), "docx");

        let log = fs::read_to_string(report.log_path.unwrap()).unwrap();
        let first = log.find("=== STEP 1 [xelatex+template]").unwrap();
        let last = log.find("=== STEP 7 [docx]").unwrap();
        assert!(first < last);
    }

    #[tokio::test]
    async fn test_all_steps_fail_is_terminal() {
        let fx = fixture();
        let (chain, _engines) = scripted_chain([false; 7]);
        let report = executor(&fx, chain, full_index(), false)
            .execute(job(&fx, Some(GOOD_TEMPLATE)))
            .await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.failure, Some(JobFailure::Terminal { attempts: 7 }));
        assert_eq!(report.classification(), "terminal_failure");
        assert!(report.artifact.is_none());
        let leftovers: Vec<_> = fs::read_dir(&fx.output)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        assert!(leftovers.is_empty(), "partial outputs must be removed");
    }

    #[tokio::test]
    async fn test_without_template_skips_template_steps() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([true, true, true, false, true, true, true]);
        let report = executor(&fx, chain, full_index(), false)
            .execute(job(&fx, None))
            .await;

        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.engine_used.as_deref(), Some("lualatex"));
        assert_eq!(report.winning_step, Some(5));
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(engines[0].invocations(), 0);
    }

    #[tokio::test]
    async fn test_missing_class_rejects_before_any_attempt() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([true; 7]);
        let exec = executor(&fx, chain, StaticIndex::with_tex_files(&["geometry.sty"]), false);

        let report = exec.execute(job(&fx, Some(GOOD_TEMPLATE))).await;
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.classification(), "validation_error");
        assert_eq!(total_invocations(&engines), 0);
        assert_eq!(fx.metrics.read().await.template_validation_failures_total, 1);

        exec.execute(job(&fx, Some(GOOD_TEMPLATE))).await;
        assert_eq!(fx.metrics.read().await.template_validation_failures_total, 2);
        assert_eq!(total_invocations(&engines), 0);
    }

    #[tokio::test]
    async fn test_bypass_validation_counts_and_converts() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([true; 7]);
        let report = executor(&fx, chain, StaticIndex::default(), true)
            .execute(job(&fx, Some(GOOD_TEMPLATE)))
            .await;

        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(total_invocations(&engines), 1);
        let m = fx.metrics.read().await;
        assert_eq!(m.validation_bypassed_total, 1);
        assert_eq!(m.template_validation_failures_total, 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_input_error() {
        let fx = fixture();
        let (chain, engines) = scripted_chain([true; 7]);
        let j = job(&fx, None);
        fs::remove_file(&j.source).unwrap();
        let report = executor(&fx, chain, full_index(), false).execute(j).await;
        assert_eq!(report.classification(), "input_error");
        assert_eq!(total_invocations(&engines), 0);
    }

    #[tokio::test]
    async fn test_unwritable_output_is_resource_error() {
        let fx = fixture();
        // A regular file where the output directory should be.
        fs::write(&fx.output, b"not a directory").unwrap();
        let (chain, engines) = scripted_chain([true; 7]);
        let report = executor(&fx, chain, full_index(), false)
            .execute(job(&fx, None))
            .await;
        assert_eq!(report.classification(), "resource_error");
        assert_eq!(total_invocations(&engines), 0);
    }

    #[tokio::test]
    async fn test_template_is_materialized_by_content() {
        let temp = TempDir::new().unwrap();
        let snap = TemplateSnapshot::from_bytes(PathBuf::from("t.tex"), GOOD_TEMPLATE.as_bytes().to_vec());
        let a = materialize_template(temp.path(), &snap).unwrap();
        let b = materialize_template(temp.path(), &snap).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs::read_to_string(&a).unwrap(), GOOD_TEMPLATE);
    }
}
