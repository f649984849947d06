//! Conversion engines and the static fallback chain.
//!
//! An [`Engine`] turns one Markdown source into one artifact at a path chosen
//! by the executor. Engines only report how the process ended; deciding
//! whether the attempt produced a usable artifact is the executor's job.

pub mod pandoc;

pub use pandoc::{build_pandoc_command, run_with_timeout, PandocDocx, PandocLatex, ProcessOutput};

use crate::jobs::{step_label, AttemptStatus};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for engine process handling
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine process could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine exceeded its per-attempt timeout and was killed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// IO error while collecting process output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs for one engine invocation.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub source: &'a Path,
    /// `None` converts without a template.
    pub template: Option<&'a Path>,
    pub output: &'a Path,
    pub timeout: Duration,
}

/// How an engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// Human-readable command line, for the job log.
    pub command: String,
    /// [`AttemptStatus::Succeeded`] here only means a clean exit.
    pub exit: AttemptStatus,
    pub diagnostics: String,
}

/// Capability to convert a source document into an artifact.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name used in attempt labels and per-engine usage metrics.
    fn name(&self) -> &str;

    /// File extension of the produced artifact.
    fn output_extension(&self) -> &str {
        "pdf"
    }

    /// Whether success from this engine is a degraded outcome.
    fn is_degraded(&self) -> bool {
        false
    }

    async fn invoke(&self, invocation: Invocation<'_>) -> InvocationResult;
}

/// One position in the fallback chain.
#[derive(Clone)]
pub struct FallbackStep {
    pub engine: Arc<dyn Engine>,
    pub with_template: bool,
}

impl FallbackStep {
    pub fn new(engine: Arc<dyn Engine>, with_template: bool) -> Self {
        Self {
            engine,
            with_template,
        }
    }

    pub fn label(&self) -> String {
        step_label(self.engine.name(), self.with_template)
    }
}

impl std::fmt::Debug for FallbackStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Fixed, totally ordered sequence of engine attempts.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    steps: Vec<FallbackStep>,
}

impl FallbackChain {
    pub fn new(steps: Vec<FallbackStep>) -> Self {
        Self { steps }
    }

    /// Every PDF engine with the template, then every PDF engine without it,
    /// then the DOCX converter.
    pub fn pandoc(pandoc_binary: &str, pdf_engines: &[String]) -> Self {
        let latex: Vec<Arc<dyn Engine>> = pdf_engines
            .iter()
            .map(|e| Arc::new(PandocLatex::new(pandoc_binary, e)) as Arc<dyn Engine>)
            .collect();

        let mut steps = Vec::with_capacity(latex.len() * 2 + 1);
        steps.extend(latex.iter().map(|e| FallbackStep::new(e.clone(), true)));
        steps.extend(latex.iter().map(|e| FallbackStep::new(e.clone(), false)));
        steps.push(FallbackStep::new(
            Arc::new(PandocDocx::new(pandoc_binary)),
            false,
        ));
        Self { steps }
    }

    pub fn steps(&self) -> &[FallbackStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step labels in order; part of every job fingerprint.
    pub fn labels(&self) -> Vec<String> {
        self.steps.iter().map(FallbackStep::label).collect()
    }
}
