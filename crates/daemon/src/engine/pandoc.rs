//! Pandoc-backed engines.
//!
//! Builds and runs `pandoc <src> -o <out> [--pdf-engine=E] [--template=T]`
//! with a hard per-attempt timeout. The child is killed when the timeout
//! fires so an attempt never outlives its budget.

use super::{Engine, EngineError, Invocation, InvocationResult};
use crate::jobs::AttemptStatus;
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// stdout followed by stderr, as written to job logs.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Build a Pandoc command.
///
/// `pdf_engine` is omitted for non-PDF targets; the output format follows the
/// output file extension.
pub fn build_pandoc_command(
    pandoc: &str,
    source: &Path,
    output: &Path,
    pdf_engine: Option<&str>,
    template: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(pandoc);
    cmd.arg(source).arg("-o").arg(output);
    if let Some(engine) = pdf_engine {
        cmd.arg(format!("--pdf-engine={}", engine));
    }
    if let Some(template) = template {
        let mut flag = std::ffi::OsString::from("--template=");
        flag.push(template.as_os_str());
        cmd.arg(flag);
    }
    cmd
}

fn render_command(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run a command to completion, killing it if `timeout` elapses first.
pub async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput, EngineError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| EngineError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ProcessOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => {
            warn!(program = %program, ?timeout, "process timed out and was killed");
            Err(EngineError::Timeout(timeout))
        }
    }
}

async fn invoke_pandoc(cmd: Command, timeout: Duration) -> InvocationResult {
    let command = render_command(&cmd);
    debug!(command = %command, "invoking engine");
    match run_with_timeout(cmd, timeout).await {
        Ok(output) => {
            let exit = if output.status.success() {
                AttemptStatus::Succeeded
            } else {
                match output.status.code() {
                    Some(code) => AttemptStatus::Exited(code),
                    None => AttemptStatus::Signaled,
                }
            };
            InvocationResult {
                command,
                exit,
                diagnostics: output.combined(),
            }
        }
        Err(EngineError::Timeout(t)) => InvocationResult {
            command,
            exit: AttemptStatus::TimedOut,
            diagnostics: format!("killed after {}s", t.as_secs()),
        },
        Err(e) => InvocationResult {
            command,
            exit: AttemptStatus::SpawnFailed(e.to_string()),
            diagnostics: String::new(),
        },
    }
}

/// Pandoc driving a LaTeX engine to produce a PDF.
#[derive(Debug, Clone)]
pub struct PandocLatex {
    pandoc: String,
    pdf_engine: String,
}

impl PandocLatex {
    pub fn new(pandoc: &str, pdf_engine: &str) -> Self {
        Self {
            pandoc: pandoc.to_string(),
            pdf_engine: pdf_engine.to_string(),
        }
    }
}

#[async_trait]
impl Engine for PandocLatex {
    fn name(&self) -> &str {
        &self.pdf_engine
    }

    async fn invoke(&self, invocation: Invocation<'_>) -> InvocationResult {
        let cmd = build_pandoc_command(
            &self.pandoc,
            invocation.source,
            invocation.output,
            Some(&self.pdf_engine),
            invocation.template,
        );
        invoke_pandoc(cmd, invocation.timeout).await
    }
}

/// Pandoc writing a word-processor document; the terminal fallback.
#[derive(Debug, Clone)]
pub struct PandocDocx {
    pandoc: String,
}

impl PandocDocx {
    pub fn new(pandoc: &str) -> Self {
        Self {
            pandoc: pandoc.to_string(),
        }
    }
}

#[async_trait]
impl Engine for PandocDocx {
    fn name(&self) -> &str {
        "docx"
    }

    fn output_extension(&self) -> &str {
        "docx"
    }

    fn is_degraded(&self) -> bool {
        true
    }

    async fn invoke(&self, invocation: Invocation<'_>) -> InvocationResult {
        // LaTeX templates do not apply to DOCX output.
        let cmd = build_pandoc_command(&self.pandoc, invocation.source, invocation.output, None, None);
        invoke_pandoc(cmd, invocation.timeout).await
    }
}
