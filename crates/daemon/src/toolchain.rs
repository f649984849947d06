//! Local TeX toolchain probing.
//!
//! Answers "is this package / class / font / binary available here?" for the
//! template validator, and checks that Pandoc itself runs at startup.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Result of a dependency lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Present,
    Missing,
    /// The index tool itself is unavailable, so the answer is not known.
    Unknown,
}

/// Index of locally installed TeX files, fonts and executables.
pub trait DependencyIndex: Send + Sync {
    /// Look up a TeX input file such as `geometry.sty` or `moderncv.cls`.
    fn tex_file(&self, name: &str) -> Presence;
    /// Look up a font family known to fontconfig.
    fn font(&self, family: &str) -> Presence;
    /// Look up an executable on `PATH`.
    fn binary(&self, name: &str) -> Presence;
}

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("pandoc not available: {0}")]
    PandocUnavailable(String),
}

/// Returns the full path of `cmd` if it is an executable file on `PATH`.
pub fn which(cmd: &str) -> Option<PathBuf> {
    let cmd_path = Path::new(cmd);
    if cmd_path.components().count() > 1 {
        return cmd_path.is_file().then(|| cmd_path.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

/// [`DependencyIndex`] backed by `kpsewhich` and `fc-list`.
#[derive(Debug, Default)]
pub struct SystemIndex {
    /// Lower-cased family names; `None` when fc-list could not be run.
    font_families: OnceLock<Option<Vec<String>>>,
}

impl SystemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_font_families() -> Option<Vec<String>> {
        which("fc-list")?;
        let output = Command::new("fc-list").args([":", "family"]).output().ok()?;
        if !output.status.success() {
            warn!("fc-list exited with {}; font checks disabled", output.status);
            return None;
        }
        let families = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_lowercase())
            .collect();
        Some(families)
    }
}

impl DependencyIndex for SystemIndex {
    fn tex_file(&self, name: &str) -> Presence {
        if which("kpsewhich").is_none() {
            return Presence::Unknown;
        }
        match Command::new("kpsewhich").arg(name).output() {
            Ok(output) => {
                let found = output.status.success()
                    && !String::from_utf8_lossy(&output.stdout).trim().is_empty();
                debug!(file = name, found, "kpsewhich lookup");
                if found {
                    Presence::Present
                } else {
                    Presence::Missing
                }
            }
            Err(e) => {
                warn!(file = name, error = %e, "kpsewhich failed to run");
                Presence::Unknown
            }
        }
    }

    fn font(&self, family: &str) -> Presence {
        match self.font_families.get_or_init(Self::load_font_families) {
            Some(families) => {
                let target = family.to_lowercase();
                if families.iter().any(|line| line.contains(&target)) {
                    Presence::Present
                } else {
                    Presence::Missing
                }
            }
            None => Presence::Unknown,
        }
    }

    fn binary(&self, name: &str) -> Presence {
        if which(name).is_some() {
            Presence::Present
        } else {
            Presence::Missing
        }
    }
}

/// Verify that `<pandoc> --version` executes successfully.
pub fn check_pandoc_available(pandoc: &str) -> Result<String, ToolchainError> {
    let output = Command::new(pandoc).arg("--version").output().map_err(|e| {
        ToolchainError::PandocUnavailable(format!(
            "{} --version failed; is pandoc installed and in PATH? Error: {}",
            pandoc, e
        ))
    })?;

    if !output.status.success() {
        return Err(ToolchainError::PandocUnavailable(format!(
            "{} --version exited with {}",
            pandoc, output.status
        )));
    }

    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or("pandoc (unknown version)")
        .trim()
        .to_string();
    Ok(version)
}

/// Subset of `engines` that resolve on `PATH`.
pub fn available_engines(engines: &[String]) -> Vec<String> {
    engines
        .iter()
        .filter(|e| which(e).is_some())
        .cloned()
        .collect()
}
