//! Startup checks module for the md2pdf daemon
//!
//! Provides preflight checks run before any job is accepted:
//! - Input/output/log directory bootstrap
//! - Output root writability and free disk space
//! - Pandoc availability and TeX engine discovery
//! - PID file handling for daemon mode

use crate::config::Config;
use crate::toolchain::{available_engines, check_pandoc_available, ToolchainError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error("cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output root {0} is not writable: {1}")]
    NotWritable(PathBuf, io::Error),

    #[error("insufficient disk space at {path}: {available_mb}MB available, {required_mb}MB required")]
    InsufficientSpace {
        path: PathBuf,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("another instance is running with PID {0}")]
    AlreadyRunning(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of the toolchain checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainReport {
    pub pandoc_version: Option<String>,
    pub engines: Vec<String>,
}

/// Parse `pandoc --version` output into (major, minor).
///
/// Handles `pandoc 3.1.9`, `pandoc.exe 2.19.2` and `pandoc 3.2-nightly`.
pub fn parse_pandoc_version(version_output: &str) -> Option<(u32, u32)> {
    let first = version_output.lines().next()?;
    let mut words = first.split_whitespace();
    let program = words.next()?;
    if !program.to_lowercase().starts_with("pandoc") {
        return None;
    }
    let version = words.next()?;
    let mut numbers = version
        .split(|c: char| c == '.' || c == '-')
        .map(|part| part.parse::<u32>());
    let major = numbers.next()?.ok()?;
    let minor = numbers.next().and_then(|r| r.ok()).unwrap_or(0);
    Some((major, minor))
}

/// Create each directory (and parents) if missing.
pub fn ensure_directories<P: AsRef<Path>>(dirs: &[P]) -> Result<(), StartupError> {
    for dir in dirs {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| StartupError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Verify that files can be created in `dir`.
pub fn check_writable(dir: &Path) -> Result<(), StartupError> {
    let marker = dir.join(format!(".md2pdf-write-check-{}", std::process::id()));
    fs::write(&marker, b"")
        .and_then(|_| fs::remove_file(&marker))
        .map_err(|e| StartupError::NotWritable(dir.to_path_buf(), e))
}

/// Available space (MB) on the filesystem holding `path`, from the disk whose
/// mount point is the longest prefix of the canonical path.
pub fn available_space_mb(path: &Path) -> Option<u64> {
    let canonical = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / (1024 * 1024))
}

/// Fail when less than `min_mb` is available at `path`. A zero threshold, or
/// a filesystem sysinfo cannot see, passes.
pub fn check_disk_space(path: &Path, min_mb: u64) -> Result<(), StartupError> {
    if min_mb == 0 {
        return Ok(());
    }
    match available_space_mb(path) {
        Some(available_mb) if available_mb < min_mb => Err(StartupError::InsufficientSpace {
            path: path.to_path_buf(),
            available_mb,
            required_mb: min_mb,
        }),
        Some(_) => Ok(()),
        None => {
            warn!(path = %path.display(), "could not determine free disk space");
            Ok(())
        }
    }
}

/// Per-job resource preflight on the output root.
pub fn preflight_output(output_dir: &Path, min_free_mb: u64) -> Result<(), StartupError> {
    ensure_directories(&[output_dir])?;
    check_writable(output_dir)?;
    check_disk_space(output_dir, min_free_mb)
}

/// Pandoc must run; missing TeX engines only warn since the DOCX fallback
/// may still work.
pub fn run_toolchain_checks(cfg: &Config) -> Result<ToolchainReport, StartupError> {
    let version = check_pandoc_available(&cfg.conversion.pandoc_binary)?;
    match parse_pandoc_version(&version) {
        Some((major, minor)) => info!(major, minor, "pandoc available"),
        None => warn!(version = %version, "unrecognized pandoc version output"),
    }

    let engines = available_engines(&cfg.conversion.pdf_engines);
    if engines.is_empty() {
        warn!(
            configured = ?cfg.conversion.pdf_engines,
            "no LaTeX engine found on PATH; only DOCX fallback output is possible"
        );
    } else {
        for missing in cfg.conversion.pdf_engines.iter().filter(|e| !engines.contains(e)) {
            warn!(engine = %missing, "PDF engine not found on PATH");
        }
    }

    Ok(ToolchainReport {
        pandoc_version: Some(version),
        engines,
    })
}

/// Bootstrap directories and check the output root.
///
/// Toolchain checks are skipped when `skip_toolchain` is set.
pub fn run_startup_checks(cfg: &Config, skip_toolchain: bool) -> Result<ToolchainReport, StartupError> {
    let logs = cfg.paths.output_dir.join("logs");
    ensure_directories(&[&cfg.paths.input_dir, &cfg.paths.output_dir, &logs])?;
    check_writable(&cfg.paths.output_dir)?;
    check_disk_space(&cfg.paths.output_dir, cfg.conversion.min_free_disk_mb)?;

    if skip_toolchain {
        info!("toolchain checks skipped");
        return Ok(ToolchainReport {
            pandoc_version: None,
            engines: cfg.conversion.pdf_engines.clone(),
        });
    }
    run_toolchain_checks(cfg)
}

/// Whether a process with this PID exists.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    Path::new("/proc").join(pid.to_string()).exists()
}

/// PID file held for the lifetime of a daemon; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`. Refuses if the file names a live process;
    /// replaces it if the recorded process is gone.
    pub fn acquire(path: &Path) -> Result<Self, StartupError> {
        if let Ok(contents) = fs::read_to_string(path) {
            match contents.trim().parse::<u32>() {
                Ok(pid) if is_process_alive(pid) => return Err(StartupError::AlreadyRunning(pid)),
                Ok(pid) => warn!(pid, path = %path.display(), "removing stale PID file"),
                Err(_) => warn!(path = %path.display(), "replacing unreadable PID file"),
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        info!(path = %path.display(), pid = std::process::id(), "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_pandoc_version_parsing(major in 1u32..10, minor in 0u32..30, patch in 0u32..20) {
            let output = format!("pandoc {}.{}.{}\nFeatures: +server +lua\n", major, minor, patch);
            prop_assert_eq!(parse_pandoc_version(&output), Some((major, minor)));
        }

        #[test]
        fn prop_non_pandoc_output_rejected(word in "[a-oq-z][a-z]{2,8}", major in 1u32..10) {
            let output = format!("{} {}.0", word, major);
            prop_assert_eq!(parse_pandoc_version(&output), None);
        }
    }

    #[test]
    fn test_parse_pandoc_version_variants() {
        assert_eq!(parse_pandoc_version("pandoc.exe 2.19.2"), Some((2, 19)));
        assert_eq!(parse_pandoc_version("pandoc 3.2-nightly"), Some((3, 2)));
        assert_eq!(parse_pandoc_version("pandoc 3"), Some((3, 0)));
        assert_eq!(parse_pandoc_version(""), None);
        assert_eq!(parse_pandoc_version("pandoc"), None);
    }

    #[test]
    fn test_ensure_directories_and_writable() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");
        ensure_directories(&[&nested]).unwrap();
        assert!(nested.is_dir());
        check_writable(&nested).unwrap();
        assert_eq!(fs::read_dir(&nested).unwrap().count(), 0);
    }

    #[test]
    fn test_disk_space_threshold() {
        let temp = TempDir::new().unwrap();
        assert!(check_disk_space(temp.path(), 0).is_ok());
        let result = check_disk_space(temp.path(), u64::MAX / (1024 * 1024));
        // Either sysinfo sees the disk and rejects, or cannot see it and passes.
        if available_space_mb(temp.path()).is_some() {
            assert!(matches!(result, Err(StartupError::InsufficientSpace { .. })));
        }
    }

    #[test]
    fn test_preflight_creates_output_root() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("output");
        preflight_output(&out, 0).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn test_pidfile_lifecycle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run/md2pdf.pid");
        {
            let pid = PidFile::acquire(&path).unwrap();
            let written = fs::read_to_string(pid.path()).unwrap();
            assert_eq!(written.trim(), std::process::id().to_string());

            // Our own PID is alive, so a second acquire must refuse.
            assert!(matches!(
                PidFile::acquire(&path),
                Err(StartupError::AlreadyRunning(_))
            ));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("md2pdf.pid");
        fs::write(&path, "4294967\n").unwrap();
        let pid = PidFile::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(pid.path()).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_startup_checks_skip_toolchain() {
        let temp = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.paths.input_dir = temp.path().join("input");
        cfg.paths.output_dir = temp.path().join("output");
        cfg.conversion.min_free_disk_mb = 0;

        let report = run_startup_checks(&cfg, true).unwrap();
        assert!(report.pandoc_version.is_none());
        assert!(cfg.paths.input_dir.is_dir());
        assert!(cfg.paths.output_dir.join("logs").is_dir());
    }

    #[test]
    fn test_toolchain_check_fails_without_pandoc() {
        let mut cfg = Config::default();
        cfg.conversion.pandoc_binary = "definitely-not-pandoc-md2pdf".to_string();
        assert!(matches!(
            run_toolchain_checks(&cfg),
            Err(StartupError::Toolchain(_))
        ));
    }
}
