//! Discovery of Markdown sources in the input directory.
//!
//! Only files directly inside the input root are considered; hidden files are
//! ignored. Results are sorted by path so sweeps submit in a stable order.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

/// Source extension accepted by the scanner (case-insensitive).
pub const MARKDOWN_EXTENSION: &str = "md";

/// A candidate Markdown file discovered during a sweep.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

/// Checks if a file has the Markdown extension (case-insensitive).
pub fn is_markdown_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(MARKDOWN_EXTENSION))
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// List Markdown files in `root`. A missing root yields nothing.
pub fn scan_markdown(root: &Path) -> Vec<ScanCandidate> {
    if !root.is_dir() {
        warn!(root = %root.display(), "input directory not found");
        return Vec::new();
    }

    let mut candidates: Vec<ScanCandidate> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "skipping unreadable input entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_markdown_file(e.path()) && !is_hidden(e.path()))
        .filter_map(|e| {
            let metadata = e.metadata().ok()?;
            Some(ScanCandidate {
                path: e.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}
