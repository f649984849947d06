//! Persisted fingerprint -> outcome cache.
//!
//! One JSON file per fingerprint under `<output>/logs/jobcache/`, mirrored in
//! memory so admission-time lookups never touch the disk. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write
//! leaves either the old entry or the new one.

use crate::fingerprint::Fingerprint;
use crate::jobs::{current_timestamp_ms, JobReport, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Error type for cache persistence
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome stored for a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedOutcome {
    Succeeded,
    Degraded,
    /// Terminal failure marked permanent; only written when failures are cached.
    Failed,
}

/// Persisted record of a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub outcome: CachedOutcome,
    pub source: PathBuf,
    pub artifact: Option<PathBuf>,
    pub engine_used: Option<String>,
    pub recorded_at: i64,
}

impl CacheEntry {
    /// Build an entry from a terminal report. Skipped reports have nothing new
    /// to record.
    pub fn from_report(report: &JobReport) -> Option<Self> {
        let outcome = match report.status {
            JobStatus::Succeeded => CachedOutcome::Succeeded,
            JobStatus::Degraded => CachedOutcome::Degraded,
            JobStatus::Failed => CachedOutcome::Failed,
            JobStatus::Skipped => return None,
        };
        Some(Self {
            fingerprint: report.fingerprint.clone(),
            outcome,
            source: report.source.clone(),
            artifact: report.artifact.clone(),
            engine_used: report.engine_used.clone(),
            recorded_at: current_timestamp_ms(),
        })
    }

    /// Whether this entry still satisfies a new submission. A success whose
    /// artifact has been deleted does not.
    pub fn is_satisfied(&self) -> bool {
        match self.outcome {
            CachedOutcome::Failed => true,
            CachedOutcome::Succeeded | CachedOutcome::Degraded => self
                .artifact
                .as_deref()
                .map(Path::is_file)
                .unwrap_or(false),
        }
    }
}

/// Fingerprint-keyed outcome cache.
#[derive(Debug)]
pub struct JobCache {
    dir: PathBuf,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl JobCache {
    /// Open (creating if needed) the cache directory and load every entry.
    ///
    /// Unreadable or corrupt entry files are skipped with a warning; an empty
    /// or missing directory is an empty cache.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for dirent in fs::read_dir(&dir)? {
            let path = match dirent {
                Ok(d) => d.path(),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable cache directory entry");
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_entry(&path) {
                Ok(entry) => {
                    entries.insert(entry.fingerprint.clone(), entry);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt cache entry");
                }
            }
        }

        info!(dir = %dir.display(), entries = entries.len(), "job cache loaded");
        Ok(Self {
            dir,
            entries: RwLock::new(entries),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entry for `fp` if it still satisfies a submission; stale entries
    /// (artifact gone) read as absent.
    pub async fn lookup(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        // The artifact check stats the disk; do it after the guard is gone.
        let entry = self.entries.read().await.get(fp).cloned()?;
        if entry.is_satisfied() {
            Some(entry)
        } else {
            debug!(fingerprint = %fp, "cache entry is stale; artifact missing");
            None
        }
    }

    /// Persist an entry, replacing any previous one for the same fingerprint.
    pub async fn record(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.fingerprint);
        write_atomic(&path, &serde_json::to_vec_pretty(&entry)?)?;
        self.entries
            .write()
            .await
            .insert(entry.fingerprint.clone(), entry);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fp.hex()))
    }
}

fn load_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}
