//! Concurrency planning for the conversion worker pool
//!
//! Derives the worker count and intake capacity from configuration and the
//! host's CPU count.

use crate::config::Config;

/// Upper bound on auto-derived workers; LaTeX runs are memory hungry and
/// mostly single-threaded.
pub const AUTO_WORKER_CAP: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrently executing jobs
    pub max_concurrent_jobs: u32,
    /// Bounded intake size; producers block or are rejected beyond it
    pub queue_capacity: usize,
}

impl WorkerPlan {
    /// Derive a plan from configuration, detecting cores via num_cpus
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count
    ///
    /// - explicit non-zero `max_concurrent_jobs` is used unchanged
    /// - otherwise `min(4, cores)`, at least 1
    /// - queue capacity is at least 1
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.workers.max_concurrent_jobs > 0 {
            cfg.workers.max_concurrent_jobs
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
            queue_capacity: cfg.workers.queue_capacity.max(1),
        }
    }
}

fn derive_workers(cores: u32) -> u32 {
    cores.clamp(1, AUTO_WORKER_CAP)
}

/// Public function to derive a worker plan from configuration
pub fn derive_plan(cfg: &Config) -> WorkerPlan {
    WorkerPlan::derive(cfg)
}
