//! Worker planning.
//!
//! Derives the worker-pool size from the detected core count, the configured
//! worker count and the size of the work set.

use crate::config::Config;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of jobs allowed to run at once
    pub workers: u32,
}

impl WorkerPlan {
    /// Derive a worker plan for `job_count` jobs
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Uses the configured worker count when non-zero, the core count otherwise
    /// - Never plans more workers than jobs, and never fewer than one
    pub fn derive(cfg: &Config, job_count: usize) -> Self {
        Self::with_cores(cfg.dispatch.workers, num_cpus::get() as u32, job_count)
    }

    /// Same as [`WorkerPlan::derive`] with an explicit core count.
    pub fn with_cores(configured: u32, total_cores: u32, job_count: usize) -> Self {
        let requested = if configured > 0 {
            configured
        } else {
            total_cores
        };
        let job_cap = u32::try_from(job_count).unwrap_or(u32::MAX);

        Self {
            total_cores,
            workers: requested.min(job_cap).max(1),
        }
    }
}
