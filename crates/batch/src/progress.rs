//! Progress estimation and the batch report.
//!
//! Provides the running ETA computed on each job completion and the
//! serializable per-batch report with JSON support.

use crate::job::{JobOutcome, JobStatus};
use crate::workset::Unresolved;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Progress after one more job completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub elapsed_secs: f64,
    /// Average wall time per completed job.
    pub avg_secs: f64,
    /// Estimated time until the remaining jobs finish.
    pub eta_secs: f64,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed {}/{} files. ETA: {:.2} seconds",
            self.completed, self.total, self.eta_secs
        )
    }
}

/// Average-duration ETA over completions in any order.
#[derive(Debug, Clone)]
pub struct EtaTracker {
    started: Instant,
    total: usize,
    completed: usize,
}

impl EtaTracker {
    pub fn new(total: usize) -> Self {
        Self::starting_at(total, Instant::now())
    }

    pub fn starting_at(total: usize, started: Instant) -> Self {
        Self {
            started,
            total,
            completed: 0,
        }
    }

    /// Records one completion and returns the updated estimate.
    pub fn record(&mut self) -> Progress {
        self.completed = (self.completed + 1).min(self.total);
        estimate(self.completed, self.total, self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Elapsed time divided by completed jobs, times remaining jobs.
pub fn estimate(completed: usize, total: usize, elapsed: Duration) -> Progress {
    let elapsed_secs = elapsed.as_secs_f64();
    let avg_secs = if completed > 0 {
        elapsed_secs / completed as f64
    } else {
        0.0
    };
    let remaining = total.saturating_sub(completed);

    Progress {
        completed,
        total,
        elapsed_secs,
        avg_secs,
        eta_secs: avg_secs * remaining as f64,
    }
}

/// Outcome of one job in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub index: usize,
    pub file_name: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub duration_secs: f64,
}

/// Aggregate result of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Submission stopped early because of a fatal failure class.
    pub halted: bool,
    pub elapsed_secs: f64,
    /// Per-job outcomes, in work-set order.
    pub jobs: Vec<JobReport>,
    /// Candidates left out of the work set, with reasons.
    pub unresolved: Vec<Unresolved>,
}

impl BatchReport {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            total_jobs,
            ..Self::default()
        }
    }

    /// Adds a job outcome and updates the counts.
    pub fn record(&mut self, job: JobReport) {
        match job.outcome.status() {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
        self.jobs.push(job);
    }

    /// Sorts job entries back into work-set order.
    pub fn finish(&mut self, elapsed: Duration) {
        self.jobs.sort_by_key(|j| j.index);
        self.elapsed_secs = elapsed.as_secs_f64();
    }

    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }

    pub fn status_of(&self, file_name: &str) -> Option<JobStatus> {
        self.jobs
            .iter()
            .find(|j| j.file_name == file_name)
            .map(|j| j.outcome.status())
    }

    /// Pretty JSON rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
