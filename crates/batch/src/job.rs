//! Job model: the unit of work handed to the dispatcher.
//!
//! A job is self-contained. Everything a worker needs (paths, resolved
//! calibration, parameters) is in the job itself; the only shared pieces are
//! immutable settings behind an `Arc`.

use crate::config::{ConvertConfig, FailureClass};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a worker.
    Pending,
    /// Job is currently running.
    Running,
    /// Job completed successfully.
    Succeeded,
    /// Job failed with an error.
    Failed,
    /// Job was short-circuited before any work began.
    Skipped,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Background (dark-frame) reference resolved for a conversion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundRef {
    /// Path to the background capture.
    pub path: PathBuf,
    /// Number of background frames to use.
    pub frame_budget: u32,
}

/// Raw capture to derived artifact conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertTask {
    pub background: BackgroundRef,
    /// Flat-field capture shared by the whole batch.
    pub flatfield_path: PathBuf,
    /// Conversion settings shared by the whole batch.
    pub settings: Arc<ConvertConfig>,
}

/// Per-frame analysis of a derived artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeTask {
    /// Frames recorded for the raw capture this artifact came from.
    pub frame_count: u32,
    /// Window width in pixels.
    pub window_size: u32,
    /// Where the job's configuration snapshot is written.
    pub snapshot_path: PathBuf,
    /// Injector distance recorded for the capture, if any.
    pub injector_distance: Option<f64>,
    /// Analyzer parameters shared by the whole batch.
    pub params: Arc<toml::Table>,
}

/// What a job does.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTask {
    Convert(ConvertTask),
    Analyze(AnalyzeTask),
}

impl JobTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTask::Convert(_) => "convert",
            JobTask::Analyze(_) => "analyze",
        }
    }
}

/// Represents one unit of work in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Zero-based position in the work set, used for progress numbering.
    pub index: usize,
    /// Input filename, e.g. `data00012.cxd`.
    pub file_name: String,
    /// Path to the input file.
    pub input_path: PathBuf,
    /// Path of the artifact the job produces.
    pub output_path: PathBuf,
    /// Replace an existing output instead of skipping.
    pub overwrite: bool,
    pub task: JobTask,
}

impl Job {
    /// Background reference, for conversion jobs.
    pub fn background(&self) -> Option<&BackgroundRef> {
        match &self.task {
            JobTask::Convert(convert) => Some(&convert.background),
            JobTask::Analyze(_) => None,
        }
    }
}

/// Failure details captured for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub class: FailureClass,
    /// One-line error description.
    pub message: String,
    /// Full diagnostic text (captured stderr, panic payload).
    pub diagnostic: Option<String>,
}

impl JobFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// Why a job never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// Output already exists and overwrite was not requested.
    OutputExists,
    /// The input failed its structural-validity probe.
    InvalidInput(String),
    /// The batch halted before the job started.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::OutputExists => write!(f, "output already exists"),
            SkipReason::InvalidInput(why) => write!(f, "invalid input: {}", why),
            SkipReason::Cancelled => write!(f, "batch halted before the job started"),
        }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobOutcome {
    Succeeded,
    Failed(JobFailure),
    Skipped { reason: SkipReason },
}

impl JobOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        JobOutcome::Skipped { reason }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Skipped { .. } => JobStatus::Skipped,
        }
    }
}
