//! Batch orchestration.
//!
//! Wires the pieces together for one run: preflight checks, metadata log,
//! directory scan, dependency resolution and work-set construction, then
//! dispatch. Every fatal condition is reported before the first job starts.

use crate::concurrency::WorkerPlan;
use crate::config::Config;
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::logbook::{MetadataLoadError, MetadataLog};
use crate::naming::{DERIVED_EXTENSION, RAW_EXTENSION};
use crate::output::OutputPathPlanner;
use crate::progress::BatchReport;
use crate::resolve::{locate_flatfield, BackgroundSource, CalibrationError};
use crate::runner::{JobRunner, Verbosity};
use crate::scan::{scan_candidates, ScanError, ScanSpec};
use crate::workset::{JobTemplate, RangeFilter, StrictResolutionError, WorkSet, WorkSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Error type for conditions that stop a batch before dispatch
#[derive(Debug, Error)]
pub enum BatchError {
    /// Metadata log missing or unreadable
    #[error("Metadata log error: {0}")]
    Log(#[from] MetadataLoadError),

    /// Data directory missing
    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    /// No usable flat-field capture
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Global background override missing on disk
    #[error("Background file not found: {}", .0.display())]
    MissingBackground(PathBuf),

    /// Strict resolution and a candidate did not resolve
    #[error("Resolution aborted: {0}")]
    Resolution(#[from] StrictResolutionError),

    /// Save directory could not be created
    #[error("Failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which pipeline stage a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Raw captures to derived artifacts, next to the inputs.
    Convert,
    /// Derived artifacts to analysis outputs in a save directory.
    ///
    /// Outputs live outside the data directory, so the scan cannot see them.
    /// A rerun plans every job again and each one ends `Skipped` by the
    /// per-job output check.
    Analyze,
}

impl BatchMode {
    fn scan_spec(&self, overwrite: bool) -> ScanSpec<'static> {
        match self {
            BatchMode::Convert => ScanSpec {
                input_ext: RAW_EXTENSION,
                done_ext: Some(DERIVED_EXTENSION),
                overwrite,
            },
            BatchMode::Analyze => ScanSpec {
                input_ext: DERIVED_EXTENSION,
                done_ext: None,
                overwrite,
            },
        }
    }
}

impl std::fmt::Display for BatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchMode::Convert => write!(f, "convert"),
            BatchMode::Analyze => write!(f, "analyze"),
        }
    }
}

/// Per-run inputs that do not come from the configuration file.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub mode: BatchMode,
    /// Directory holding the inputs
    pub data_dir: PathBuf,
    /// Metadata log (CSV)
    pub log_file: PathBuf,
    pub range: RangeFilter,
    /// One background for every conversion, relative to the data directory
    pub background: Option<PathBuf>,
    /// Flat-field filename or path
    pub flatfield: Option<String>,
    /// Explicit analysis save directory
    pub save_dir: Option<PathBuf>,
    /// Free-text suffix for analysis outputs
    pub suffix: Option<String>,
    pub verbosity: Verbosity,
}

impl BatchRequest {
    pub fn new(mode: BatchMode, data_dir: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            data_dir: data_dir.into(),
            log_file: log_file.into(),
            range: RangeFilter::default(),
            background: None,
            flatfield: None,
            save_dir: None,
            suffix: None,
            verbosity: Verbosity::Normal,
        }
    }
}

/// A planned batch: the work set plus what dispatch needs.
#[derive(Debug)]
pub struct BatchPlan {
    pub work_set: WorkSet,
    pub options: DispatchOptions,
    /// Save directory of an analysis batch
    pub save_dir: Option<PathBuf>,
}

/// One batch run.
#[derive(Debug, Clone)]
pub struct Batch {
    config: Config,
    request: BatchRequest,
}

impl Batch {
    pub fn new(config: Config, request: BatchRequest) -> Self {
        Self { config, request }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn request(&self) -> &BatchRequest {
        &self.request
    }

    /// Builds the work set without running anything.
    ///
    /// This performs the full planning sequence:
    /// 1. Verify the data directory and load the metadata log
    /// 2. Locate calibration inputs (conversion only)
    /// 3. Scan for not-yet-done candidates
    /// 4. Resolve dependencies and build the work set
    /// 5. Derive the worker plan
    ///
    /// # Returns
    /// * `Ok(BatchPlan)` - Work set and dispatch options
    /// * `Err(BatchError)` - A fatal condition, found before any job ran
    pub fn plan(&self) -> Result<BatchPlan, BatchError> {
        let data_dir = self.request.data_dir.as_path();
        if !data_dir.is_dir() {
            return Err(ScanError::NotADirectory(data_dir.to_path_buf()).into());
        }

        let log = MetadataLog::load(&self.request.log_file)?;
        info!(path = %self.request.log_file.display(), records = log.len(), "metadata log loaded");

        let (template, save_dir) = self.job_template(data_dir)?;

        let overwrite = self.config.dispatch.overwrite;
        let candidates = scan_candidates(data_dir, &self.request.mode.scan_spec(overwrite))?;
        info!(mode = %self.request.mode, candidates = candidates.len(), "scanned data directory");

        let work_set = WorkSetBuilder::new(&log, data_dir, template)
            .range(self.request.range)
            .overwrite(overwrite)
            .strict(self.config.resolution.strict)
            .build(candidates)?;

        let plan = WorkerPlan::derive(&self.config, work_set.len());
        let options = DispatchOptions::from_config(&self.config, plan.workers, self.request.verbosity);

        Ok(BatchPlan {
            work_set,
            options,
            save_dir,
        })
    }

    fn job_template(&self, data_dir: &Path) -> Result<(JobTemplate, Option<PathBuf>), BatchError> {
        match self.request.mode {
            BatchMode::Convert => {
                let flatfield_path = locate_flatfield(data_dir, self.request.flatfield.as_deref())?;
                info!(path = %flatfield_path.display(), "flatfield file found");

                let background = match &self.request.background {
                    Some(file) => {
                        if !data_dir.join(file).is_file() {
                            return Err(BatchError::MissingBackground(data_dir.join(file)));
                        }
                        BackgroundSource::Override {
                            file: file.clone(),
                            frame_budget: self.config.convert.bg_frames_max,
                        }
                    }
                    None => BackgroundSource::FromLog,
                };

                Ok((
                    JobTemplate::Convert {
                        background,
                        flatfield_path,
                        settings: Arc::new(self.config.convert.clone()),
                    },
                    None,
                ))
            }
            BatchMode::Analyze => {
                let analysis = &self.config.analysis;
                let suffix = self.request.suffix.as_deref();
                let planner = match &self.request.save_dir {
                    Some(dir) => OutputPathPlanner::new(dir, analysis.window_size, suffix),
                    None => OutputPathPlanner::under_root(
                        &analysis.output_root,
                        data_dir,
                        &self.request.range,
                        analysis.window_size,
                        suffix,
                    ),
                };
                let save_dir = planner.save_dir().to_path_buf();

                Ok((
                    JobTemplate::Analyze {
                        planner,
                        params: Arc::new(analysis.params.clone()),
                    },
                    Some(save_dir),
                ))
            }
        }
    }

    /// Plans and dispatches the batch.
    pub async fn run(&self, runner: Arc<dyn JobRunner>) -> Result<BatchReport, BatchError> {
        let plan = self.plan()?;

        if let Some(dir) = &plan.save_dir {
            if !plan.work_set.is_empty() {
                let conf_dir = dir.join(crate::output::CONF_DIR);
                std::fs::create_dir_all(&conf_dir).map_err(|source| BatchError::OutputDir {
                    path: conf_dir,
                    source,
                })?;
                info!(path = %dir.display(), "save directory ready");
            }
        }

        let dispatcher = Dispatcher::new(runner, plan.options);
        let mut report = dispatcher.run(plan.work_set.jobs).await;
        report.unresolved = plan.work_set.unresolved;
        Ok(report)
    }
}
