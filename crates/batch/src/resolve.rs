//! Dependency resolution for candidates.
//!
//! Every surviving candidate ends up with a fully resolved dependency chain
//! (input -> background -> background's own frame budget) before any heavy
//! work starts. Failures are per candidate; the work-set builder decides
//! whether they abort the batch.

use crate::job::BackgroundRef;
use crate::logbook::{DarkCorrection, FileClass, MetadataLog, RecordNotFound};
use crate::naming::{numbered_file_name, replace_extension, CALIBRATION_SENTINELS, RAW_EXTENSION};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory searched first for the flat-field capture, relative to the working directory.
pub const CONSTS_DIR: &str = "data/consts";

/// Error type for per-candidate resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The candidate (or its background) has no log row.
    #[error(transparent)]
    RecordNotFound(#[from] RecordNotFound),

    /// The log row names no background at all.
    #[error("No background reference recorded for {0}")]
    MissingBackgroundReference(String),

    /// The background reference is neither a capture filename nor a file number.
    #[error("Invalid background reference '{reference}' for {file}")]
    InvalidBackgroundReference { file: String, reference: String },

    /// The log row of the background (or raw capture) has no frame count.
    #[error("No frame count recorded for {0}")]
    MissingFrameCount(String),

    /// The background capture is not in the data directory.
    #[error("Background file {} for {file} not found", path.display())]
    MissingBackgroundFile { file: String, path: PathBuf },
}

/// Error raised when no flat-field capture can be located.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Flatfield file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No flatfield file found (searched {})", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NoneFound(Vec<PathBuf>),
}

/// Where conversion jobs take their background from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSource {
    /// Follow each file's `Dark Correction ` entry in the log.
    FromLog,
    /// One background for every file, with a caller-supplied frame budget.
    Override { file: PathBuf, frame_budget: u32 },
}

/// Which dependencies to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveMode {
    Convert(BackgroundSource),
    Analyze,
}

/// Resolved dependencies of a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependencies {
    Convert {
        background: BackgroundRef,
    },
    Analyze {
        frame_count: u32,
        injector_distance: Option<f64>,
    },
}

/// Result of resolving one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The candidate becomes a job.
    Ready(Dependencies),
    /// The candidate is a calibration or excluded file and is not itself a job.
    Dropped(FileClass),
}

/// Resolves candidates against the metadata log and the data directory.
#[derive(Debug, Clone)]
pub struct DependencyResolver<'a> {
    log: &'a MetadataLog,
    data_dir: &'a Path,
    mode: ResolveMode,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(log: &'a MetadataLog, data_dir: &'a Path, mode: ResolveMode) -> Self {
        Self {
            log,
            data_dir,
            mode,
        }
    }

    /// Resolves a candidate by filename.
    ///
    /// Classification comes first: background, flat-field and excluded files
    /// are dropped without resolving anything else, so a background capture
    /// without its own dark reference is not an error.
    pub fn resolve(&self, file_name: &str) -> Result<Resolution, ResolveError> {
        let log_id = self.log_id(file_name);
        let class = self.log.classify(&log_id)?;
        if class != FileClass::Normal {
            return Ok(Resolution::Dropped(class));
        }

        let deps = match &self.mode {
            ResolveMode::Convert(source) => Dependencies::Convert {
                background: self.resolve_background(file_name, source)?,
            },
            ResolveMode::Analyze => {
                let record = self.log.lookup(&log_id)?;
                let frame_count = record
                    .frame_count
                    .ok_or_else(|| ResolveError::MissingFrameCount(log_id.clone()))?;
                Dependencies::Analyze {
                    frame_count,
                    injector_distance: record.injector_distance,
                }
            }
        };

        Ok(Resolution::Ready(deps))
    }

    /// Log entries are keyed by the raw capture name.
    fn log_id(&self, file_name: &str) -> String {
        match self.mode {
            ResolveMode::Convert(_) => file_name.to_string(),
            ResolveMode::Analyze => replace_extension(file_name, RAW_EXTENSION),
        }
    }

    /// Resolves the background capture and its frame budget for `file_name`.
    pub fn resolve_background(
        &self,
        file_name: &str,
        source: &BackgroundSource,
    ) -> Result<BackgroundRef, ResolveError> {
        let (path, frame_budget) = match source {
            BackgroundSource::Override { file, frame_budget } => {
                (self.data_dir.join(file), *frame_budget)
            }
            BackgroundSource::FromLog => {
                let record = self.log.lookup(file_name)?;
                let reference = record
                    .dark_correction
                    .as_ref()
                    .ok_or_else(|| ResolveError::MissingBackgroundReference(file_name.to_string()))?;
                let background_name = background_file_name(file_name, reference)?;

                let background = self.log.lookup(&background_name)?;
                let frames = background
                    .frame_count
                    .ok_or_else(|| ResolveError::MissingFrameCount(background_name.clone()))?;
                (self.data_dir.join(&background_name), frames)
            }
        };

        if !path.is_file() {
            return Err(ResolveError::MissingBackgroundFile {
                file: file_name.to_string(),
                path,
            });
        }

        Ok(BackgroundRef { path, frame_budget })
    }
}

/// Canonical background filename for a reference, zero-padding bare numbers.
pub fn background_file_name(file: &str, reference: &DarkCorrection) -> Result<String, ResolveError> {
    match reference {
        DarkCorrection::Malformed(value) => Err(ResolveError::InvalidBackgroundReference {
            file: file.to_string(),
            reference: value.clone(),
        }),
        DarkCorrection::FileName(name) => Ok(name.clone()),
        DarkCorrection::FileNumber(number) => Ok(numbered_file_name(*number)),
    }
}

/// Locates the flat-field capture for a conversion batch.
///
/// An explicit value containing `/` is a path; a bare name is looked up in
/// the data directory. Without an explicit value the first existing file of
/// `data/consts/data01624.cxd`, `<data>/_flatfield01624.cxd` and
/// `<data>/data01624.cxd` is used.
pub fn locate_flatfield(data_dir: &Path, explicit: Option<&str>) -> Result<PathBuf, CalibrationError> {
    if let Some(name) = explicit {
        let path = if name.contains('/') {
            PathBuf::from(name)
        } else {
            data_dir.join(name)
        };
        return if path.is_file() {
            Ok(path)
        } else {
            Err(CalibrationError::NotFound(path))
        };
    }

    let [flatfield_sentinel, numbered_sentinel] = CALIBRATION_SENTINELS;
    let search = vec![
        Path::new(CONSTS_DIR).join(numbered_sentinel),
        data_dir.join(flatfield_sentinel),
        data_dir.join(numbered_sentinel),
    ];

    match search.iter().find(|p| p.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(CalibrationError::NoneFound(search)),
    }
}
