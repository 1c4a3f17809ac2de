//! Work-set construction.
//!
//! Turns the candidate set into the ordered, deduplicated job list of one
//! run. Candidates outside the numeric range are dropped first, the rest are
//! resolved one by one; unresolved candidates are collected with their reason
//! instead of aborting the batch (unless strict resolution is requested).

use crate::config::ConvertConfig;
use crate::job::{AnalyzeTask, ConvertTask, Job, JobTask};
use crate::logbook::{FileClass, MetadataLog};
use crate::naming::{file_number, replace_extension, DERIVED_EXTENSION};
use crate::output::OutputPathPlanner;
use crate::resolve::{
    BackgroundSource, Dependencies, DependencyResolver, ResolveError, ResolveMode, Resolution,
};
use crate::scan::Candidate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Raised in strict mode on the first unresolved candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot resolve {file_name}: {source}")]
pub struct StrictResolutionError {
    pub file_name: String,
    #[source]
    pub source: ResolveError,
}

/// Inclusive bounds on the numeric token of a filename.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeFilter {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl RangeFilter {
    pub fn new(start: Option<u32>, end: Option<u32>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Checks whether `file_name` falls inside the range.
    ///
    /// With any bound set, a filename without a numeric token is outside.
    pub fn contains(&self, file_name: &str) -> bool {
        if self.is_unbounded() {
            return true;
        }
        match file_number(file_name) {
            Some(number) => {
                self.start.map_or(true, |start| number >= start)
                    && self.end.map_or(true, |end| number <= end)
            }
            None => false,
        }
    }
}

/// A candidate that could not be turned into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unresolved {
    pub file_name: String,
    pub reason: String,
}

/// Mode-specific pieces shared by every job of a batch.
#[derive(Debug, Clone)]
pub enum JobTemplate {
    Convert {
        background: BackgroundSource,
        flatfield_path: PathBuf,
        settings: Arc<ConvertConfig>,
    },
    Analyze {
        planner: OutputPathPlanner,
        params: Arc<toml::Table>,
    },
}

impl JobTemplate {
    fn resolve_mode(&self) -> ResolveMode {
        match self {
            JobTemplate::Convert { background, .. } => ResolveMode::Convert(background.clone()),
            JobTemplate::Analyze { .. } => ResolveMode::Analyze,
        }
    }

    /// Builds the job for a resolved candidate. Returns `None` when the
    /// dependencies belong to the other mode.
    fn instantiate(
        &self,
        index: usize,
        data_dir: &Path,
        candidate: &Candidate,
        deps: Dependencies,
        overwrite: bool,
    ) -> Option<Job> {
        let file_name = candidate.file_name.clone();
        let input_path = candidate.path_in(data_dir);

        let (output_path, task) = match (self, deps) {
            (
                JobTemplate::Convert {
                    flatfield_path,
                    settings,
                    ..
                },
                Dependencies::Convert { background },
            ) => (
                data_dir.join(replace_extension(&file_name, DERIVED_EXTENSION)),
                JobTask::Convert(ConvertTask {
                    background,
                    flatfield_path: flatfield_path.clone(),
                    settings: Arc::clone(settings),
                }),
            ),
            (
                JobTemplate::Analyze { planner, params },
                Dependencies::Analyze {
                    frame_count,
                    injector_distance,
                },
            ) => (
                planner.output_path(&file_name),
                JobTask::Analyze(AnalyzeTask {
                    frame_count,
                    window_size: planner.window_size(),
                    snapshot_path: planner.snapshot_path(&file_name),
                    injector_distance,
                    params: Arc::clone(params),
                }),
            ),
            _ => return None,
        };

        Some(Job {
            index,
            file_name,
            input_path,
            output_path,
            overwrite,
            task,
        })
    }
}

/// The jobs of one run plus what was left out and why.
#[derive(Debug, Clone, Default)]
pub struct WorkSet {
    /// Jobs sorted by filename, indexed in that order.
    pub jobs: Vec<Job>,
    /// Candidates excluded because their dependencies did not resolve.
    pub unresolved: Vec<Unresolved>,
    /// Candidates dropped by classification.
    pub dropped: Vec<(String, FileClass)>,
    /// Candidates outside the numeric range.
    pub out_of_range: usize,
}

impl WorkSet {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Builds a [`WorkSet`] from scanned candidates.
#[derive(Debug, Clone)]
pub struct WorkSetBuilder<'a> {
    log: &'a MetadataLog,
    data_dir: &'a Path,
    template: JobTemplate,
    range: RangeFilter,
    overwrite: bool,
    strict: bool,
}

impl<'a> WorkSetBuilder<'a> {
    pub fn new(log: &'a MetadataLog, data_dir: &'a Path, template: JobTemplate) -> Self {
        Self {
            log,
            data_dir,
            template,
            range: RangeFilter::default(),
            overwrite: false,
            strict: false,
        }
    }

    pub fn range(mut self, range: RangeFilter) -> Self {
        self.range = range;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Resolves every candidate and emits the work set.
    ///
    /// # Arguments
    /// * `candidates` - Output of the scanner; ordering and duplicates do not matter
    ///
    /// # Returns
    /// * `Ok(WorkSet)` - Jobs sorted by filename, with unresolved and dropped candidates
    /// * `Err(StrictResolutionError)` - Strict mode and a candidate failed to resolve
    pub fn build(
        &self,
        candidates: impl IntoIterator<Item = Candidate>,
    ) -> Result<WorkSet, StrictResolutionError> {
        let resolver = DependencyResolver::new(self.log, self.data_dir, self.template.resolve_mode());
        let sorted: BTreeSet<Candidate> = candidates.into_iter().collect();

        let mut set = WorkSet::default();
        for candidate in sorted {
            if !self.range.contains(&candidate.file_name) {
                set.out_of_range += 1;
                continue;
            }

            let deps = match resolver.resolve(&candidate.file_name) {
                Ok(Resolution::Ready(deps)) => deps,
                Ok(Resolution::Dropped(class)) => {
                    debug!(file = %candidate.file_name, class = %class, "candidate dropped");
                    set.dropped.push((candidate.file_name, class));
                    continue;
                }
                Err(source) if self.strict => {
                    return Err(StrictResolutionError {
                        file_name: candidate.file_name,
                        source,
                    });
                }
                Err(e) => {
                    warn!(file = %candidate.file_name, error = %e, "candidate skipped");
                    set.unresolved.push(Unresolved {
                        file_name: candidate.file_name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let index = set.jobs.len();
            match self
                .template
                .instantiate(index, self.data_dir, &candidate, deps, self.overwrite)
            {
                Some(job) => set.jobs.push(job),
                None => set.unresolved.push(Unresolved {
                    file_name: candidate.file_name,
                    reason: "dependencies do not match the batch mode".to_string(),
                }),
            }
        }

        if !set.unresolved.is_empty() {
            warn!(
                "{} candidates skipped due to resolution errors",
                set.unresolved.len()
            );
        }
        info!(
            jobs = set.jobs.len(),
            dropped = set.dropped.len(),
            out_of_range = set.out_of_range,
            "work set built"
        );

        Ok(set)
    }
}
