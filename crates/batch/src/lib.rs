//! Capture batch engine
//!
//! Selects capture files for conversion or analysis from a data directory
//! and a metadata log, resolves their calibration dependencies, and runs the
//! resulting work set across a bounded worker pool.

pub mod batch;
pub mod concurrency;
pub mod dispatch;
pub mod job;
pub mod logbook;
pub mod naming;
pub mod output;
pub mod probe;
pub mod progress;
pub mod resolve;
pub mod runner;
pub mod scan;
pub mod workset;

pub use capture_batch_config as config;
pub use capture_batch_config::Config;
pub use batch::{Batch, BatchError, BatchMode, BatchPlan, BatchRequest};
pub use concurrency::WorkerPlan;
pub use dispatch::{DispatchOptions, Dispatcher};
pub use job::{BackgroundRef, Job, JobFailure, JobOutcome, JobStatus, JobTask, SkipReason};
pub use logbook::{FileClass, LogRecord, MetadataLoadError, MetadataLog, RecordNotFound};
pub use output::OutputPathPlanner;
pub use progress::{BatchReport, EtaTracker, JobReport, Progress};
pub use resolve::{locate_flatfield, BackgroundSource, DependencyResolver, ResolveError};
pub use runner::{CommandRunner, ExecContext, JobRunner, RunError, Verbosity};
pub use scan::{scan_candidates, Candidate, ScanSpec};
pub use workset::{JobTemplate, RangeFilter, Unresolved, WorkSet, WorkSetBuilder};
