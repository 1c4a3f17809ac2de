//! Job runners.
//!
//! The conversion and analysis routines are external collaborators. The
//! dispatcher only sees the [`JobRunner`] trait; [`CommandRunner`] drives the
//! external programs.

pub mod command;

pub use command::{build_analyze_command, build_convert_command, CommandRunner};

use crate::job::Job;
use crate::output::SnapshotError;
use crate::probe::{probe_input, ProbeError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// How much a job may print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

/// Per-job execution context.
///
/// Carries the job's verbosity explicitly, so running a job never touches
/// process-wide logger state, and a cancellation flag the dispatcher raises
/// when the job times out.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub verbosity: Verbosity,
    cancel: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the running job to stop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Error type for job execution.
#[derive(Debug, Error)]
pub enum RunError {
    /// The external program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program exited with a non-zero status.
    #[error("{program} failed with exit code {code}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The external program was terminated by a signal.
    #[error("{program} was terminated by signal")]
    Terminated { program: String, stderr: String },

    /// The job was cancelled while running.
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Captured diagnostic output, when there is any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            RunError::Failed { stderr, .. } | RunError::Terminated { stderr, .. }
                if !stderr.trim().is_empty() =>
            {
                Some(stderr)
            }
            _ => None,
        }
    }
}

/// Executes jobs. Implementations are shared by all workers.
pub trait JobRunner: Send + Sync + 'static {
    /// Structural-validity check on the job's input, run before [`JobRunner::run`].
    fn probe(&self, job: &Job) -> Result<(), ProbeError> {
        probe_input(&job.input_path)
    }

    /// Runs the job to completion. Blocking.
    fn run(&self, job: &Job, ctx: &ExecContext) -> Result<(), RunError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = ExecContext::new(Verbosity::Quiet);
        let worker_view = ctx.clone();
        assert!(!worker_view.is_cancelled());
        ctx.cancel();
        assert!(worker_view.is_cancelled());
    }

    #[test]
    fn test_verbosity_ordering() {
        assert!(Verbosity::Debug > Verbosity::Verbose);
        assert!(Verbosity::Verbose > Verbosity::Normal);
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn test_diagnostic() {
        let err = RunError::Failed {
            program: "cxd2cxi".into(),
            code: 2,
            stderr: "Traceback: boom\n".into(),
        };
        assert_eq!(err.diagnostic(), Some("Traceback: boom\n"));
        assert_eq!(err.to_string(), "cxd2cxi failed with exit code 2");

        let quiet = RunError::Terminated {
            program: "cxd2cxi".into(),
            stderr: "  \n".into(),
        };
        assert_eq!(quiet.diagnostic(), None);
        assert_eq!(RunError::Cancelled.diagnostic(), None);
    }
}
