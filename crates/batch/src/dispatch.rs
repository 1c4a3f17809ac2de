//! Dispatcher: runs a work set through a bounded worker pool.
//!
//! Every job is spawned up front and waits on a semaphore permit, so at most
//! `workers` jobs run at once. Each job goes
//! `Pending -> Running -> {Succeeded, Failed, Skipped}` on its own; a failing
//! job never aborts its siblings. Completions are collected in whatever
//! order they arrive and each one updates the running ETA.

use crate::config::{Config, FailureClass};
use crate::job::{Job, JobFailure, JobOutcome, JobStatus, SkipReason};
use crate::progress::{BatchReport, EtaTracker, JobReport};
use crate::runner::{ExecContext, JobRunner, RunError, Verbosity};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Dispatch settings for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Maximum number of jobs running at once
    pub workers: usize,
    /// Per-job wall-clock limit
    pub job_timeout: Option<Duration>,
    /// Failure classes that stop further jobs from starting
    pub fatal_failures: HashSet<FailureClass>,
    /// Verbosity handed to every job
    pub verbosity: Verbosity,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            job_timeout: None,
            fatal_failures: HashSet::new(),
            verbosity: Verbosity::Normal,
        }
    }
}

impl DispatchOptions {
    /// Options from the `[dispatch]` section and a planned worker count.
    pub fn from_config(cfg: &Config, workers: u32, verbosity: Verbosity) -> Self {
        let job_timeout = match cfg.dispatch.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            workers: workers.max(1) as usize,
            job_timeout,
            fatal_failures: cfg.dispatch.fatal_failures.iter().copied().collect(),
            verbosity,
        }
    }
}

/// State shared by the tasks of one batch.
struct Shared {
    runner: Arc<dyn JobRunner>,
    semaphore: Arc<Semaphore>,
    halt: AtomicBool,
    options: DispatchOptions,
}

/// Runs jobs with concurrency limiting, timeouts and failure isolation.
pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn JobRunner>, options: DispatchOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Runs every job and returns the aggregated report.
    ///
    /// # Arguments
    /// * `jobs` - The work set, in submission order
    ///
    /// # Returns
    /// The batch report with one entry per job, sorted by job index.
    pub async fn run(&self, jobs: Vec<Job>) -> BatchReport {
        let total = jobs.len();
        let shared = Arc::new(Shared {
            runner: Arc::clone(&self.runner),
            semaphore: Arc::new(Semaphore::new(self.options.workers.max(1))),
            halt: AtomicBool::new(false),
            options: self.options.clone(),
        });

        info!(jobs = total, workers = self.options.workers, "dispatching work set");

        let submitted: Vec<(usize, String)> =
            jobs.iter().map(|j| (j.index, j.file_name.clone())).collect();
        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(run_job(Arc::clone(&shared), job));
        }

        let mut tracker = EtaTracker::new(total);
        let mut report = BatchReport::new(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(job_report) => {
                    log_outcome(&job_report, total);
                    report.record(job_report);
                }
                Err(e) => error!(error = %e, "worker task lost"),
            }
            info!("{}", tracker.record());
        }

        record_lost_jobs(&mut report, &submitted);
        report.halted = shared.halt.load(Ordering::SeqCst);
        report.finish(tracker.elapsed());

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_secs = report.elapsed_secs,
            "batch finished"
        );
        report
    }
}

/// One job, from waiting for a permit to its terminal outcome.
async fn run_job(shared: Arc<Shared>, job: Job) -> JobReport {
    let index = job.index;
    let file_name = job.file_name.clone();

    let permit = Arc::clone(&shared.semaphore).acquire_owned().await;
    let started = Instant::now();

    let outcome = if permit.is_err() || shared.halt.load(Ordering::SeqCst) {
        JobOutcome::skipped(SkipReason::Cancelled)
    } else {
        execute(&shared, job).await
    };

    if let JobOutcome::Failed(failure) = &outcome {
        if shared.options.fatal_failures.contains(&failure.class) {
            warn!(file = %file_name, class = %failure.class, "fatal failure, no further jobs will start");
            shared.halt.store(true, Ordering::SeqCst);
        }
    }
    // The permit is released only after the halt flag is visible.
    drop(permit);

    JobReport {
        index,
        file_name,
        outcome,
        duration_secs: started.elapsed().as_secs_f64(),
    }
}

/// Pre-checks and runs a job on the blocking pool, enforcing the timeout.
async fn execute(shared: &Arc<Shared>, job: Job) -> JobOutcome {
    let ctx = ExecContext::new(shared.options.verbosity);
    let runner = Arc::clone(&shared.runner);
    let worker_ctx = ctx.clone();
    let output_path = job.output_path.clone();

    let mut handle = tokio::task::spawn_blocking(move || prepare_and_run(runner.as_ref(), &job, &worker_ctx));

    let joined = match shared.options.job_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                ctx.cancel();
                // Drain: the runner observes the flag and stops its child.
                let _ = handle.await;
                discard_partial_output(&output_path);
                return JobOutcome::Failed(JobFailure::new(
                    FailureClass::Timeout,
                    format!("timed out after {}s", limit.as_secs_f64()),
                ));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            discard_partial_output(&output_path);
            JobOutcome::Failed(panic_failure(e))
        }
    }
}

/// Idempotency check, input probe and the runner call.
fn prepare_and_run(runner: &dyn JobRunner, job: &Job, ctx: &ExecContext) -> JobOutcome {
    if job.output_path.exists() {
        if !job.overwrite {
            return JobOutcome::skipped(SkipReason::OutputExists);
        }
        if let Err(e) = std::fs::remove_file(&job.output_path) {
            return JobOutcome::Failed(JobFailure::new(
                FailureClass::Io,
                format!(
                    "failed to remove existing output {}: {}",
                    job.output_path.display(),
                    e
                ),
            ));
        }
        debug!(output = %job.output_path.display(), "removed existing output");
    }

    if let Err(e) = runner.probe(job) {
        return JobOutcome::skipped(SkipReason::InvalidInput(e.to_string()));
    }

    debug!(file = %job.file_name, task = job.task.as_str(), status = %JobStatus::Running, "job started");
    match runner.run(job, ctx) {
        Ok(()) => JobOutcome::Succeeded,
        Err(e) => {
            discard_partial_output(&job.output_path);
            JobOutcome::Failed(run_failure(&e))
        }
    }
}

/// Removes what a failed job left at its output path so the next run retries it.
///
/// The path was absent (or removed under overwrite) before the job ran, so
/// anything there now is the failed job's own partial output.
fn discard_partial_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(output = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(output = %path.display(), error = %e, "failed to remove partial output"),
    }
}

/// Records a failure for every submitted job whose task never reported back.
fn record_lost_jobs(report: &mut BatchReport, submitted: &[(usize, String)]) {
    let reported: HashSet<usize> = report.jobs.iter().map(|j| j.index).collect();
    for (index, file_name) in submitted {
        if reported.contains(index) {
            continue;
        }
        error!(file = %file_name, "worker task lost before reporting");
        report.record(JobReport {
            index: *index,
            file_name: file_name.clone(),
            outcome: JobOutcome::Failed(JobFailure::new(
                FailureClass::Panic,
                "worker task lost before reporting",
            )),
            duration_secs: 0.0,
        });
    }
}

fn run_failure(err: &RunError) -> JobFailure {
    let class = match err {
        RunError::Io(_) | RunError::Snapshot(_) => FailureClass::Io,
        RunError::Cancelled => FailureClass::Timeout,
        RunError::Spawn { .. } | RunError::Failed { .. } | RunError::Terminated { .. } => {
            FailureClass::Runner
        }
    };
    let failure = JobFailure::new(class, err.to_string());
    match err.diagnostic() {
        Some(diagnostic) => failure.with_diagnostic(diagnostic),
        None => failure,
    }
}

fn panic_failure(err: JoinError) -> JobFailure {
    if !err.is_panic() {
        return JobFailure::new(FailureClass::Panic, err.to_string());
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    JobFailure::new(FailureClass::Panic, format!("worker panicked: {}", message))
}

fn log_outcome(job: &JobReport, total: usize) {
    let position = job.index + 1;
    match &job.outcome {
        JobOutcome::Succeeded => {
            debug!(file = %job.file_name, position, total, duration_secs = job.duration_secs, "job succeeded")
        }
        JobOutcome::Skipped { reason } => {
            warn!(file = %job.file_name, position, total, reason = %reason, "job skipped")
        }
        JobOutcome::Failed(failure) => {
            error!(
                file = %job.file_name,
                position,
                total,
                class = %failure.class,
                error = %failure.message,
                "job failed"
            );
            if let Some(diagnostic) = &failure.diagnostic {
                error!("{}", diagnostic);
            }
        }
    }
}
