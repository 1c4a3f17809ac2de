//! External-program runner.
//!
//! Builds the converter and analyzer command lines from a job and executes
//! them, capturing stderr as the failure diagnostic.

use super::{ExecContext, JobRunner, RunError, Verbosity};
use crate::config::Config;
use crate::job::{AnalyzeTask, ConvertTask, Job, JobTask};
use crate::output::write_config_snapshot;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How often a running child is checked for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Build the converter command for a conversion job.
///
/// Creates a Command configured with:
/// - The raw input as positional argument and the derived output path
/// - Background file and its frame budget
/// - Flat-field file, frame budget and region-of-interest settings
/// - Optional percentile filter, manual crop and skip-raw flags
///
/// # Arguments
/// * `program` - Converter executable
/// * `job` - The job, for its input and output paths
/// * `task` - The conversion dependencies and settings
/// * `verbosity` - Passed on as `--quiet` when below normal
pub fn build_convert_command(
    program: &str,
    job: &Job,
    task: &ConvertTask,
    verbosity: Verbosity,
) -> Command {
    let settings = &task.settings;
    let mut cmd = Command::new(program);

    cmd.arg(&job.input_path);
    cmd.arg("--out-filename").arg(&job.output_path);

    cmd.arg("--background-filename").arg(&task.background.path);
    cmd.arg("--bg-frames-max")
        .arg(task.background.frame_budget.to_string());

    cmd.arg("--flatfield-filename").arg(&task.flatfield_path);
    cmd.arg("--ff-frames-max")
        .arg(settings.ff_frames_max.to_string());
    cmd.arg("--roi-low-limit")
        .arg(settings.roi_low_limit.to_string());
    cmd.arg("--roi-fraction")
        .arg(settings.roi_fraction.to_string());

    if settings.percentile_filter {
        cmd.arg("--percentile-filter");
        cmd.arg("--percentile-number")
            .arg(settings.percentile_number.to_string());
        cmd.arg("--percentile-frames")
            .arg(settings.percentile_frames.to_string());
    }

    if settings.crop_raw {
        cmd.arg("--crop-raw");
        cmd.arg("--min-x").arg(settings.min_x.to_string());
        cmd.arg("--max-x").arg(settings.max_x.to_string());
        cmd.arg("--min-y").arg(settings.min_y.to_string());
        cmd.arg("--max-y").arg(settings.max_y.to_string());
    }

    if settings.skip_raw {
        cmd.arg("--skip-raw");
    }

    if verbosity < Verbosity::Normal {
        cmd.arg("--quiet");
    }

    cmd
}

/// Build the analyzer command for an analysis job.
///
/// The analyzer reads everything but the output path from the job's
/// configuration snapshot.
pub fn build_analyze_command(
    program: &str,
    job: &Job,
    task: &AnalyzeTask,
    verbosity: Verbosity,
) -> Command {
    let mut cmd = Command::new(program);

    cmd.arg("--config").arg(&task.snapshot_path);
    cmd.arg("--output").arg(&job.output_path);

    match verbosity {
        Verbosity::Verbose => {
            cmd.arg("--verbose");
        }
        Verbosity::Debug => {
            cmd.arg("--debug");
        }
        Verbosity::Quiet | Verbosity::Normal => {}
    }

    cmd
}

/// Runs a command to completion, killing it when `ctx` is cancelled.
///
/// stdout is inherited only at verbose levels; stderr is always captured.
pub fn execute(mut cmd: Command, ctx: &ExecContext) -> Result<(), RunError> {
    let program = cmd.get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null());
    if ctx.verbosity >= Verbosity::Verbose {
        cmd.stdout(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::null());
    }
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain stderr on its own thread so a chatty child never blocks on a full pipe.
    let mut pipe = child.stderr.take();
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let status = loop {
        if ctx.is_cancelled() {
            debug!(program = %program, "killing cancelled child");
            reap(&mut child, reader);
            return Err(RunError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(program = %program, error = %e, "lost track of child, killing it");
                reap(&mut child, reader);
                return Err(RunError::Io(e));
            }
        }
    };

    let stderr = reader.join().unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(RunError::Failed {
                program,
                code,
                stderr,
            }),
            None => Err(RunError::Terminated { program, stderr }),
        }
    }
}

/// Kills the child, waits for it and joins its stderr reader.
fn reap(child: &mut Child, reader: JoinHandle<String>) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = reader.join();
}

/// Runs jobs through the configured external programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRunner {
    pub convert_program: String,
    pub analyze_program: String,
}

impl CommandRunner {
    pub fn new(convert_program: impl Into<String>, analyze_program: impl Into<String>) -> Self {
        Self {
            convert_program: convert_program.into(),
            analyze_program: analyze_program.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.convert.program.clone(), cfg.analysis.program.clone())
    }
}

impl JobRunner for CommandRunner {
    fn run(&self, job: &Job, ctx: &ExecContext) -> Result<(), RunError> {
        let cmd = match &job.task {
            JobTask::Convert(task) => {
                build_convert_command(&self.convert_program, job, task, ctx.verbosity)
            }
            JobTask::Analyze(task) => {
                write_config_snapshot(job, task)?;
                build_analyze_command(&self.analyze_program, job, task, ctx.verbosity)
            }
        };
        debug!(file = %job.file_name, command = ?cmd, "running job");
        execute(cmd, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvertConfig;
    use crate::job::BackgroundRef;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn convert_job(settings: ConvertConfig, budget: u32) -> Job {
        Job {
            index: 0,
            file_name: "data00001.cxd".into(),
            input_path: PathBuf::from("/d/data00001.cxd"),
            output_path: PathBuf::from("/d/data00001.cxi"),
            overwrite: false,
            task: JobTask::Convert(ConvertTask {
                background: BackgroundRef {
                    path: PathBuf::from("/d/data00002.cxd"),
                    frame_budget: budget,
                },
                flatfield_path: PathBuf::from("data/consts/data01624.cxd"),
                settings: Arc::new(settings),
            }),
        }
    }

    fn convert_args(job: &Job, verbosity: Verbosity) -> (Command, Vec<String>) {
        let JobTask::Convert(task) = &job.task else {
            panic!("not a conversion job");
        };
        let cmd = build_convert_command("cxd2cxi", job, task, verbosity);
        let args = get_command_args(&cmd);
        (cmd, args)
    }

    #[test]
    fn test_convert_command_defaults() {
        let job = convert_job(ConvertConfig::default(), 50);
        let (cmd, args) = convert_args(&job, Verbosity::Normal);

        assert_eq!(cmd.get_program(), OsStr::new("cxd2cxi"));
        assert_eq!(args[0], "/d/data00001.cxd");
        assert!(has_flag_with_value(&args, "--out-filename", "/d/data00001.cxi"));
        assert!(has_flag_with_value(&args, "--background-filename", "/d/data00002.cxd"));
        assert!(has_flag_with_value(&args, "--bg-frames-max", "50"));
        assert!(has_flag_with_value(&args, "--flatfield-filename", "data/consts/data01624.cxd"));
        assert!(has_flag_with_value(&args, "--ff-frames-max", "100"));
        assert!(has_flag_with_value(&args, "--roi-low-limit", "10"));
        assert!(has_flag_with_value(&args, "--roi-fraction", "0.999"));
        assert!(!has_flag(&args, "--percentile-filter"));
        assert!(!has_flag(&args, "--crop-raw"));
        assert!(!has_flag(&args, "--skip-raw"));
        assert!(!has_flag(&args, "--quiet"));
    }

    #[test]
    fn test_convert_command_optional_flags() {
        let settings = ConvertConfig {
            percentile_filter: true,
            crop_raw: true,
            max_x: 1024,
            skip_raw: true,
            ..ConvertConfig::default()
        };
        let job = convert_job(settings, 50);
        let (_, args) = convert_args(&job, Verbosity::Quiet);

        assert!(has_flag(&args, "--percentile-filter"));
        assert!(has_flag_with_value(&args, "--percentile-number", "50"));
        assert!(has_flag_with_value(&args, "--percentile-frames", "4"));
        assert!(has_flag(&args, "--crop-raw"));
        assert!(has_flag_with_value(&args, "--max-x", "1024"));
        assert!(has_flag_with_value(&args, "--min-y", "0"));
        assert!(has_flag(&args, "--skip-raw"));
        assert!(has_flag(&args, "--quiet"));
    }

    #[test]
    fn test_analyze_command() {
        let task = AnalyzeTask {
            frame_count: 10,
            window_size: 5,
            snapshot_path: PathBuf::from("/o/conf/data00001_ana_w05.toml"),
            injector_distance: None,
            params: Arc::new(toml::Table::new()),
        };
        let job = Job {
            index: 0,
            file_name: "data00001.cxi".into(),
            input_path: PathBuf::from("/d/data00001.cxi"),
            output_path: PathBuf::from("/o/data00001_ana_w05.cxi"),
            overwrite: false,
            task: JobTask::Analyze(task.clone()),
        };

        let args = get_command_args(&build_analyze_command("spts-analyze", &job, &task, Verbosity::Debug));
        assert!(has_flag_with_value(&args, "--config", "/o/conf/data00001_ana_w05.toml"));
        assert!(has_flag_with_value(&args, "--output", "/o/data00001_ana_w05.cxi"));
        assert!(has_flag(&args, "--debug"));

        let args = get_command_args(&build_analyze_command("spts-analyze", &job, &task, Verbosity::Normal));
        assert!(!has_flag(&args, "--debug"));
        assert!(!has_flag(&args, "--verbose"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_captures_stderr_on_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'Traceback: boom' >&2; exit 3");

        let err = execute(cmd, &ExecContext::new(Verbosity::Quiet)).unwrap_err();
        match err {
            RunError::Failed { code, ref stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("Traceback: boom"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_success_and_cancel() {
        let mut ok = Command::new("sh");
        ok.arg("-c").arg("exit 0");
        assert!(execute(ok, &ExecContext::new(Verbosity::Quiet)).is_ok());

        let ctx = ExecContext::new(Verbosity::Quiet);
        ctx.cancel();
        let mut slow = Command::new("sleep");
        slow.arg("30");
        let started = std::time::Instant::now();
        assert!(matches!(execute(slow, &ctx), Err(RunError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_reap_kills_child_and_joins_reader() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut pipe = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let started = std::time::Instant::now();
        reap(&mut child, reader);

        assert!(started.elapsed() < Duration::from_secs(10));
        let status = child.try_wait().unwrap().expect("child was waited on");
        assert!(!status.success());
    }

    #[test]
    fn test_execute_missing_program() {
        let cmd = Command::new("definitely-not-an-installed-program-4821");
        let err = execute(cmd, &ExecContext::default()).unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Every conversion command carries the background and its budget,
        // whatever the budget.
        #[test]
        fn prop_convert_command_carries_background(budget in 1u32..100_000, ff in 1u32..1000) {
            let settings = ConvertConfig { ff_frames_max: ff, ..ConvertConfig::default() };
            let job = convert_job(settings, budget);
            let (_, args) = convert_args(&job, Verbosity::Normal);

            let budget = budget.to_string();
            let ff = ff.to_string();
            prop_assert!(has_flag_with_value(&args, "--bg-frames-max", &budget));
            prop_assert!(has_flag_with_value(&args, "--ff-frames-max", &ff));
            prop_assert!(has_flag_with_value(&args, "--background-filename", "/d/data00002.cxd"));
        }
    }
}
