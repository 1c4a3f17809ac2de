//! CLI entry point for capture batches
//!
//! Parses command line arguments, layers them over the configuration file
//! and runs a conversion or analysis batch.
//!
//! Exit status: 0 when every job succeeded or was skipped, 1 on a fatal
//! error before dispatch, 2 when at least one job failed.

use capture_batch::{
    Batch, BatchMode, BatchReport, BatchRequest, CommandRunner, Config, RangeFilter, Verbosity,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Batch conversion and analysis of instrument capture files
#[derive(Parser, Debug)]
#[command(name = "capture-batch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debugging mode (even more output than verbose mode)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only print warnings and errors; passed on to the converter as --quiet
    #[arg(short, long, global = true, conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Write the batch report as JSON to this file
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Arguments shared by both batch modes
#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory holding the input files
    #[arg(short = 'p', long = "data-path")]
    data_path: PathBuf,

    /// Metadata log (CSV) with one row per capture file
    #[arg(short = 'l', long = "log-file")]
    log_file: PathBuf,

    /// First file number to process
    #[arg(short = 's', long = "start-number")]
    start_number: Option<u32>,

    /// Last file number to process
    #[arg(short = 'e', long = "end-number")]
    end_number: Option<u32>,

    /// Number of concurrent jobs (0 = available parallelism)
    #[arg(short = 'w', long)]
    workers: Option<u32>,

    /// Recompute outputs that already exist
    #[arg(long)]
    overwrite: bool,

    /// Per-job timeout in seconds (0 = none)
    #[arg(long)]
    job_timeout: Option<u64>,

    /// Abort on the first file whose dependencies cannot be resolved
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert raw captures (.cxd) to derived artifacts (.cxi)
    Convert {
        #[command(flatten)]
        common: CommonArgs,

        /// Use this background file for every capture instead of the log's reference
        #[arg(long = "background-file")]
        background_file: Option<PathBuf>,

        /// Background frames to use with --background-file
        #[arg(long)]
        bg_frames_max: Option<u32>,

        /// Flat-field filename (in the data directory) or path
        #[arg(short = 'f', long = "flatfield-filename")]
        flatfield: Option<String>,

        /// Maximum number of flat-field frames
        #[arg(long)]
        ff_frames_max: Option<u32>,

        /// Minimum intensity threshold for ROI detection
        #[arg(long)]
        roi_low_limit: Option<u32>,

        /// Fraction of intensity included in the ROI
        #[arg(long)]
        roi_fraction: Option<f64>,

        /// Apply a percentile filter to the output images
        #[arg(long)]
        percentile_filter: bool,

        /// Percentile value for the percentile filter
        #[arg(long)]
        percentile_number: Option<u32>,

        /// Kernel length in frames for the percentile filter
        #[arg(long)]
        percentile_frames: Option<u32>,

        /// Crop to the bounds given by --min-x/--max-x/--min-y/--max-y
        #[arg(long)]
        crop_raw: bool,

        #[arg(long)]
        min_x: Option<u32>,

        #[arg(long)]
        max_x: Option<u32>,

        #[arg(long)]
        min_y: Option<u32>,

        #[arg(long)]
        max_y: Option<u32>,

        /// Do not store raw frames in the output
        #[arg(long)]
        skip_raw: bool,
    },

    /// Analyze derived artifacts (.cxi)
    Analyze {
        #[command(flatten)]
        common: CommonArgs,

        /// Suffix appended to output names, e.g. d25 => data00000_ana_w05_d25.cxi
        #[arg(long)]
        suffix: Option<String>,

        /// Output directory (default: <output_root>/<label>_ana_wNN[_suffix])
        #[arg(long = "save-dir")]
        save_dir: Option<PathBuf>,

        /// Window width in pixels
        #[arg(long)]
        window_size: Option<u32>,
    },
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn verbosity(cli: &Cli) -> Verbosity {
    if cli.debug {
        Verbosity::Debug
    } else if cli.verbose {
        Verbosity::Verbose
    } else if cli.quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Normal
    }
}

/// Applies the mode-independent flags to the configuration.
fn apply_common(config: &mut Config, common: &CommonArgs) {
    if let Some(workers) = common.workers {
        config.dispatch.workers = workers;
    }
    if let Some(secs) = common.job_timeout {
        config.dispatch.job_timeout_secs = secs;
    }
    if common.overwrite {
        config.dispatch.overwrite = true;
    }
    if common.strict {
        config.resolution.strict = true;
    }
}

/// Layers the command line over the configuration and builds the request.
fn build_batch(cli: Cli, mut config: Config) -> (Batch, Option<PathBuf>) {
    let verbosity = verbosity(&cli);

    let request = match cli.command {
        Command::Convert {
            common,
            background_file,
            bg_frames_max,
            flatfield,
            ff_frames_max,
            roi_low_limit,
            roi_fraction,
            percentile_filter,
            percentile_number,
            percentile_frames,
            crop_raw,
            min_x,
            max_x,
            min_y,
            max_y,
            skip_raw,
        } => {
            apply_common(&mut config, &common);
            let convert = &mut config.convert;
            if let Some(v) = bg_frames_max {
                convert.bg_frames_max = v;
            }
            if let Some(v) = ff_frames_max {
                convert.ff_frames_max = v;
            }
            if let Some(v) = roi_low_limit {
                convert.roi_low_limit = v;
            }
            if let Some(v) = roi_fraction {
                convert.roi_fraction = v;
            }
            if let Some(v) = percentile_number {
                convert.percentile_number = v;
            }
            if let Some(v) = percentile_frames {
                convert.percentile_frames = v;
            }
            if let Some(v) = min_x {
                convert.min_x = v;
            }
            if let Some(v) = max_x {
                convert.max_x = v;
            }
            if let Some(v) = min_y {
                convert.min_y = v;
            }
            if let Some(v) = max_y {
                convert.max_y = v;
            }
            convert.percentile_filter |= percentile_filter;
            convert.crop_raw |= crop_raw;
            convert.skip_raw |= skip_raw;

            let mut request = BatchRequest::new(BatchMode::Convert, common.data_path, common.log_file);
            request.range = RangeFilter::new(common.start_number, common.end_number);
            request.background = background_file;
            request.flatfield = flatfield;
            request
        }
        Command::Analyze {
            common,
            suffix,
            save_dir,
            window_size,
        } => {
            apply_common(&mut config, &common);
            if let Some(v) = window_size {
                config.analysis.window_size = v;
            }

            let mut request = BatchRequest::new(BatchMode::Analyze, common.data_path, common.log_file);
            request.range = RangeFilter::new(common.start_number, common.end_number);
            request.suffix = suffix;
            request.save_dir = save_dir;
            request
        }
    };

    let request = BatchRequest {
        verbosity,
        ..request
    };
    (Batch::new(config, request), cli.report)
}

fn write_report(report: &BatchReport, path: &Path) -> Result<(), String> {
    let json = report
        .to_json()
        .map_err(|e| format!("Failed to serialize report: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write report {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env(),
    };

    let (batch, report_path) = build_batch(cli, config);
    let runner = Arc::new(CommandRunner::from_config(batch.config()));

    let report = match batch.run(runner).await {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if !report.unresolved.is_empty() {
        info!(
            "{} candidates skipped due to resolution errors",
            report.unresolved.len()
        );
    }
    info!(
        "{} succeeded, {} failed, {} skipped",
        report.succeeded, report.failed, report.skipped
    );

    if let Some(path) = &report_path {
        if let Err(e) = write_report(&report, path) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        info!(path = %path.display(), "report written");
    }

    if report.any_failed() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
