//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Classes of job failure that can be declared fatal for a batch.
///
/// When a job fails with one of the classes listed in
/// `dispatch.fatal_failures`, the dispatcher stops starting new jobs and
/// lets the in-flight ones drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The external conversion/analysis program reported an error.
    Runner,
    /// The job exceeded `dispatch.job_timeout_secs`.
    Timeout,
    /// The worker executing the job panicked.
    Panic,
    /// Filesystem error while preparing the job's output.
    Io,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Runner => write!(f, "runner"),
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::Panic => write!(f, "panic"),
            FailureClass::Io => write!(f, "io"),
        }
    }
}

/// Worker pool and job lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Number of concurrent workers (0 = available parallelism)
    #[serde(default)]
    pub workers: u32,
    /// Per-job timeout in seconds (0 = no timeout)
    #[serde(default)]
    pub job_timeout_secs: u64,
    /// Recompute jobs whose output already exists
    #[serde(default)]
    pub overwrite: bool,
    /// Failure classes that halt submission of further jobs
    #[serde(default)]
    pub fatal_failures: Vec<FailureClass>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            job_timeout_secs: 0,
            overwrite: false,
            fatal_failures: Vec::new(),
        }
    }
}

/// Dependency resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResolutionConfig {
    /// Abort the whole batch on the first candidate that cannot be resolved
    #[serde(default)]
    pub strict: bool,
}

/// Raw capture conversion settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvertConfig {
    /// Converter executable
    #[serde(default = "default_convert_program")]
    pub program: String,
    /// Background frame budget used with a global background override
    #[serde(default = "default_frames_max")]
    pub bg_frames_max: u32,
    /// Maximum number of frames used for the flat-field estimate
    #[serde(default = "default_frames_max")]
    pub ff_frames_max: u32,
    /// Minimum intensity threshold for ROI detection from the flat-field
    #[serde(default = "default_roi_low_limit")]
    pub roi_low_limit: u32,
    /// Fraction of intensity above threshold included in the ROI
    #[serde(default = "default_roi_fraction")]
    pub roi_fraction: f64,
    /// Apply a percentile filter to output images
    #[serde(default)]
    pub percentile_filter: bool,
    /// Percentile value for the percentile filter
    #[serde(default = "default_percentile_number")]
    pub percentile_number: u32,
    /// Kernel length in frames for the percentile filter
    #[serde(default = "default_percentile_frames")]
    pub percentile_frames: u32,
    /// Use the manual crop bounds instead of the detected ROI
    #[serde(default)]
    pub crop_raw: bool,
    #[serde(default)]
    pub min_x: u32,
    #[serde(default = "default_crop_max")]
    pub max_x: u32,
    #[serde(default)]
    pub min_y: u32,
    #[serde(default = "default_crop_max")]
    pub max_y: u32,
    /// Link processed data instead of storing raw frames
    #[serde(default)]
    pub skip_raw: bool,
}

fn default_convert_program() -> String {
    "cxd2cxi".to_string()
}

fn default_frames_max() -> u32 {
    100
}

fn default_roi_low_limit() -> u32 {
    10
}

fn default_roi_fraction() -> f64 {
    0.999
}

fn default_percentile_number() -> u32 {
    50
}

fn default_percentile_frames() -> u32 {
    4
}

fn default_crop_max() -> u32 {
    2048
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            program: default_convert_program(),
            bg_frames_max: default_frames_max(),
            ff_frames_max: default_frames_max(),
            roi_low_limit: default_roi_low_limit(),
            roi_fraction: default_roi_fraction(),
            percentile_filter: false,
            percentile_number: default_percentile_number(),
            percentile_frames: default_percentile_frames(),
            crop_raw: false,
            min_x: 0,
            max_x: default_crop_max(),
            min_y: 0,
            max_y: default_crop_max(),
            skip_raw: false,
        }
    }
}

/// Analysis settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Analyzer executable
    #[serde(default = "default_analysis_program")]
    pub program: String,
    /// Window width in pixels
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Root under which save directories are created
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Free-form analyzer parameters copied into every configuration snapshot
    #[serde(default)]
    pub params: toml::Table,
}

fn default_analysis_program() -> String {
    "spts-analyze".to_string()
}

fn default_window_size() -> u32 {
    5
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./data/analysis")
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            program: default_analysis_program(),
            window_size: default_window_size(),
            output_root: default_output_root(),
            params: toml::Table::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CAPTURE_BATCH_WORKERS -> dispatch.workers
    /// - CAPTURE_BATCH_JOB_TIMEOUT_SECS -> dispatch.job_timeout_secs
    /// - CAPTURE_BATCH_OVERWRITE -> dispatch.overwrite
    /// - CAPTURE_BATCH_STRICT_RESOLUTION -> resolution.strict
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CAPTURE_BATCH_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.dispatch.workers = workers;
            }
        }

        if let Ok(val) = env::var("CAPTURE_BATCH_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.dispatch.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("CAPTURE_BATCH_OVERWRITE") {
            if let Some(flag) = parse_bool(&val) {
                self.dispatch.overwrite = flag;
            }
        }

        if let Ok(val) = env::var("CAPTURE_BATCH_STRICT_RESOLUTION") {
            if let Some(flag) = parse_bool(&val) {
                self.resolution.strict = flag;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("CAPTURE_BATCH_WORKERS");
        env::remove_var("CAPTURE_BATCH_JOB_TIMEOUT_SECS");
        env::remove_var("CAPTURE_BATCH_OVERWRITE");
        env::remove_var("CAPTURE_BATCH_STRICT_RESOLUTION");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            workers in 0u32..128,
            timeout in 0u64..86_400,
            overwrite in proptest::bool::ANY,
            strict in proptest::bool::ANY,
            window in 1u32..64,
            bg_frames in 1u32..10_000,
        ) {
            let toml_str = format!(
                r#"
[dispatch]
workers = {}
job_timeout_secs = {}
overwrite = {}
fatal_failures = ["timeout", "io"]

[resolution]
strict = {}

[convert]
bg_frames_max = {}

[analysis]
window_size = {}
"#,
                workers, timeout, overwrite, strict, bg_frames, window
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.dispatch.workers, workers);
            prop_assert_eq!(config.dispatch.job_timeout_secs, timeout);
            prop_assert_eq!(config.dispatch.overwrite, overwrite);
            prop_assert_eq!(
                config.dispatch.fatal_failures.clone(),
                vec![FailureClass::Timeout, FailureClass::Io]
            );
            prop_assert_eq!(config.resolution.strict, strict);
            prop_assert_eq!(config.convert.bg_frames_max, bg_frames);
            prop_assert_eq!(config.analysis.window_size, window);
        }

        #[test]
        fn prop_env_overrides_workers(
            initial in 0u32..32,
            override_workers in 0u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[dispatch]\nworkers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CAPTURE_BATCH_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.dispatch.workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_job_timeout(
            initial in 0u64..600,
            override_secs in 0u64..86_400,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[dispatch]\njob_timeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CAPTURE_BATCH_JOB_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.dispatch.job_timeout_secs, override_secs);
        }

        #[test]
        fn prop_env_overrides_flags(
            initial_overwrite in proptest::bool::ANY,
            initial_strict in proptest::bool::ANY,
            override_overwrite in proptest::bool::ANY,
            override_strict in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[dispatch]\noverwrite = {}\n[resolution]\nstrict = {}\n",
                initial_overwrite, initial_strict
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CAPTURE_BATCH_OVERWRITE", override_overwrite.to_string());
            env::set_var("CAPTURE_BATCH_STRICT_RESOLUTION", override_strict.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.dispatch.overwrite, override_overwrite);
            prop_assert_eq!(config.resolution.strict, override_strict);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.dispatch.workers, 0);
        assert_eq!(config.dispatch.job_timeout_secs, 0);
        assert!(!config.dispatch.overwrite);
        assert!(config.dispatch.fatal_failures.is_empty());
        assert!(!config.resolution.strict);
        assert_eq!(config.convert.program, "cxd2cxi");
        assert_eq!(config.convert.bg_frames_max, 100);
        assert_eq!(config.convert.ff_frames_max, 100);
        assert_eq!(config.convert.roi_low_limit, 10);
        assert!((config.convert.roi_fraction - 0.999).abs() < 1e-9);
        assert_eq!(config.convert.percentile_number, 50);
        assert_eq!(config.convert.percentile_frames, 4);
        assert_eq!(config.convert.max_x, 2048);
        assert_eq!(config.convert.max_y, 2048);
        assert_eq!(config.analysis.program, "spts-analyze");
        assert_eq!(config.analysis.window_size, 5);
        assert_eq!(config.analysis.output_root, PathBuf::from("./data/analysis"));
        assert!(config.analysis.params.is_empty());
    }

    #[test]
    fn test_analysis_params_table_is_preserved() {
        let toml_str = r#"
[analysis]
window_size = 12

[analysis.params.analyse]
threshold = 8
method = "com"
"#;
        let config = Config::parse_toml(toml_str).expect("TOML with params should parse");

        assert_eq!(config.analysis.window_size, 12);
        let analyse = config.analysis.params["analyse"]
            .as_table()
            .expect("nested table");
        assert_eq!(analyse["threshold"].as_integer(), Some(8));
        assert_eq!(analyse["method"].as_str(), Some("com"));
    }

    #[test]
    fn test_unknown_failure_class_is_rejected() {
        let toml_str = "[dispatch]\nfatal_failures = [\"meltdown\"]\n";
        assert!(matches!(
            Config::parse_toml(toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[dispatch]\nworkers = 3\n").expect("Valid TOML");
        env::set_var("CAPTURE_BATCH_WORKERS", "many");
        env::set_var("CAPTURE_BATCH_OVERWRITE", "perhaps");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.dispatch.workers, 3);
        assert!(!config.dispatch.overwrite);
    }

    #[test]
    fn test_failure_class_display() {
        assert_eq!(FailureClass::Runner.to_string(), "runner");
        assert_eq!(FailureClass::Timeout.to_string(), "timeout");
        assert_eq!(FailureClass::Panic.to_string(), "panic");
        assert_eq!(FailureClass::Io.to_string(), "io");
    }
}
