//! Output path planning for analysis runs.
//!
//! Names are deterministic: the same window size, suffix and range always
//! give the same save directory and output filenames, which is what makes
//! the per-job "output already exists" check meaningful across runs.

use crate::job::{AnalyzeTask, Job};
use crate::naming::{file_stem, ANALYSIS_INFIX, DERIVED_EXTENSION};
use crate::workset::RangeFilter;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Subdirectory of the save directory holding configuration snapshots.
pub const CONF_DIR: &str = "conf";

/// Error writing a configuration snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to write snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Window size as used in names: two digits, zero-padded below 10.
pub fn window_tag(window_size: u32) -> String {
    format!("{:02}", window_size)
}

/// Prefixes a non-empty suffix with `_` unless it already starts with one.
pub fn normalize_suffix(suffix: Option<&str>) -> String {
    match suffix.map(str::trim) {
        None | Some("") => String::new(),
        Some(s) if s.starts_with('_') => s.to_string(),
        Some(s) => format!("_{}", s),
    }
}

/// Run label: the data directory's last two path segments joined with `_`,
/// followed by the numeric bounds when given.
pub fn run_label(data_dir: &Path, range: &RangeFilter) -> String {
    let segments: Vec<String> = data_dir
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let tail = &segments[segments.len().saturating_sub(2)..];
    let mut label = tail.join("_");

    let bounds = match (range.start, range.end) {
        (Some(start), Some(end)) => format!("{:05}-{:05}", start, end),
        (Some(start), None) => format!("from{:05}", start),
        (None, Some(end)) => format!("to{:05}", end),
        (None, None) => String::new(),
    };
    if !bounds.is_empty() {
        if !label.is_empty() {
            label.push('_');
        }
        label.push_str(&bounds);
    }
    label
}

/// Plans the save directory and per-job output paths of an analysis run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPathPlanner {
    save_dir: PathBuf,
    window_size: u32,
    suffix: String,
}

impl OutputPathPlanner {
    /// Planner writing into an explicit save directory.
    pub fn new(save_dir: &Path, window_size: u32, suffix: Option<&str>) -> Self {
        Self {
            save_dir: save_dir.to_path_buf(),
            window_size,
            suffix: normalize_suffix(suffix),
        }
    }

    /// Planner using the conventional `<root>/<label>_ana_wNN[_suffix]/` directory.
    pub fn under_root(
        output_root: &Path,
        data_dir: &Path,
        range: &RangeFilter,
        window_size: u32,
        suffix: Option<&str>,
    ) -> Self {
        let suffix = normalize_suffix(suffix);
        let label = run_label(data_dir, range);
        // The infix carries its own leading underscore.
        let dir_name = format!(
            "{}{}{}{}",
            label,
            if label.is_empty() { &ANALYSIS_INFIX[1..] } else { ANALYSIS_INFIX },
            window_tag(window_size),
            suffix
        );
        Self {
            save_dir: output_root.join(dir_name),
            window_size,
            suffix,
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.save_dir.join(CONF_DIR)
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn output_stem(&self, input: &str) -> String {
        format!(
            "{}{}{}{}",
            file_stem(input),
            ANALYSIS_INFIX,
            window_tag(self.window_size),
            self.suffix
        )
    }

    /// e.g. `data00012.cxi` -> `data00012_ana_w05_d25.cxi`.
    pub fn output_file_name(&self, input: &str) -> String {
        format!("{}.{}", self.output_stem(input), DERIVED_EXTENSION)
    }

    pub fn output_path(&self, input: &str) -> PathBuf {
        self.save_dir.join(self.output_file_name(input))
    }

    pub fn snapshot_path(&self, input: &str) -> PathBuf {
        self.conf_dir().join(format!("{}.toml", self.output_stem(input)))
    }

    /// Creates the save directory and its `conf/` subdirectory.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.conf_dir())
    }
}

/// Per-job analysis configuration: the shared parameters plus the job's
/// input file, frame budget, window size and injector distance.
pub fn config_snapshot(job: &Job, task: &AnalyzeTask) -> toml::Table {
    let mut table = (*task.params).clone();

    let mut general = vec![
        (
            "filename",
            toml::Value::String(job.input_path.to_string_lossy().into_owned()),
        ),
        ("n_images", toml::Value::Integer(i64::from(task.frame_count))),
    ];
    if let Some(distance) = task.injector_distance {
        general.push(("injector_distance", toml::Value::Float(distance)));
    }
    merge_section(&mut table, "general", general);
    merge_section(
        &mut table,
        "analyse",
        vec![("window_size", toml::Value::Integer(i64::from(task.window_size)))],
    );

    table
}

/// Sets `entries` inside the `[key]` table, replacing a non-table value.
fn merge_section(table: &mut toml::Table, key: &str, entries: Vec<(&str, toml::Value)>) {
    let mut section = match table.remove(key) {
        Some(toml::Value::Table(section)) => section,
        _ => toml::Table::new(),
    };
    for (name, value) in entries {
        section.insert(name.to_string(), value);
    }
    table.insert(key.to_string(), toml::Value::Table(section));
}

/// Writes the job's configuration snapshot to `task.snapshot_path`.
pub fn write_config_snapshot(job: &Job, task: &AnalyzeTask) -> Result<(), SnapshotError> {
    let content = toml::to_string(&config_snapshot(job, task))?;
    let path = &task.snapshot_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| SnapshotError::Io {
        path: path.clone(),
        source,
    })
}
