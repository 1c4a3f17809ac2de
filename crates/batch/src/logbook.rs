//! Metadata log (experiment log book) loading and lookups.
//!
//! The log is a CSV export with one row per capture file. It is loaded once
//! at batch start, normalized, parsed into typed [`LogRecord`]s and then only
//! read. Workers never see it mutably.

use crate::naming::{self, has_extension, normalize_extension, numbered_file_name, RAW_EXTENSION};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Column holding the canonical capture filename.
pub const COLUMN_FILE: &str = "File";
/// Column holding the free-text category.
pub const COLUMN_DESCRIPTION: &str = "Description";
/// Column holding the captured frame count.
pub const COLUMN_FRAMES: &str = "frames";
/// Column holding the background reference. The trailing space is part of the name.
pub const COLUMN_DARK_CORRECTION: &str = "Dark Correction ";
/// Column holding the analysis comment.
pub const COLUMN_ANALYSIS: &str = "data analysis";
/// Column holding the injector distance.
pub const COLUMN_INJECTOR_DISTANCE: &str = "Injector distance";

const REQUIRED_COLUMNS: [&str; 6] = [
    COLUMN_FILE,
    COLUMN_DESCRIPTION,
    COLUMN_FRAMES,
    COLUMN_DARK_CORRECTION,
    COLUMN_ANALYSIS,
    COLUMN_INJECTOR_DISTANCE,
];

/// Errors raised while loading the metadata log.
#[derive(Debug, Error)]
pub enum MetadataLoadError {
    /// The log file could not be opened or read.
    #[error("Failed to read metadata log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log is not parseable as CSV.
    #[error("Metadata log is not valid CSV: {0}")]
    Csv(#[from] csv::Error),

    /// A required column is absent from the header row.
    #[error("Metadata log is missing required column '{0}'")]
    MissingColumn(String),

    /// Two rows describe the same file.
    #[error("Duplicate metadata log entry for {file_id} at row {row}")]
    DuplicateRecord { file_id: String, row: usize },
}

/// Lookup of a file that has no row in the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No metadata log entry for {0}")]
pub struct RecordNotFound(pub String);

/// Category of a capture file, derived from its log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Sample capture, eligible for processing.
    Normal,
    /// Dark-frame capture used as another file's background.
    Background,
    /// Flat-field capture.
    Flatfield,
    /// Marked "exclude" in the analysis comment.
    Excluded,
}

impl std::fmt::Display for FileClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileClass::Normal => write!(f, "normal"),
            FileClass::Background => write!(f, "background"),
            FileClass::Flatfield => write!(f, "flatfield"),
            FileClass::Excluded => write!(f, "excluded"),
        }
    }
}

/// Background reference as written in the `Dark Correction ` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DarkCorrection {
    /// A full capture filename, e.g. `data02330.cxd`.
    FileName(String),
    /// A bare file number, e.g. `2330` or `2330.0`.
    FileNumber(u32),
    /// Anything else, kept verbatim for the error message.
    Malformed(String),
}

impl DarkCorrection {
    /// Parses a (normalized, trimmed) cell value.
    pub fn parse(value: &str) -> Self {
        if has_extension(value, RAW_EXTENSION) {
            return DarkCorrection::FileName(value.to_string());
        }

        // Spreadsheet exports turn numeric ids into floats ("2330.0").
        let digits = match value.split_once('.') {
            Some((int, frac)) if !frac.is_empty() && frac.bytes().all(|b| b == b'0') => int,
            _ => value,
        };

        let well_formed = !digits.is_empty()
            && digits.len() <= naming::NUMBER_WIDTH
            && digits.bytes().all(|b| b.is_ascii_digit());
        match digits.parse::<u32>() {
            Ok(number) if well_formed => DarkCorrection::FileNumber(number),
            _ => DarkCorrection::Malformed(value.to_string()),
        }
    }

    /// Canonical background filename, zero-padding bare numbers.
    pub fn file_name(&self) -> Option<String> {
        match self {
            DarkCorrection::FileName(name) => Some(name.clone()),
            DarkCorrection::FileNumber(number) => Some(numbered_file_name(*number)),
            DarkCorrection::Malformed(_) => None,
        }
    }
}

/// One row of the metadata log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Canonical filename with normalized extension.
    pub file_id: String,
    /// Free-text category.
    pub description: String,
    /// Total number of captured frames.
    pub frame_count: Option<u32>,
    /// Reference to the background capture for this file.
    pub dark_correction: Option<DarkCorrection>,
    /// Free-text analysis comment.
    pub analysis_comment: String,
    /// Injector distance, when recorded.
    pub injector_distance: Option<f64>,
}

impl LogRecord {
    /// Classifies the record from its description and analysis comment.
    ///
    /// The description sentinels take precedence over the exclusion comment.
    pub fn class(&self) -> FileClass {
        let description = self.description.trim();
        if description.eq_ignore_ascii_case("background") {
            FileClass::Background
        } else if description.eq_ignore_ascii_case("flatfield") {
            FileClass::Flatfield
        } else if self.analysis_comment.to_lowercase().contains("exclude") {
            FileClass::Excluded
        } else {
            FileClass::Normal
        }
    }
}

/// Row as it appears in the CSV export, before typing.
#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "File", default)]
    file: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    #[serde(rename = "frames", default)]
    frames: Option<String>,
    #[serde(rename = "Dark Correction ", default)]
    dark_correction: Option<String>,
    #[serde(rename = "data analysis", default)]
    analysis_comment: Option<String>,
    #[serde(rename = "Injector distance", default)]
    injector_distance: Option<String>,
}

/// Immutable index of log records keyed by filename.
#[derive(Debug, Clone, Default)]
pub struct MetadataLog {
    records: HashMap<String, LogRecord>,
}

impl MetadataLog {
    /// Loads and indexes the log at `path`.
    pub fn load(path: &Path) -> Result<Self, MetadataLoadError> {
        let file = File::open(path).map_err(|source| MetadataLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let log = Self::from_reader(file)?;
        debug!(path = %path.display(), records = log.len(), "metadata log loaded");
        Ok(log)
    }

    /// Parses a CSV log from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MetadataLoadError> {
        let mut csv = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);

        let headers = csv.headers()?.clone();
        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(MetadataLoadError::MissingColumn(column.to_string()));
            }
        }

        let mut records = HashMap::new();
        for (idx, row) in csv.deserialize::<RawRow>().enumerate() {
            // Header is row 1.
            let row_number = idx + 2;
            let row = row?;
            let Some(record) = parse_row(row, row_number) else {
                continue;
            };
            if records.contains_key(&record.file_id) {
                return Err(MetadataLoadError::DuplicateRecord {
                    file_id: record.file_id,
                    row: row_number,
                });
            }
            records.insert(record.file_id.clone(), record);
        }

        Ok(Self { records })
    }

    /// Builds a log directly from records (later duplicates replace earlier ones).
    pub fn from_records(records: impl IntoIterator<Item = LogRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.file_id.clone(), r))
                .collect(),
        }
    }

    /// Exact-match lookup by filename.
    pub fn lookup(&self, file_id: &str) -> Result<&LogRecord, RecordNotFound> {
        self.records
            .get(file_id)
            .ok_or_else(|| RecordNotFound(file_id.to_string()))
    }

    /// Classification of the file's record.
    pub fn classify(&self, file_id: &str) -> Result<FileClass, RecordNotFound> {
        self.lookup(file_id).map(LogRecord::class)
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_row(row: RawRow, row_number: usize) -> Option<LogRecord> {
    let Some(file) = non_empty(row.file) else {
        debug!(row = row_number, "skipping metadata log row without a filename");
        return None;
    };
    let file_id = normalize_extension(&file);

    let frame_count = non_empty(row.frames).and_then(|raw| {
        let parsed = parse_count(&raw);
        if parsed.is_none() {
            warn!(row = row_number, file = %file_id, value = %raw, "unreadable frame count");
        }
        parsed
    });

    let injector_distance = non_empty(row.injector_distance).and_then(|raw| {
        let parsed = raw.parse::<f64>().ok();
        if parsed.is_none() {
            warn!(row = row_number, file = %file_id, value = %raw, "unreadable injector distance");
        }
        parsed
    });

    let dark_correction =
        non_empty(row.dark_correction).map(|raw| DarkCorrection::parse(&normalize_extension(&raw)));

    Some(LogRecord {
        file_id,
        description: non_empty(row.description).unwrap_or_default(),
        frame_count,
        dark_correction,
        analysis_comment: non_empty(row.analysis_comment).unwrap_or_default(),
        injector_distance,
    })
}

// Counts may be exported as floats ("50.0").
fn parse_count(raw: &str) -> Option<u32> {
    if let Ok(count) = raw.parse::<u32>() {
        return Some(count);
    }
    let value = raw.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}
