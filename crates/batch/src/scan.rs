//! Scanner module for discovering capture files in a data directory.
//!
//! Lists the directory once, keeps entries with the input extension and,
//! unless overwriting, drops inputs whose derived artifact already sits next
//! to them. The calibration sentinels are always dropped.

use crate::naming::{
    has_extension, is_calibration_sentinel, replace_extension, ANALYSIS_INFIX,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for directory scans.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The data path does not exist or is not a directory.
    #[error("Data directory not found: {0}")]
    NotADirectory(PathBuf),
}

/// A file discovered on disk with a recognized extension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Candidate {
    /// Bare filename, e.g. `data00012.cxd`.
    pub file_name: String,
}

impl Candidate {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    /// Full path of the candidate inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }
}

/// What to look for in a directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec<'a> {
    /// Extension of the inputs, without the dot.
    pub input_ext: &'a str,
    /// Extension of finished artifacts in the same directory, if any.
    pub done_ext: Option<&'a str>,
    /// Keep inputs even when their artifact already exists.
    pub overwrite: bool,
}

/// Lists the file names directly inside `dir`, skipping hidden entries.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>, ScanError> {
    use walkdir::WalkDir;

    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "unreadable directory entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        match entry.file_name().to_str() {
            Some(name) if !name.starts_with('.') => names.push(name.to_string()),
            Some(_) => {}
            None => debug!(path = %entry.path().display(), "skipping non UTF-8 filename"),
        }
    }

    Ok(names)
}

/// Computes the not-yet-done candidate set of a directory.
///
/// This function:
/// - Keeps entries ending in `.<input_ext>` that are not analysis outputs
/// - Without `overwrite`, removes inputs whose `.<done_ext>` twin exists
/// - Removes the calibration sentinels unconditionally
pub fn scan_candidates(dir: &Path, spec: &ScanSpec<'_>) -> Result<BTreeSet<Candidate>, ScanError> {
    let names = list_file_names(dir)?;
    Ok(select_candidates(&names, spec))
}

/// The pure part of [`scan_candidates`], operating on a directory listing.
pub fn select_candidates(names: &[String], spec: &ScanSpec<'_>) -> BTreeSet<Candidate> {
    let mut inputs: BTreeSet<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| has_extension(name, spec.input_ext))
        .filter(|name| !name.contains(ANALYSIS_INFIX))
        .collect();

    if let (Some(done_ext), false) = (spec.done_ext, spec.overwrite) {
        let done: BTreeSet<String> = names
            .iter()
            .filter(|name| has_extension(name, done_ext))
            .map(|name| replace_extension(name, spec.input_ext))
            .collect();
        inputs.retain(|name| !done.contains(*name));
    }

    inputs.retain(|name| !is_calibration_sentinel(name));

    inputs.into_iter().map(Candidate::new).collect()
}
