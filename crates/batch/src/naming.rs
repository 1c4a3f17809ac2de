//! Filename conventions for capture files.
//!
//! Capture files are named `dataNNNNN.cxd`, where the five digits at a fixed
//! offset are the file's identity. Derived artifacts swap the extension for
//! `.cxi`. Some metadata log entries carry the misspelled `.cdx` extension.

/// Extension of raw camera captures.
pub const RAW_EXTENSION: &str = "cxd";

/// Extension of derived (converted) artifacts.
pub const DERIVED_EXTENSION: &str = "cxi";

/// Known misspelling of [`RAW_EXTENSION`] found in hand-written logs.
pub const MISSPELLED_RAW_EXTENSION: &str = "cdx";

/// Prefix of every numbered capture filename.
pub const FILE_PREFIX: &str = "data";

/// Byte offset of the numeric token inside a filename.
pub const NUMBER_OFFSET: usize = 4;

/// Width of the zero-padded numeric token.
pub const NUMBER_WIDTH: usize = 5;

/// Infix separating an input stem from the analysis window in output names.
pub const ANALYSIS_INFIX: &str = "_ana_w";

/// Flat-field captures that are never processed, whatever the log says.
pub const CALIBRATION_SENTINELS: [&str; 2] = ["_flatfield01624.cxd", "data01624.cxd"];

/// Rewrites a trailing `.cdx` to `.cxd`; any other value is returned unchanged.
pub fn normalize_extension(name: &str) -> String {
    match name.strip_suffix(MISSPELLED_RAW_EXTENSION) {
        Some(stem) if stem.ends_with('.') => format!("{}{}", stem, RAW_EXTENSION),
        _ => name.to_string(),
    }
}

/// Checks whether `name` ends with `.<ext>` (case-sensitive).
pub fn has_extension(name: &str, ext: &str) -> bool {
    name.strip_suffix(ext)
        .map(|stem| stem.ends_with('.') && stem.len() > 1)
        .unwrap_or(false)
}

/// Returns `name` without its final extension.
pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Swaps the final extension of `name` for `ext`.
pub fn replace_extension(name: &str, ext: &str) -> String {
    format!("{}.{}", file_stem(name), ext)
}

/// Extracts the fixed-width numeric token, e.g. `data00123.cxd` -> `123`.
pub fn file_number(name: &str) -> Option<u32> {
    let token = name.get(NUMBER_OFFSET..NUMBER_OFFSET + NUMBER_WIDTH)?;
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Synthesizes the canonical raw filename for a file number.
pub fn numbered_file_name(number: u32) -> String {
    format!(
        "{}{:0width$}.{}",
        FILE_PREFIX,
        number,
        RAW_EXTENSION,
        width = NUMBER_WIDTH
    )
}

/// Checks if `name` is one of the reserved flat-field filenames.
pub fn is_calibration_sentinel(name: &str) -> bool {
    CALIBRATION_SENTINELS.contains(&name)
}
