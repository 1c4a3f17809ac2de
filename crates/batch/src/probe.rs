//! Structural-validity probe for job inputs.
//!
//! Cheap checks run right before a job starts: the input must still exist
//! and be non-empty, and derived artifacts must carry the HDF5 signature.
//! A failing probe skips the job rather than failing it.

use crate::naming::{has_extension, DERIVED_EXTENSION};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Leading bytes of every HDF5 file.
pub const HDF5_SIGNATURE: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Input disappeared between scan and dispatch.
    #[error("input not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("input is empty: {}", .0.display())]
    Empty(PathBuf),

    /// Derived artifact without the HDF5 signature.
    #[error("not an HDF5 container: {}", .0.display())]
    NotHdf5(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probes `path`, dispatching on its extension.
pub fn probe_input(path: &Path) -> Result<(), ProbeError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProbeError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(ProbeError::Io(e)),
    };

    if metadata.len() == 0 {
        return Err(ProbeError::Empty(path.to_path_buf()));
    }

    let is_derived = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| has_extension(n, DERIVED_EXTENSION))
        .unwrap_or(false);
    if is_derived && !has_hdf5_signature(path)? {
        return Err(ProbeError::NotHdf5(path.to_path_buf()));
    }

    Ok(())
}

/// Checks the first eight bytes of `path` against [`HDF5_SIGNATURE`].
pub fn has_hdf5_signature(path: &Path) -> Result<bool, ProbeError> {
    let mut header = [0u8; 8];
    let mut file = File::open(path)?;
    match file.read_exact(&mut header) {
        Ok(()) => Ok(header == HDF5_SIGNATURE),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(ProbeError::Io(e)),
    }
}
