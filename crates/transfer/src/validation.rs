use std::path::Path;

use chanvault_protocol::constants::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use tracing::warn;

use crate::TransferError;

/// Validates a file name taken from a manifest or a source path.
///
/// The name must be a single path component; anything that could escape the
/// destination directory is rejected.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    chanvault_protocol::validate_file_name(name)
        .map_err(|e| TransferError::InvalidPath(e.to_string()))
}

/// Returns the file name of an existing, regular source file.
pub fn source_file_name(path: &Path) -> Result<String, TransferError> {
    let meta = std::fs::metadata(path)
        .map_err(|e| TransferError::InvalidPath(format!("{}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(TransferError::InvalidPath(format!(
            "not a regular file: {}",
            path.display()
        )));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TransferError::InvalidPath(format!("file name is not valid UTF-8: {}", path.display()))
        })?;
    validate_file_name(name)?;
    Ok(name.to_string())
}

/// Rejects a zero chunk size.
pub fn validate_chunk_size(chunk_size: usize) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfig("chunk size must be > 0".into()));
    }
    Ok(())
}

/// Clamps a configured chunk size so a framed chunk fits one attachment.
pub fn clamp_chunk_size(chunk_size: usize) -> usize {
    let clamped = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    if clamped != chunk_size {
        warn!(
            requested = chunk_size,
            used = clamped,
            "chunk size outside of supported range, clamping"
        );
    }
    clamped
}
