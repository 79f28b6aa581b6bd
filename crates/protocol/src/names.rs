//! File-name rules for names that end up on the local filesystem.

use crate::ProtocolError;

/// Longest accepted file name in bytes (common filesystem limit).
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Validates that `name` is a single, filesystem-safe path component.
///
/// Rejects:
/// - Empty names, `.` and `..`
/// - Path separators (`/`, `\`) and drive prefixes (`:`)
/// - NUL and other control characters
/// - Leading or trailing whitespace or backticks, which the manifest line
///   format cannot carry
/// - Names longer than [`MAX_FILE_NAME_LEN`] bytes
pub fn validate_file_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::ManifestValidation("empty file name".into()));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::ManifestValidation(format!(
            "reserved file name: {name}"
        )));
    }

    if name.len() > MAX_FILE_NAME_LEN {
        return Err(ProtocolError::ManifestValidation(format!(
            "file name too long: {} bytes (max {MAX_FILE_NAME_LEN})",
            name.len()
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
    {
        return Err(ProtocolError::ManifestValidation(format!(
            "file name contains forbidden character {c:?}: {name}"
        )));
    }

    let edge = |c: char| c.is_whitespace() || c == '`';
    if name.starts_with(edge) || name.ends_with(edge) {
        return Err(ProtocolError::ManifestValidation(format!(
            "file name starts or ends with whitespace or a backtick: {name:?}"
        )));
    }

    Ok(())
}
