//! Protocol error types.

/// Errors produced while reading or writing chanvault wire formats.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("manifest parse error at `{line}`: {reason}")]
    ManifestParse { line: String, reason: String },

    #[error("invalid manifest: {0}")]
    ManifestValidation(String),

    #[error("malformed chunk identity: {0}")]
    MalformedChunkIdentity(String),
}
