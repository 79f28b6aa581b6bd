//! Chunked transfer building blocks: deterministic splitting and ordered
//! reassembly, per-chunk compression and encryption stages, and the state
//! of a single transfer job.

mod chunked;
mod compression;
mod encryption;
mod progress;
mod types;
mod validation;

pub use chunked::{
    ChunkAssembler, ChunkReader, calculate_file_checksum, checksum_bytes, combine, digest_bytes,
    split, total_chunks_for,
};
pub use compression::{compress, compress_bytes, decompress, decompress_bytes};
pub use encryption::{ChunkCipher, KEY_LEN, KeyStore, NONCE_LEN};
pub use progress::{SpeedCalculator, render_progress_bar};
pub use types::{Chunk, Direction, JobProgress, JobStatus, TransferJob};
pub use validation::{clamp_chunk_size, source_file_name, validate_chunk_size, validate_file_name};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("missing chunks: {missing:?}")]
    MissingChunk { missing: Vec<u32> },

    #[error("duplicate chunk {index} with conflicting length")]
    DuplicateChunk { index: u32 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] chanvault_protocol::ProtocolError),
}
