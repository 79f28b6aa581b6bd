use std::path::PathBuf;

use chanvault_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MANIFEST_SEARCH_WINDOW, MAX_CHUNK_SIZE,
};
use chanvault_settings::UserSettings;
use chanvault_transfer::{Direction, clamp_chunk_size};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Default number of chunk operations in flight per job.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Per-job configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Admission gate size: chunk operations allowed in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Plain bytes per chunk.
    pub chunk_size: usize,
    pub compress: bool,
    /// Recent messages scanned when looking for a manifest.
    pub manifest_search_window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: false,
            manifest_search_window: DEFAULT_MANIFEST_SEARCH_WINDOW,
        }
    }
}

impl TransferConfig {
    /// Builds a config from a user's stored defaults.
    ///
    /// The stored chunk size is clamped so a framed chunk always fits one
    /// attachment.
    pub fn from_settings(settings: &UserSettings) -> Self {
        Self {
            chunk_size: clamp_chunk_size(settings.chunk_size),
            compress: settings.compress,
            ..Default::default()
        }
    }

    /// Replaces the chunk size, clamped to the supported range.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = clamp_chunk_size(chunk_size);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 {
            return Err(EngineError::InvalidConfig("concurrency must be > 0".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "chunk size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.manifest_search_window == 0 {
            return Err(EngineError::InvalidConfig(
                "manifest search window must be > 0".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Events emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        job_id: String,
        direction: Direction,
        file_name: String,
        total: u32,
    },
    /// A chunk reached a final outcome. `completed` never decreases.
    Progress {
        job_id: String,
        completed: u32,
        total: u32,
    },
    ChunkFailed {
        job_id: String,
        index: Option<u32>,
        error: String,
    },
    Completed {
        job_id: String,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Final location of the reassembled file.
    pub path: PathBuf,
    pub bytes_written: u64,
    pub total_chunks: u32,
    /// Chunk messages that repeated an index already received.
    pub duplicates: usize,
}
