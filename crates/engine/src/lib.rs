//! Chunked transfer engine.
//!
//! Drives the upload and download of a chunk set against an abstract
//! [`ChannelTransport`]. The binary supplies the transport; everything here is
//! transport-agnostic and testable with mocks.
//!
//! # Upload
//!
//! 1. **Split**: stream the source in fixed-size chunks
//! 2. **Encode**: compress, encrypt and frame each chunk
//! 3. **Send**: bounded-concurrency sends with retry and backoff
//! 4. **Manifest**: post the manifest once every chunk has landed
//!
//! # Download
//!
//! 1. **Locate**: find the manifest among recent messages
//! 2. **List**: enumerate the chunk window named by the manifest
//! 3. **Fetch**: bounded-concurrency fetches into a staging directory
//! 4. **Combine**: verify, reassemble by sequence index, persist atomically

mod download;
mod upload;

pub mod discovery;
pub mod engine;
pub mod error;
pub mod retry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock;

pub use discovery::{find_manifest, locate_manifest};
pub use engine::TransferEngine;
pub use error::EngineError;
pub use retry::{RetryPolicy, with_retry};
pub use transport::{ChannelTransport, TransportError, TransportFuture};
pub use types::{DownloadReport, TransferConfig, TransferEvent};
