//! Channel transport trait.
//!
//! The binary implements this on top of the real channel. Keeping the engine
//! behind a trait makes it testable with in-memory mocks.

use std::future::Future;
use std::pin::Pin;

use chanvault_protocol::{ChannelItem, Position};

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Rate limiting, timeouts, dropped connections. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Permissions, oversized payloads, unknown positions. Never retried.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Boxed future returned by every transport call.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// An append-only, eventually consistent message channel.
///
/// Every accepted message gets a [`Position`] strictly greater than every
/// earlier one.
pub trait ChannelTransport: Send + Sync {
    /// Posts a message carrying one attachment.
    fn send_blob(&self, name: String, data: Vec<u8>) -> TransportFuture<'_, Position>;

    /// Posts a text-only message.
    fn send_text(&self, content: String) -> TransportFuture<'_, Position>;

    /// Messages strictly between `after` and `before`, ascending.
    fn list_items(&self, after: Position, before: Position)
    -> TransportFuture<'_, Vec<ChannelItem>>;

    /// The `limit` most recent messages, newest first.
    fn recent_items(&self, limit: usize) -> TransportFuture<'_, Vec<ChannelItem>>;

    /// Downloads the attachment of the message at `position`.
    fn fetch_blob(&self, position: Position) -> TransportFuture<'_, Vec<u8>>;

    /// Identifier of the underlying channel, for logs.
    fn channel_id(&self) -> &str;
}
