//! Directory-backed channel.
//!
//! A channel is a directory holding `index.json` (the message log) and
//! `blobs/<position>.bin` (one file per attachment). It behaves like the
//! remote channels the engine is written against: append-only, positions
//! strictly increasing from 1, and an optional per-attachment size limit.

mod channel;
mod error;

pub use channel::{DEFAULT_ATTACHMENT_LIMIT, LocalChannel};
pub use error::LocalChannelError;
