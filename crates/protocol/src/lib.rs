//! Wire formats shared by every chanvault crate.
//!
//! - [`manifest`]: the fenced `key: value` message that describes a transfer.
//! - [`frame`]: the fixed header prepended to every chunk attachment.
//! - [`types`]: transport-facing value types (positions, channel items).

pub mod constants;
pub mod error;
pub mod frame;
pub mod manifest;
pub mod names;
pub mod types;

pub use error::ProtocolError;
pub use frame::{FrameFlags, FrameHeader, chunk_attachment_name};
pub use manifest::{Manifest, looks_like_manifest};
pub use names::validate_file_name;
pub use types::{Attachment, ChannelItem, Position};
