//! Chunk frame format.
//!
//! Every chunk attachment starts with a fixed header that declares the
//! chunk's identity. Downloads take the sequence index from this header and
//! never from the attachment name.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes   : magic "CVCK"]
//! [1 byte    : frame version]
//! [1 byte    : flags (bit0 = compressed, bit1 = encrypted)]
//! [2 bytes   : reserved, zero]
//! [4 bytes BE: sequence index]
//! [4 bytes BE: total chunks]
//! [8 bytes BE: plain chunk length]
//! [32 bytes  : SHA-256 of the plain chunk bytes]
//! [payload   : chunk bytes after compression / encryption]
//! ```

use crate::ProtocolError;

/// Frame magic bytes.
pub const FRAME_MAGIC: [u8; 4] = *b"CVCK";

/// Current frame version.
pub const FRAME_VERSION: u8 = 1;

/// Header length in bytes.
pub const FRAME_HEADER_LEN: usize = 56;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Transformations applied to a frame payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub compressed: bool,
    pub encrypted: bool,
}

impl FrameFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.compressed {
            b |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            b |= FLAG_ENCRYPTED;
        }
        b
    }

    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        if b & !(FLAG_COMPRESSED | FLAG_ENCRYPTED) != 0 {
            return Err(ProtocolError::MalformedChunkIdentity(format!(
                "unknown frame flags {b:#04x}"
            )));
        }
        Ok(Self {
            compressed: b & FLAG_COMPRESSED != 0,
            encrypted: b & FLAG_ENCRYPTED != 0,
        })
    }
}

/// Declared identity of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub index: u32,
    pub total: u32,
    pub flags: FrameFlags,
    /// Length of the chunk before compression / encryption.
    pub plain_len: u64,
    /// SHA-256 of the chunk before compression / encryption.
    pub digest: [u8; 32],
}

impl FrameHeader {
    /// Serializes the header followed by `payload` into one attachment body.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.push(FRAME_VERSION);
        out.push(self.flags.to_byte());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.plain_len.to_be_bytes());
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(payload);
        out
    }

    /// Parses the header of an attachment body, returning it with the payload.
    pub fn decode(blob: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if blob.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::MalformedChunkIdentity(format!(
                "attachment too short for a chunk frame: {} bytes",
                blob.len()
            )));
        }
        let (header, payload) = blob.split_at(FRAME_HEADER_LEN);

        if header[0..4] != FRAME_MAGIC {
            return Err(ProtocolError::MalformedChunkIdentity(
                "missing chunk frame magic".into(),
            ));
        }
        if header[4] != FRAME_VERSION {
            return Err(ProtocolError::MalformedChunkIdentity(format!(
                "unsupported frame version {}",
                header[4]
            )));
        }
        let flags = FrameFlags::from_byte(header[5])?;

        let index = u32::from_be_bytes(to_array(&header[8..12]));
        let total = u32::from_be_bytes(to_array(&header[12..16]));
        let plain_len = u64::from_be_bytes(to_array(&header[16..24]));
        let digest: [u8; 32] = to_array(&header[24..56]);

        if total == 0 || index >= total {
            return Err(ProtocolError::MalformedChunkIdentity(format!(
                "chunk index {index} outside of 0..{total}"
            )));
        }

        Ok((
            Self {
                index,
                total,
                flags,
                plain_len,
                digest,
            },
            payload,
        ))
    }
}

/// Copies a slice whose length is known from the fixed header layout.
fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Attachment name for a chunk. Cosmetic only; never parsed back.
pub fn chunk_attachment_name(file_name: &str, index: u32) -> String {
    format!("{file_name}_chunk_{index}")
}
