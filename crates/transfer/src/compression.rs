//! zlib stage applied to each chunk independently.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::TransferError;
use crate::types::Chunk;

/// Compresses `data` as a zlib stream.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompresses a zlib stream that must expand to exactly `expected_len`
/// bytes.
///
/// Malformed or truncated input is reported as
/// [`TransferError::CorruptChunk`]. Output is never allowed to grow past
/// `expected_len + 1` bytes.
pub fn decompress_bytes(data: &[u8], expected_len: u64) -> Result<Vec<u8>, TransferError> {
    let capacity = usize::try_from(expected_len).unwrap_or(usize::MAX).min(64 * 1024 * 1024);
    let mut out = Vec::with_capacity(capacity);
    ZlibDecoder::new(data)
        .take(expected_len.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| TransferError::CorruptChunk(format!("zlib: {e}")))?;

    if out.len() as u64 != expected_len {
        return Err(TransferError::CorruptChunk(format!(
            "decompressed to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Applies the compression stage to `chunk`.
pub fn compress(mut chunk: Chunk) -> Result<Chunk, TransferError> {
    if chunk.compressed {
        return Ok(chunk);
    }
    if chunk.encrypted {
        return Err(TransferError::InvalidConfig(
            "compression must run before encryption".into(),
        ));
    }
    chunk.data = compress_bytes(&chunk.data)?;
    chunk.compressed = true;
    Ok(chunk)
}

/// Reverses [`compress`]. Plain chunks pass through unchanged.
pub fn decompress(mut chunk: Chunk) -> Result<Chunk, TransferError> {
    if !chunk.compressed {
        return Ok(chunk);
    }
    if chunk.encrypted {
        return Err(TransferError::InvalidConfig(
            "chunk must be decrypted before decompression".into(),
        ));
    }
    chunk.data = decompress_bytes(&chunk.data, chunk.size as u64)?;
    chunk.compressed = false;
    Ok(chunk)
}
