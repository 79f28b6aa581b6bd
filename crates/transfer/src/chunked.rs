use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the raw digest.
pub fn digest_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(digest_bytes(data))
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Number of chunks a source of `size` bytes splits into.
///
/// An empty source still yields one (empty) chunk.
pub fn total_chunks_for(size: u64, chunk_size: usize) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfig("chunk size must be > 0".into()));
    }
    let count = size.div_ceil(chunk_size as u64).max(1);
    u32::try_from(count).map_err(|_| {
        TransferError::InvalidConfig(format!("{size} bytes needs too many chunks ({count})"))
    })
}

/// Fills `buf` from `reader`, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a byte source in fixed-size, sequentially indexed chunks.
///
/// Every chunk is exactly `chunk_size` bytes except the last, which holds
/// the remainder. An empty source produces a single zero-length chunk.
pub struct ChunkReader<R = std::fs::File> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    next_index: u32,
    done: bool,
}

impl ChunkReader<std::fs::File> {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        Self::new(file, chunk_size)
    }
}

impl<R: Read> ChunkReader<R> {
    /// Wraps `reader`. A zero `chunk_size` is rejected.
    pub fn new(reader: R, chunk_size: usize) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk size must be > 0".into()));
        }
        Ok(Self {
            reader,
            chunk_size,
            offset: 0,
            next_index: 0,
            done: false,
        })
    }

    /// Reads the next chunk. Returns `None` once the source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let n = read_full(&mut self.reader, &mut buf)?;
        buf.truncate(n);

        if n < self.chunk_size {
            self.done = true;
        }
        // A short read after at least one chunk means the previous chunk was
        // the last one.
        if n == 0 && self.next_index > 0 {
            return Ok(None);
        }

        let chunk = Chunk::new(self.next_index, self.offset, buf);
        self.offset += n as u64;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Byte offset of the next chunk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Index the next chunk will carry.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Splits `reader` into an ordered list of chunks.
pub fn split<R: Read>(reader: R, chunk_size: usize) -> Result<Vec<Chunk>, TransferError> {
    ChunkReader::new(reader, chunk_size)?.collect()
}

// ---------------------------------------------------------------------------
// ChunkAssembler
// ---------------------------------------------------------------------------

/// Collects chunks that arrive in any order and writes them out by index.
///
/// `T` is whatever the caller keeps per chunk: the bytes themselves, or a
/// handle to where they were staged.
pub struct ChunkAssembler<T> {
    total: u32,
    parts: BTreeMap<u32, (u64, T)>,
}

impl<T> ChunkAssembler<T> {
    /// Creates an assembler expecting indices `0..total`.
    pub fn new(total: u32) -> Result<Self, TransferError> {
        if total == 0 {
            return Err(TransferError::InvalidConfig(
                "a transfer has at least one chunk".into(),
            ));
        }
        Ok(Self {
            total,
            parts: BTreeMap::new(),
        })
    }

    /// Records chunk `index` of `len` plain bytes.
    ///
    /// Returns `Ok(false)` when an identical copy of the chunk is already
    /// held. A second copy with a different length is a
    /// [`TransferError::DuplicateChunk`].
    pub fn insert(&mut self, index: u32, len: u64, part: T) -> Result<bool, TransferError> {
        if index >= self.total {
            return Err(TransferError::InvalidConfig(format!(
                "chunk index {index} outside of 0..{}",
                self.total
            )));
        }
        match self.parts.get(&index) {
            Some((existing, _)) if *existing == len => Ok(false),
            Some(_) => Err(TransferError::DuplicateChunk { index }),
            None => {
                self.parts.insert(index, (len, part));
                Ok(true)
            }
        }
    }

    /// Expected number of chunks.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Indices in `0..total` that have not been received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|i| !self.parts.contains_key(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    /// Writes every chunk to `out` in ascending index order.
    ///
    /// `load` turns a stored part into its plain bytes. Nothing is written
    /// unless every index is present. Returns the number of bytes written.
    pub fn write_to<W, F>(self, out: &mut W, mut load: F) -> Result<u64, TransferError>
    where
        W: Write,
        F: FnMut(u32, T) -> Result<Vec<u8>, TransferError>,
    {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransferError::MissingChunk { missing });
        }

        let mut written = 0u64;
        for (index, (len, part)) in self.parts {
            let bytes = load(index, part)?;
            if bytes.len() as u64 != len {
                return Err(TransferError::CorruptChunk(format!(
                    "chunk {index} is {} bytes, expected {len}",
                    bytes.len()
                )));
            }
            out.write_all(&bytes)?;
            written += len;
        }
        out.flush()?;
        Ok(written)
    }
}

/// Reassembles `chunks`, given in any order, into `out`.
///
/// Fails with [`TransferError::MissingChunk`] if any index in `0..total` is
/// absent and with [`TransferError::DuplicateChunk`] on conflicting copies.
pub fn combine<I, W>(chunks: I, total: u32, out: &mut W) -> Result<u64, TransferError>
where
    I: IntoIterator<Item = Chunk>,
    W: Write,
{
    let mut assembler = ChunkAssembler::new(total)?;
    for chunk in chunks {
        if chunk.compressed || chunk.encrypted {
            return Err(TransferError::InvalidConfig(format!(
                "chunk {} still carries a compression or encryption stage",
                chunk.index
            )));
        }
        assembler.insert(chunk.index, chunk.size as u64, chunk.data)?;
    }
    assembler.write_to(out, |_, data| Ok(data))
}
