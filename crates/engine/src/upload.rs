//! Upload path: split, encode, send with bounded concurrency, post manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chanvault_protocol::{FrameFlags, FrameHeader, Manifest, Position, chunk_attachment_name};
use chanvault_transfer::{
    Chunk, ChunkCipher, ChunkReader, TransferError, compress, digest_bytes, source_file_name,
    total_chunks_for,
};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::JobContext;
use crate::error::EngineError;
use crate::retry::with_retry;

/// A chunk ready to be posted.
struct EncodedChunk {
    index: u32,
    name: String,
    body: Vec<u8>,
}

/// Streaming state moved in and out of the blocking reader.
struct SourceCursor {
    reader: ChunkReader,
    hasher: Sha256,
    file_name: String,
    total: u32,
    compress: bool,
    cipher: Option<Arc<ChunkCipher>>,
}

impl SourceCursor {
    /// Reads and encodes the next chunk. Returns `None` at end of file.
    fn next_encoded(&mut self) -> Result<Option<EncodedChunk>, TransferError> {
        let Some(chunk) = self.reader.next_chunk()? else {
            return Ok(None);
        };
        if chunk.index >= self.total {
            return Err(TransferError::CorruptChunk(format!(
                "source grew while reading: chunk {} beyond expected {}",
                chunk.index, self.total
            )));
        }
        self.hasher.update(&chunk.data);
        Ok(Some(self.encode(chunk)?))
    }

    fn encode(&self, chunk: Chunk) -> Result<EncodedChunk, TransferError> {
        let index = chunk.index;
        let plain_len = chunk.size as u64;
        let digest = digest_bytes(&chunk.data);

        let mut chunk = if self.compress { compress(chunk)? } else { chunk };
        if let Some(cipher) = &self.cipher {
            chunk = cipher.encrypt_chunk(chunk)?;
        }

        let header = FrameHeader {
            index,
            total: self.total,
            flags: FrameFlags {
                compressed: chunk.compressed,
                encrypted: chunk.encrypted,
            },
            plain_len,
            digest,
        };
        Ok(EncodedChunk {
            index,
            name: chunk_attachment_name(&self.file_name, index),
            body: header.encode(&chunk.data),
        })
    }
}

/// Opens `source` and measures it. Runs on the blocking pool.
fn open_source(
    source: &Path,
    chunk_size: usize,
) -> Result<(String, u64, u32, ChunkReader), TransferError> {
    let file_name = source_file_name(source)?;
    let file = std::fs::File::open(source)?;
    let file_size = file.metadata()?.len();
    let total = total_chunks_for(file_size, chunk_size)?;
    let reader = ChunkReader::new(file, chunk_size)?;
    Ok((file_name, file_size, total, reader))
}

/// Result of one chunk task, returned to the coordinator.
type SendOutcome = (u32, Result<Position, EngineError>);

/// Sends every chunk of `source`, then the manifest.
///
/// The coordinator is the only writer of job progress. A semaphore permit is
/// taken before a chunk is read, so no more than `concurrency` chunks are
/// held in memory or in flight at once.
pub(crate) async fn upload(
    ctx: &JobContext,
    source: PathBuf,
    cipher: Option<Arc<ChunkCipher>>,
) -> Result<Manifest, EngineError> {
    let chunk_size = ctx.config.chunk_size;
    let (file_name, file_size, total, reader) =
        tokio::task::spawn_blocking(move || open_source(&source, chunk_size)).await??;

    ctx.job.set_total(total);
    ctx.emit_started();
    info!(
        job = %ctx.job.id(),
        file = %file_name,
        bytes = file_size,
        chunks = total,
        channel = ctx.transport.channel_id(),
        "upload started"
    );

    let key_id = cipher.as_ref().map(|c| c.key_id().to_string());
    let mut cursor = Some(SourceCursor {
        reader,
        hasher: Sha256::new(),
        file_name: file_name.clone(),
        total,
        compress: ctx.config.compress,
        cipher,
    });

    let gate = Arc::new(Semaphore::new(ctx.config.concurrency));
    let mut tasks: JoinSet<SendOutcome> = JoinSet::new();
    let mut positions: Vec<Position> = Vec::with_capacity(total as usize);
    let mut produced = 0u32;
    let mut aborted = false;

    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                aborted = true;
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let (index, result) = joined?;
                aborted |= record_send(ctx, index, result, &mut positions);
                continue;
            }
            permit = Arc::clone(&gate).acquire_owned() => permit
                .map_err(|e| EngineError::Task(format!("admission gate closed: {e}")))?,
        };

        let Some(mut state) = cursor.take() else {
            break;
        };
        let (state, next) = tokio::task::spawn_blocking(move || {
            let next = state.next_encoded();
            (state, next)
        })
        .await?;
        cursor = Some(state);

        let Some(encoded) = next? else {
            drop(permit);
            break;
        };
        produced += 1;

        let transport = Arc::clone(&ctx.transport);
        let policy = ctx.config.retry.clone();
        let cancel = ctx.cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let EncodedChunk { index, name, body } = encoded;
            let what = format!("send {name}");
            let result = with_retry(&policy, &cancel, &what, || {
                transport.send_blob(name.clone(), body.clone())
            })
            .await;
            (index, result)
        });
    }

    // Every chunk reaches a terminal state before the manifest is considered.
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined?;
        aborted |= record_send(ctx, index, result, &mut positions);
    }

    if aborted || ctx.cancel.is_cancelled() {
        return Err(EngineError::Aborted);
    }

    let failed = ctx.job.failed();
    if !failed.is_empty() {
        warn!(job = %ctx.job.id(), ?failed, "upload incomplete, manifest not sent");
        return Err(EngineError::PartiallyFailed { failed });
    }
    if produced != total {
        return Err(TransferError::CorruptChunk(format!(
            "source shrank while reading: {produced} of {total} chunks"
        ))
        .into());
    }

    let (Some(first), Some(last)) = (
        positions.iter().min().copied(),
        positions.iter().max().copied(),
    ) else {
        return Err(EngineError::Task("no chunk positions recorded".into()));
    };
    let checksum = cursor
        .map(|c| hex::encode(c.hasher.finalize()))
        .ok_or_else(|| EngineError::Task("source cursor lost".into()))?;

    let mut manifest = Manifest::new(file_name, first, last);
    manifest.compressed = ctx.config.compress;
    manifest.total_chunks = Some(total);
    manifest.file_size = Some(file_size);
    manifest.checksum = Some(checksum);
    manifest.encrypted = key_id.is_some();
    manifest.key_id = key_id;
    manifest.created_at = Some(chrono::Utc::now());

    let text = manifest.encode();
    let position = with_retry(&ctx.config.retry, &ctx.cancel, "send manifest", || {
        ctx.transport.send_text(text.clone())
    })
    .await?;

    info!(
        job = %ctx.job.id(),
        file = %manifest.file_name,
        first = %first,
        last = %last,
        manifest = %position,
        "upload complete"
    );
    Ok(manifest)
}

/// Applies one chunk outcome to the job. Returns `true` if the chunk task
/// stopped because of cancellation.
fn record_send(
    ctx: &JobContext,
    index: u32,
    result: Result<Position, EngineError>,
    positions: &mut Vec<Position>,
) -> bool {
    match result {
        Ok(position) => {
            debug!(index, %position, "chunk sent");
            positions.push(position);
            let progress = ctx.job.record_success();
            ctx.emit_progress(progress.completed, progress.total);
            false
        }
        Err(EngineError::Aborted) => true,
        Err(e) => {
            warn!(index, error = %e, "chunk failed");
            let progress = ctx.job.record_failure(Some(index));
            ctx.emit_chunk_failed(Some(index), &e);
            ctx.emit_progress(progress.completed, progress.total);
            false
        }
    }
}
