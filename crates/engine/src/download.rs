//! Download path: list the chunk window, fetch with bounded concurrency,
//! stage, verify and reassemble by sequence index.

use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chanvault_protocol::{ChannelItem, FrameHeader, Manifest, Position, ProtocolError};
use chanvault_transfer::{
    ChunkAssembler, ChunkCipher, TransferError, decompress_bytes, digest_bytes,
};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::JobContext;
use crate::error::EngineError;
use crate::retry::{RetryPolicy, with_retry};
use crate::transport::ChannelTransport;
use crate::types::DownloadReport;

/// A fetched chunk whose payload sits in the staging directory.
struct StagedChunk {
    position: Position,
    header: FrameHeader,
    path: PathBuf,
}

type FetchOutcome = (Position, Result<StagedChunk, EngineError>);

/// Downloads the chunks named by `manifest` and writes the file into
/// `dest_dir`.
///
/// Nothing appears at the final path unless every chunk was fetched, decoded
/// and verified. Staged payloads and partial output are removed on every
/// exit path.
pub(crate) async fn download(
    ctx: &JobContext,
    manifest: &Manifest,
    dest_dir: &Path,
    cipher: Option<Arc<ChunkCipher>>,
) -> Result<DownloadReport, EngineError> {
    manifest.validate()?;
    if manifest.encrypted && cipher.is_none() {
        return Err(TransferError::KeyNotFound(manifest.key_id.clone().unwrap_or_default()).into());
    }
    tokio::fs::create_dir_all(dest_dir).await?;

    let (first, last) = (manifest.first_position, manifest.last_position);
    let items = with_retry(&ctx.config.retry, &ctx.cancel, "list chunks", || {
        ctx.transport.list_items(first.prev(), last.next())
    })
    .await?;
    let items: Vec<ChannelItem> = items
        .into_iter()
        .filter(|i| i.has_attachment() && i.position >= first && i.position <= last)
        .collect();

    ctx.job.set_total(items.len() as u32);
    ctx.emit_started();
    info!(
        job = %ctx.job.id(),
        file = %manifest.file_name,
        chunks = items.len(),
        channel = ctx.transport.channel_id(),
        "download started"
    );

    let staging = tempfile::Builder::new()
        .prefix(".chanvault-staging-")
        .tempdir_in(dest_dir)?;

    let gate = Arc::new(Semaphore::new(ctx.config.concurrency));
    let mut tasks: JoinSet<FetchOutcome> = JoinSet::new();
    let mut pending = items.into_iter();
    let mut staged: Vec<StagedChunk> = Vec::new();
    let mut expected_total = manifest.total_chunks;
    let mut aborted = false;

    while !pending.as_slice().is_empty() {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                aborted = true;
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let (position, result) = joined?;
                aborted |= record_fetch(ctx, position, result, &mut expected_total, &mut staged)?;
                continue;
            }
            permit = Arc::clone(&gate).acquire_owned() => permit
                .map_err(|e| EngineError::Task(format!("admission gate closed: {e}")))?,
        };
        let Some(item) = pending.next() else {
            break;
        };

        let transport = Arc::clone(&ctx.transport);
        let policy = ctx.config.retry.clone();
        let cancel = ctx.cancel.clone();
        let dir = staging.path().to_path_buf();
        tasks.spawn(async move {
            let _permit = permit;
            let result = fetch_and_stage(&*transport, &policy, &cancel, item.position, &dir).await;
            (item.position, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (position, result) = joined?;
        aborted |= record_fetch(ctx, position, result, &mut expected_total, &mut staged)?;
    }

    if aborted || ctx.cancel.is_cancelled() {
        return Err(EngineError::Aborted);
    }

    // Without a manifest total and without a single frame, chunk 0 is
    // missing at the very least.
    let total = expected_total.unwrap_or(1);
    let mut assembler = ChunkAssembler::new(total)?;
    let mut duplicates = 0usize;
    for chunk in staged {
        let (index, len, position) = (chunk.header.index, chunk.header.plain_len, chunk.position);
        if !assembler.insert(index, len, chunk)? {
            debug!(index, %position, "duplicate chunk ignored");
            duplicates += 1;
        }
    }

    let missing = assembler.missing();
    if !missing.is_empty() {
        warn!(job = %ctx.job.id(), ?missing, "download incomplete, no output written");
        return Err(EngineError::IncompleteTransfer { missing });
    }

    let manifest_owned = manifest.clone();
    let dest = dest_dir.to_path_buf();
    let (path, bytes_written) = tokio::task::spawn_blocking(move || {
        combine_staged(assembler, cipher.as_deref(), &dest, &manifest_owned)
    })
    .await??;
    drop(staging);

    info!(
        job = %ctx.job.id(),
        path = %path.display(),
        bytes = bytes_written,
        chunks = total,
        duplicates,
        "download complete"
    );
    Ok(DownloadReport {
        path,
        bytes_written,
        total_chunks: total,
        duplicates,
    })
}

/// Fetches one chunk message and writes its payload to `dir`.
async fn fetch_and_stage(
    transport: &dyn ChannelTransport,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    position: Position,
    dir: &Path,
) -> Result<StagedChunk, EngineError> {
    let what = format!("fetch {position}");
    let blob = with_retry(policy, cancel, &what, || transport.fetch_blob(position)).await?;
    let (header, payload) = FrameHeader::decode(&blob)?;
    let path = dir.join(format!("{position}.part"));
    tokio::fs::write(&path, payload).await?;
    Ok(StagedChunk {
        position,
        header,
        path,
    })
}

/// Applies one fetch outcome to the job.
///
/// Returns `Ok(true)` if the task stopped because of cancellation. A chunk
/// whose declared identity contradicts the transfer fails the whole download.
fn record_fetch(
    ctx: &JobContext,
    position: Position,
    result: Result<StagedChunk, EngineError>,
    expected_total: &mut Option<u32>,
    staged: &mut Vec<StagedChunk>,
) -> Result<bool, EngineError> {
    match result {
        Ok(chunk) => {
            match *expected_total {
                Some(total) if total != chunk.header.total => {
                    return Err(ProtocolError::MalformedChunkIdentity(format!(
                        "chunk at {position} declares {} chunks, expected {total}",
                        chunk.header.total
                    ))
                    .into());
                }
                Some(_) => {}
                None => *expected_total = Some(chunk.header.total),
            }
            debug!(index = chunk.header.index, %position, "chunk staged");
            staged.push(chunk);
            let progress = ctx.job.record_success();
            ctx.emit_progress(progress.completed, progress.total);
            Ok(false)
        }
        Err(EngineError::Aborted) => Ok(true),
        Err(e @ EngineError::Protocol(_)) => Err(e),
        Err(e) => {
            warn!(%position, error = %e, "chunk fetch failed");
            let progress = ctx.job.record_failure(None);
            ctx.emit_chunk_failed(None, &e);
            ctx.emit_progress(progress.completed, progress.total);
            Ok(false)
        }
    }
}

/// Reverses the upload stages for one staged payload and verifies it.
fn decode_payload(
    index: u32,
    chunk: &StagedChunk,
    cipher: Option<&ChunkCipher>,
) -> Result<Vec<u8>, TransferError> {
    let mut data = std::fs::read(&chunk.path)?;
    let flags = chunk.header.flags;
    if flags.encrypted {
        let cipher = cipher.ok_or_else(|| {
            TransferError::KeyNotFound(format!("no key for encrypted chunk {index}"))
        })?;
        data = cipher
            .decrypt(&data)
            .map_err(|e| TransferError::CorruptChunk(format!("chunk {index}: {e}")))?;
    }
    if flags.compressed {
        data = decompress_bytes(&data, chunk.header.plain_len)?;
    }
    if data.len() as u64 != chunk.header.plain_len {
        return Err(TransferError::CorruptChunk(format!(
            "chunk {index} is {} bytes, frame declares {}",
            data.len(),
            chunk.header.plain_len
        )));
    }
    if digest_bytes(&data) != chunk.header.digest {
        return Err(TransferError::CorruptChunk(format!(
            "chunk {index} does not match its digest"
        )));
    }
    Ok(data)
}

/// Writes the verified chunks into a temporary file next to the target and
/// persists it once the whole-file size and checksum match.
fn combine_staged(
    assembler: ChunkAssembler<StagedChunk>,
    cipher: Option<&ChunkCipher>,
    dest_dir: &Path,
    manifest: &Manifest,
) -> Result<(PathBuf, u64), TransferError> {
    let target = dest_dir.join(&manifest.file_name);
    let tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", manifest.file_name))
        .suffix(".part")
        .tempfile_in(dest_dir)?;

    let mut hasher = Sha256::new();
    let mut out = BufWriter::new(tmp);
    let written = assembler.write_to(&mut out, |index, chunk| {
        let bytes = decode_payload(index, &chunk, cipher)?;
        hasher.update(&bytes);
        Ok(bytes)
    })?;
    let tmp = out.into_inner().map_err(|e| TransferError::Io(e.into_error()))?;

    if let Some(expected) = manifest.file_size
        && expected != written
    {
        warn!(expected, written, "reassembled size differs from manifest");
        return Err(TransferError::ChecksumMismatch);
    }
    if let Some(expected) = &manifest.checksum {
        let actual = hex::encode(hasher.finalize());
        if actual != *expected {
            warn!(%expected, %actual, "reassembled checksum differs from manifest");
            return Err(TransferError::ChecksumMismatch);
        }
    }

    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| TransferError::Io(e.error))?;
    Ok((target, written))
}
