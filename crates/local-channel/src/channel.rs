use std::io::Write;
use std::path::{Path, PathBuf};

use chanvault_engine::{ChannelTransport, TransportError, TransportFuture};
use chanvault_protocol::constants::ATTACHMENT_LIMIT;
use chanvault_protocol::{Attachment, ChannelItem, Position};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LocalChannelError;

/// Attachment limit applied by [`LocalChannel::open`].
pub const DEFAULT_ATTACHMENT_LIMIT: usize = ATTACHMENT_LIMIT;

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    #[serde(default)]
    last_position: u64,
    #[serde(default)]
    items: Vec<ChannelItem>,
}

/// An append-only channel stored in a directory.
///
/// Appends are serialized through an async mutex. The index is replaced
/// atomically after the blob is on disk, so a crash never leaves an index
/// entry pointing at a missing attachment.
pub struct LocalChannel {
    root: PathBuf,
    id: String,
    attachment_limit: Option<usize>,
    index: Mutex<Index>,
}

impl LocalChannel {
    /// Opens the channel at `root`, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LocalChannelError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(BLOB_DIR)).await?;
        let index = read_index(&root).await?;
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        debug!(channel = %id, messages = index.items.len(), "channel opened");
        Ok(Self {
            root,
            id,
            attachment_limit: Some(DEFAULT_ATTACHMENT_LIMIT),
            index: Mutex::new(index),
        })
    }

    /// Replaces the per-attachment size limit. `None` disables it.
    pub fn with_attachment_limit(mut self, limit: Option<usize>) -> Self {
        self.attachment_limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-reads the index from disk, picking up appends by other processes.
    pub async fn reload(&self) -> Result<(), LocalChannelError> {
        let fresh = read_index(&self.root).await?;
        *self.index.lock().await = fresh;
        Ok(())
    }

    /// Number of messages in the channel.
    pub async fn len(&self) -> usize {
        self.index.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn blob_path(&self, position: Position) -> PathBuf {
        self.root.join(BLOB_DIR).join(format!("{position}.bin"))
    }

    async fn append(
        &self,
        content: String,
        attachment: Option<(String, Vec<u8>)>,
    ) -> Result<Position, LocalChannelError> {
        if let Some((name, data)) = &attachment
            && let Some(limit) = self.attachment_limit
            && data.len() > limit
        {
            return Err(LocalChannelError::TooLarge {
                name: name.clone(),
                size: data.len(),
                limit,
            });
        }

        let mut index = self.index.lock().await;
        let position = Position(index.last_position + 1);
        let attachments = match attachment {
            Some((name, data)) => {
                tokio::fs::write(self.blob_path(position), &data).await?;
                vec![Attachment {
                    name,
                    size: data.len() as u64,
                }]
            }
            None => Vec::new(),
        };

        index.items.push(ChannelItem {
            position,
            content,
            attachments,
        });
        index.last_position = position.0;

        if let Err(e) = write_index(&self.root, &index).await {
            index.items.pop();
            index.last_position = position.0 - 1;
            if let Err(rm) = tokio::fs::remove_file(self.blob_path(position)).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                warn!(%position, error = %rm, "failed to remove orphaned blob");
            }
            return Err(e);
        }
        debug!(channel = %self.id, %position, "message appended");
        Ok(position)
    }

    async fn read_blob(&self, position: Position) -> Result<Vec<u8>, LocalChannelError> {
        {
            let index = self.index.lock().await;
            let found = index
                .items
                .binary_search_by_key(&position, |i| i.position)
                .ok()
                .map(|at| index.items[at].has_attachment())
                .unwrap_or(false);
            if !found {
                return Err(LocalChannelError::NoAttachment(position.0));
            }
        }
        Ok(tokio::fs::read(self.blob_path(position)).await?)
    }
}

async fn read_index(root: &Path) -> Result<Index, LocalChannelError> {
    match tokio::fs::read(root.join(INDEX_FILE)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_index(root: &Path, index: &Index) -> Result<(), LocalChannelError> {
    let bytes = serde_json::to_vec_pretty(index)?;
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), LocalChannelError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(root.join(INDEX_FILE)).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

impl ChannelTransport for LocalChannel {
    fn send_blob(&self, name: String, data: Vec<u8>) -> TransportFuture<'_, Position> {
        Box::pin(async move { Ok(self.append(String::new(), Some((name, data))).await?) })
    }

    fn send_text(&self, content: String) -> TransportFuture<'_, Position> {
        Box::pin(async move { Ok(self.append(content, None).await?) })
    }

    fn list_items(
        &self,
        after: Position,
        before: Position,
    ) -> TransportFuture<'_, Vec<ChannelItem>> {
        Box::pin(async move {
            let index = self.index.lock().await;
            Ok(index
                .items
                .iter()
                .filter(|i| i.position > after && i.position < before)
                .cloned()
                .collect())
        })
    }

    fn recent_items(&self, limit: usize) -> TransportFuture<'_, Vec<ChannelItem>> {
        Box::pin(async move {
            let index = self.index.lock().await;
            Ok(index.items.iter().rev().take(limit).cloned().collect())
        })
    }

    fn fetch_blob(&self, position: Position) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async move { Ok(self.read_blob(position).await?) })
    }

    fn channel_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chanvault_engine::{TransferConfig, TransferEngine};

    use super::*;

    fn positions(items: &[ChannelItem]) -> Vec<u64> {
        items.iter().map(|i| i.position.0).collect()
    }

    #[tokio::test]
    async fn positions_start_at_one_and_increase() {
        let dir = tempfile::tempdir().unwrap();
        let ch = LocalChannel::open(dir.path().join("general")).await.unwrap();
        assert!(ch.is_empty().await);

        let a = ch.send_text("hello".into()).await.unwrap();
        let b = ch.send_blob("x.bin".into(), vec![1, 2, 3]).await.unwrap();
        let c = ch.send_text("bye".into()).await.unwrap();

        assert_eq!((a, b, c), (Position(1), Position(2), Position(3)));
        assert_eq!(ch.channel_id(), "general");
        assert_eq!(ch.fetch_blob(b).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn listing_bounds_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let ch = LocalChannel::open(dir.path()).await.unwrap();
        for i in 0..6 {
            ch.send_text(format!("m{i}")).await.unwrap();
        }

        let items = ch.list_items(Position(2), Position(5)).await.unwrap();
        assert_eq!(positions(&items), vec![3, 4]);
        assert!(ch.list_items(Position(3), Position(4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ch = LocalChannel::open(dir.path()).await.unwrap();
        for i in 0..5 {
            ch.send_text(format!("m{i}")).await.unwrap();
        }

        let items = ch.recent_items(3).await.unwrap();
        assert_eq!(positions(&items), vec![5, 4, 3]);
        assert_eq!(items[0].content, "m4");
        assert_eq!(ch.recent_items(50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn oversized_attachment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ch = LocalChannel::open(dir.path())
            .await
            .unwrap()
            .with_attachment_limit(Some(4));

        let err = ch.send_blob("big".into(), vec![0; 5]).await.unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
        assert_eq!(ch.send_blob("ok".into(), vec![0; 4]).await.unwrap(), Position(1));
    }

    #[tokio::test]
    async fn text_message_has_no_blob() {
        let dir = tempfile::tempdir().unwrap();
        let ch = LocalChannel::open(dir.path()).await.unwrap();
        let p = ch.send_text("just text".into()).await.unwrap();

        assert!(matches!(ch.fetch_blob(p).await, Err(TransportError::Fatal(_))));
        assert!(matches!(
            ch.fetch_blob(Position(99)).await,
            Err(TransportError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn reopening_reloads_the_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ch = LocalChannel::open(dir.path()).await.unwrap();
            ch.send_text("first".into()).await.unwrap();
            ch.send_blob("b".into(), b"data".to_vec()).await.unwrap();
        }

        let ch = LocalChannel::open(dir.path()).await.unwrap();
        assert_eq!(ch.len().await, 2);
        assert_eq!(ch.fetch_blob(Position(2)).await.unwrap(), b"data");
        assert_eq!(ch.send_text("third".into()).await.unwrap(), Position(3));
    }

    #[tokio::test]
    async fn reload_sees_appends_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let reader = LocalChannel::open(dir.path()).await.unwrap();
        let writer = LocalChannel::open(dir.path()).await.unwrap();
        writer.send_text("from elsewhere".into()).await.unwrap();

        assert!(reader.is_empty().await);
        reader.reload().await.unwrap();
        assert_eq!(reader.recent_items(1).await.unwrap()[0].content, "from elsewhere");
    }

    #[tokio::test]
    async fn engine_round_trip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("movie.mkv");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let channel = Arc::new(LocalChannel::open(dir.path().join("videos")).await.unwrap());
        let config = TransferConfig {
            chunk_size: 3000,
            ..Default::default()
        };
        let engine = TransferEngine::new(channel.clone(), config.clone()).unwrap();
        let sent = engine.send(&src).await.unwrap();
        assert_eq!(sent.total_chunks, Some(4));
        assert_eq!(channel.len().await, 5);

        let reopened: Arc<dyn ChannelTransport> =
            Arc::new(LocalChannel::open(dir.path().join("videos")).await.unwrap());
        let out = dir.path().join("out");
        let engine = TransferEngine::new(reopened, config).unwrap();
        let (manifest, report) = engine.combine_from_channel(&out).await.unwrap();
        assert_eq!(manifest.file_name, "movie.mkv");
        assert_eq!(std::fs::read(report.path).unwrap(), data);
    }
}
