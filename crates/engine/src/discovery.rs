//! Manifest discovery among the most recent channel messages.

use chanvault_protocol::{ChannelItem, Manifest, looks_like_manifest};
use tracing::debug;

use crate::error::EngineError;
use crate::transport::ChannelTransport;

/// Returns the newest manifest among `items` (given newest first).
///
/// Only the first `window` items are considered. A message shaped like a
/// manifest that fails to decode is reported as that decode error rather
/// than skipped.
pub fn find_manifest(items: &[ChannelItem], window: usize) -> Result<Manifest, EngineError> {
    for item in items.iter().take(window) {
        if !looks_like_manifest(&item.content) {
            continue;
        }
        debug!(position = %item.position, "found manifest candidate");
        return Ok(Manifest::decode(&item.content)?);
    }
    Err(EngineError::ManifestNotFound { window })
}

/// Scans the last `window` messages of `transport` for a manifest.
pub async fn locate_manifest(
    transport: &dyn ChannelTransport,
    window: usize,
) -> Result<Manifest, EngineError> {
    let items = transport.recent_items(window).await?;
    find_manifest(&items, window)
}

#[cfg(test)]
mod tests {
    use chanvault_protocol::{Position, ProtocolError};

    use super::*;
    use crate::mock::MockTransport;

    fn manifest_text(name: &str, first: u64, last: u64) -> String {
        Manifest::new(name, Position(first), Position(last)).encode()
    }

    #[tokio::test]
    async fn picks_newest_manifest() {
        let t = MockTransport::new();
        t.push(&manifest_text("old.bin", 1, 2), None);
        t.push("chatter", None);
        t.push(&manifest_text("new.bin", 3, 4), None);
        t.push("more chatter", None);

        let m = locate_manifest(&t, 10).await.unwrap();
        assert_eq!(m.file_name, "new.bin");
    }

    #[tokio::test]
    async fn manifest_outside_window_is_not_found() {
        let t = MockTransport::new();
        t.push(&manifest_text("a.bin", 1, 2), None);
        for i in 0..10 {
            t.push(&format!("message {i}"), None);
        }

        let err = locate_manifest(&t, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::ManifestNotFound { window: 10 }));
        assert!(locate_manifest(&t, 11).await.is_ok());
    }

    #[tokio::test]
    async fn chunk_messages_are_skipped() {
        let t = MockTransport::new();
        t.push(&manifest_text("a.bin", 1, 2), None);
        t.push("", Some(("a.bin_chunk_0", vec![1, 2, 3])));
        assert_eq!(locate_manifest(&t, 10).await.unwrap().file_name, "a.bin");
    }

    #[test]
    fn broken_manifest_surfaces_decode_error() {
        let items = vec![ChannelItem {
            position: Position(9),
            content: "```\nFile: a.txt\nFirst Chunk ID: x\nLast Chunk ID: 2\n```".into(),
            attachments: vec![],
        }];
        let err = find_manifest(&items, 10).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol(ProtocolError::ManifestParse { .. })
        ));
    }
}
