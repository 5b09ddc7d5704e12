//! Durable file-queue transport for peers sharing a filesystem.
//!
//! Layout: `{root}/{peer_id}/inbox/{uuid-v7}.frame`. Writers create a `.tmp`
//! file and rename it into place, so readers never see a partial frame.
//! Readers poll their own inbox in name order and delete each file after it
//! has been handed to the sink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{InboundFrame, Transport};
use crate::protocol::validate_peer_id;
use crate::config::{expand_tilde, MailboxConfig};
use crate::error::{CoreError, CoreResult};

const NAME: &str = "mailbox";
const FRAME_EXT: &str = "frame";

pub struct MailboxTransport {
    root: PathBuf,
    peer_id: String,
    poll_interval: Duration,
}

impl MailboxTransport {
    pub fn new(config: MailboxConfig, peer_id: &str) -> Self {
        Self {
            root: expand_tilde(&config.root),
            peer_id: peer_id.to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }

    /// Inbox directory of `peer_id`; refuses ids that would leave the root.
    pub fn inbox(&self, peer_id: &str) -> CoreResult<PathBuf> {
        validate_peer_id(peer_id)?;
        Ok(self.root.join(peer_id).join("inbox"))
    }

    async fn deliver(&self, inbox: &Path, frame: &[u8]) -> CoreResult<()> {
        tokio::fs::create_dir_all(inbox).await.map_err(io_err)?;
        let name = Uuid::now_v7().to_string();
        let tmp = inbox.join(format!("{name}.tmp"));
        let dest = inbox.join(format!("{name}.{FRAME_EXT}"));
        tokio::fs::write(&tmp, frame).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &dest).await.map_err(io_err)?;
        Ok(())
    }

    /// Inboxes of every other peer that has ever created one.
    async fn peer_inboxes(&self) -> CoreResult<Vec<PathBuf>> {
        let mut inboxes = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(inboxes),
            Err(e) => return Err(io_err(e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            if entry.file_name().to_string_lossy() == self.peer_id.as_str() {
                continue;
            }
            if entry.file_type().await.map_err(io_err)?.is_dir() {
                inboxes.push(entry.path().join("inbox"));
            }
        }
        Ok(inboxes)
    }

    /// Complete frames waiting in our inbox, oldest first.
    async fn pending(&self) -> CoreResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.inbox(&self.peer_id)?).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(io_err(e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == FRAME_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn io_err(err: std::io::Error) -> CoreError {
    CoreError::transport(NAME, err.to_string())
}

#[async_trait]
impl Transport for MailboxTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> CoreResult<()> {
        tokio::fs::create_dir_all(self.inbox(&self.peer_id)?)
            .await
            .map_err(io_err)
    }

    async fn send(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()> {
        match recipient {
            Some(peer) => self.deliver(&self.inbox(peer)?, &frame).await,
            None => {
                let inboxes = self.peer_inboxes().await?;
                if inboxes.is_empty() {
                    return Err(CoreError::transport(NAME, "no peer mailboxes to broadcast to"));
                }
                for inbox in inboxes {
                    self.deliver(&inbox, &frame).await?;
                }
                Ok(())
            }
        }
    }

    async fn probe(&self) -> CoreResult<()> {
        self.connect().await?;
        let meta = tokio::fs::metadata(&self.root).await.map_err(io_err)?;
        if meta.permissions().readonly() {
            return Err(CoreError::transport(NAME, "mailbox root is read-only"));
        }
        Ok(())
    }

    async fn listen(&self, sink: mpsc::Sender<InboundFrame>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        self.connect().await?;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    for path in self.pending().await? {
                        let bytes = match tokio::fs::read(&path).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "unreadable mailbox frame");
                                continue;
                            }
                        };
                        let frame = InboundFrame {
                            transport: NAME.to_string(),
                            bytes: Bytes::from(bytes),
                        };
                        if sink.send(frame).await.is_err() {
                            return Ok(());
                        }
                        tokio::fs::remove_file(&path).await.map_err(io_err)?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(root: &Path, peer: &str) -> MailboxTransport {
        MailboxTransport::new(
            MailboxConfig {
                root: root.to_string_lossy().into_owned(),
                poll_interval_ms: 10,
            },
            peer,
        )
    }

    #[tokio::test]
    async fn frames_are_delivered_in_order_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let a = transport(dir.path(), "a");
        let b = transport(dir.path(), "b");
        b.connect().await.unwrap();

        a.send(Some("b"), Bytes::from_static(b"one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        a.send(Some("b"), Bytes::from_static(b"two")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { b.listen(tx, stop_rx).await });

        assert_eq!(&rx.recv().await.unwrap().bytes[..], b"one");
        assert_eq!(&rx.recv().await.unwrap().bytes[..], b"two");
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let left = std::fs::read_dir(dir.path().join("b").join("inbox")).unwrap().count();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let a = transport(dir.path(), "a");
        for peer in ["b", "c"] {
            transport(dir.path(), peer).connect().await.unwrap();
        }
        a.connect().await.unwrap();
        a.send(None, Bytes::from_static(b"hello")).await.unwrap();

        for peer in ["b", "c"] {
            let n = std::fs::read_dir(dir.path().join(peer).join("inbox")).unwrap().count();
            assert_eq!(n, 1, "{peer} inbox");
        }
        let own = std::fs::read_dir(dir.path().join("a").join("inbox")).unwrap().count();
        assert_eq!(own, 0);
    }

    #[tokio::test]
    async fn broadcast_without_peers_fails() {
        let dir = tempfile::tempdir().unwrap();
        let a = transport(dir.path(), "a");
        a.connect().await.unwrap();
        assert!(a.send(None, Bytes::from_static(b"x")).await.is_err());
        assert!(a.probe().await.is_ok());
    }

    #[tokio::test]
    async fn recipient_outside_the_root_is_refused() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("mail");
        let a = transport(&root, "a");

        let err = a.send(Some("../escaped"), Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, CoreError::CorruptEnvelope(_)));
        assert!(!outer.path().join("escaped").exists());
        assert!(a.send(Some("/tmp/abs"), Bytes::from_static(b"x")).await.is_err());
    }
}
