//! In-process transport. Nodes attached to the same [`MemoryHub`] exchange
//! frames through channels; the hub can be taken offline to simulate an outage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::{shutdown_signal, InboundFrame, Transport};
use crate::error::{CoreError, CoreResult};

pub struct MemoryHub {
    name: String,
    peers: DashMap<String, mpsc::Sender<InboundFrame>>,
    online: AtomicBool,
    delivered: AtomicUsize,
}

impl MemoryHub {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            peers: DashMap::new(),
            online: AtomicBool::new(true),
            delivered: AtomicUsize::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        tracing::info!(hub = %self.name, online, "memory hub state changed");
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Frames handed to a listener so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Peers with a live listener on this hub.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn transport(self: &Arc<Self>, peer_id: &str) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            peer_id: peer_id.to_string(),
        }
    }

    fn check_online(&self) -> CoreResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CoreError::transport(&self.name, "hub offline"))
        }
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    peer_id: String,
}

impl MemoryTransport {
    async fn deliver(&self, sink: mpsc::Sender<InboundFrame>, frame: Bytes) -> CoreResult<()> {
        sink.send(InboundFrame {
            transport: self.hub.name.clone(),
            bytes: frame,
        })
        .await
        .map_err(|_| CoreError::transport(&self.hub.name, "peer listener gone"))?;
        self.hub.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.hub.name
    }

    async fn connect(&self) -> CoreResult<()> {
        self.hub.check_online()
    }

    async fn send(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()> {
        self.hub.check_online()?;
        match recipient {
            Some(peer) => {
                let sink = self
                    .hub
                    .peers
                    .get(peer)
                    .map(|s| s.clone())
                    .ok_or_else(|| CoreError::transport(&self.hub.name, format!("peer {peer} not attached")))?;
                self.deliver(sink, frame).await
            }
            None => {
                let sinks: Vec<mpsc::Sender<InboundFrame>> = self
                    .hub
                    .peers
                    .iter()
                    .filter(|e| e.key() != &self.peer_id)
                    .map(|e| e.value().clone())
                    .collect();
                for sink in sinks {
                    self.deliver(sink, frame.clone()).await?;
                }
                Ok(())
            }
        }
    }

    async fn probe(&self) -> CoreResult<()> {
        self.hub.check_online()
    }

    async fn listen(&self, sink: mpsc::Sender<InboundFrame>, shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        self.hub.peers.insert(self.peer_id.clone(), sink);
        shutdown_signal(shutdown).await;
        self.hub.peers.remove(&self.peer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_hub_refuses_traffic() {
        let hub = MemoryHub::new("primary");
        let a = hub.transport("a");
        let b = Arc::new(hub.transport("b"));

        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.listen(tx, stop_rx).await })
        };
        while hub.peers.get("b").is_none() {
            tokio::task::yield_now().await;
        }

        a.send(Some("b"), Bytes::from_static(b"up")).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap().bytes[..], b"up");

        hub.set_online(false);
        assert!(a.send(Some("b"), Bytes::from_static(b"down")).await.is_err());
        assert!(a.probe().await.is_err());
        assert_eq!(hub.delivered(), 1);

        stop_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();
        assert!(hub.peers.is_empty());
    }
}
