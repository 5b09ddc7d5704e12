//! Transport adapters.
//!
//! A transport moves opaque frames between peers. It knows nothing about
//! envelopes, retries or fallback; the sync layer decides which transport a
//! frame goes out on and how often it is retried.

pub mod http;
pub mod mailbox;
pub mod memory;
pub mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::config::SyncConfig;
use crate::error::{CoreError, CoreResult};

pub use http::HttpTransport;
pub use mailbox::MailboxTransport;
pub use memory::{MemoryHub, MemoryTransport};
pub use nats::NatsTransport;

/// A frame as received, tagged with the transport it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub transport: String,
    pub bytes: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the link. Idempotent.
    async fn connect(&self) -> CoreResult<()>;

    /// Deliver one frame to `recipient`, or to every known peer for `None`.
    async fn send(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()>;

    /// Liveness check used for heartbeats and reconnect probes.
    async fn probe(&self) -> CoreResult<()>;

    /// Push inbound frames into `sink` until `shutdown` flips to true or the
    /// link drops. Returning `Ok` on a dropped link lets the caller reconnect.
    async fn listen(&self, sink: mpsc::Sender<InboundFrame>, shutdown: watch::Receiver<bool>) -> CoreResult<()>;
}

/// Build the transports named in `config.transports`, in priority order.
pub fn build_transports(config: &SyncConfig, peer_id: &str) -> CoreResult<Vec<Arc<dyn Transport>>> {
    config
        .transports
        .iter()
        .map(|name| -> CoreResult<Arc<dyn Transport>> {
            match name.as_str() {
                "nats" => Ok(Arc::new(NatsTransport::new(config.nats.clone(), peer_id))),
                "http" => Ok(Arc::new(HttpTransport::new(
                    config.http.clone(),
                    peer_id,
                    config.max_frame_bytes,
                )?)),
                "mailbox" => Ok(Arc::new(MailboxTransport::new(config.mailbox.clone(), peer_id))),
                other => Err(CoreError::Config(format!("unknown transport: {other}"))),
            }
        })
        .collect()
}

/// Wait until the shutdown flag is set or its sender is gone.
pub(crate) async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
