//! Primary transport over a NATS broker.
//!
//! Subjects: `{prefix}.broadcast` for fan-out and `{prefix}.peer.{peer_id}`
//! for direct delivery.

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{shutdown_signal, InboundFrame, Transport};
use crate::config::NatsConfig;
use crate::protocol::validate_peer_id;
use crate::error::{CoreError, CoreResult};

const NAME: &str = "nats";

pub struct NatsTransport {
    config: NatsConfig,
    peer_id: String,
    client: Mutex<Option<Client>>,
}

impl NatsTransport {
    pub fn new(config: NatsConfig, peer_id: &str) -> Self {
        Self {
            config,
            peer_id: peer_id.to_string(),
            client: Mutex::new(None),
        }
    }

    pub fn broadcast_subject(&self) -> String {
        format!("{}.broadcast", self.config.subject_prefix)
    }

    /// Direct subject of `peer_id`; refuses ids carrying wildcards.
    pub fn peer_subject(&self, peer_id: &str) -> CoreResult<String> {
        validate_peer_id(peer_id)?;
        Ok(format!("{}.peer.{peer_id}", self.config.subject_prefix))
    }

    fn client(&self) -> CoreResult<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| CoreError::transport(NAME, "not connected"))
    }
}

fn nats_err(context: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::transport(NAME, format!("{context}: {err}"))
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> CoreResult<()> {
        if self.client.lock().is_some() {
            return Ok(());
        }
        tracing::info!(url = %self.config.url, "connecting to NATS");
        // Fail fast on the first connect; async-nats reconnects on its own afterwards.
        let client = ConnectOptions::new()
            .name(&self.peer_id)
            .connection_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| nats_err("connect failed", e))?;
        *self.client.lock() = Some(client);
        tracing::info!(url = %self.config.url, "connected to NATS");
        Ok(())
    }

    async fn send(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()> {
        let subject = match recipient {
            Some(peer) => self.peer_subject(peer)?,
            None => self.broadcast_subject(),
        };
        let client = self.client()?;
        client
            .publish(subject, frame)
            .await
            .map_err(|e| nats_err("publish failed", e))?;
        client.flush().await.map_err(|e| nats_err("flush failed", e))
    }

    async fn probe(&self) -> CoreResult<()> {
        self.connect().await?;
        let client = self.client()?;
        if !matches!(client.connection_state(), async_nats::connection::State::Connected) {
            return Err(CoreError::transport(NAME, "broker connection is down"));
        }
        client.flush().await.map_err(|e| nats_err("flush failed", e))
    }

    async fn listen(&self, sink: mpsc::Sender<InboundFrame>, shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let client = self.client()?;
        let broadcast = client
            .subscribe(self.broadcast_subject())
            .await
            .map_err(|e| nats_err("subscribe failed", e))?;
        let direct = client
            .subscribe(self.peer_subject(&self.peer_id)?)
            .await
            .map_err(|e| nats_err("subscribe failed", e))?;
        let mut messages = futures::stream::select(broadcast, direct);

        let stop = shutdown_signal(shutdown);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => return Ok(()),
                message = messages.next() => {
                    let Some(message) = message else {
                        tracing::warn!("NATS subscription ended");
                        return Ok(());
                    };
                    let frame = InboundFrame {
                        transport: NAME.to_string(),
                        bytes: message.payload,
                    };
                    if sink.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
