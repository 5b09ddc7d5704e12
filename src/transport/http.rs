//! Direct-link transport: frames POSTed peer to peer.
//!
//! Each node listens on `sync.http.bind` and serves:
//! - `POST /hsp/envelope` with the raw frame as body
//! - `GET /hsp/health`
//!
//! Peers are addressed through the static `sync.http.peers` map.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{shutdown_signal, InboundFrame, Transport};
use crate::config::HttpLinkConfig;
use crate::error::{CoreError, CoreResult};

const NAME: &str = "http";
const SENDER_HEADER: &str = "x-hsp-sender";

pub struct HttpTransport {
    config: HttpLinkConfig,
    peer_id: String,
    client: reqwest::Client,
    max_frame_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: HttpLinkConfig, peer_id: &str, max_frame_bytes: usize) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            peer_id: peer_id.to_string(),
            client,
            max_frame_bytes,
        })
    }

    fn peer_url(&self, peer_id: &str) -> CoreResult<&str> {
        self.config
            .peers
            .get(peer_id)
            .map(|u| u.trim_end_matches('/'))
            .ok_or_else(|| CoreError::transport(NAME, format!("no address for peer {peer_id}")))
    }

    async fn post(&self, base: &str, frame: Bytes) -> CoreResult<()> {
        let response = self
            .client
            .post(format!("{base}/hsp/envelope"))
            .header(SENDER_HEADER, &self.peer_id)
            .body(frame)
            .send()
            .await
            .map_err(|e| CoreError::transport(NAME, format!("POST {base} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::transport(
                NAME,
                format!("{base} answered {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Router serving the inbound endpoints into `sink`.
    pub fn router(sink: mpsc::Sender<InboundFrame>, max_frame_bytes: usize) -> Router {
        Router::new()
            .route("/hsp/envelope", post(receive_frame))
            .route("/hsp/health", get(|| async { "ok" }))
            .layer(DefaultBodyLimit::max(max_frame_bytes))
            .with_state(sink)
    }
}

async fn receive_frame(State(sink): State<mpsc::Sender<InboundFrame>>, body: Bytes) -> StatusCode {
    let frame = InboundFrame {
        transport: NAME.to_string(),
        bytes: body,
    };
    match sink.send(frame).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn send(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()> {
        if let Some(peer) = recipient {
            let base = self.peer_url(peer)?;
            return self.post(base, frame).await;
        }

        // Broadcast succeeds if any peer took the frame.
        let mut last_err = CoreError::transport(NAME, "no peers configured");
        let mut delivered = false;
        for (peer, base) in &self.config.peers {
            if *peer == self.peer_id {
                continue;
            }
            match self.post(base.trim_end_matches('/'), frame.clone()).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "broadcast leg failed");
                    last_err = e;
                }
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(last_err)
        }
    }

    async fn probe(&self) -> CoreResult<()> {
        for base in self.config.peers.values() {
            let url = format!("{}/hsp/health", base.trim_end_matches('/'));
            if let Ok(response) = self.client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
        }
        Err(CoreError::transport(NAME, "no peer answered the health check"))
    }

    async fn listen(&self, sink: mpsc::Sender<InboundFrame>, shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| CoreError::transport(NAME, format!("bind {} failed: {e}", self.config.bind)))?;
        tracing::info!(bind = %self.config.bind, "direct-link listener started");

        axum::serve(listener, Self::router(sink, self.max_frame_bytes))
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await
            .map_err(|e| CoreError::transport(NAME, format!("listener failed: {e}")))
    }
}
