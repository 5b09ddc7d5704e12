//! Process-lifetime context.
//!
//! A [`Node`] owns the memory store, the trust ledger, the capability registry
//! and the connector, and runs the tasks that tie them together: inbound
//! dispatch, outbound responses from local handlers and the maintenance timer.
//! Nothing here is global; tests run several nodes in one process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::completion::{CompletionProvider, TEXT_COMPLETE};
use crate::config::NodeConfig;
use crate::db::{self, Database};
use crate::error::{CoreError, CoreResult};
use crate::memory::engine::{FactInput, MemoryStore};
use crate::memory::maintenance::SweepReport;
use crate::memory::stats::StatsResponse;
use crate::memory::types::{IngestOutcome, RecordHit, Tier};
use crate::memory::Deadline;
use crate::protocol::{
    decode_frame, AdvertisementBody, Body, Envelope, FactBody, RequestBody, ResponseStatus,
};
use crate::registry::{
    Advertisement, CapabilityHandler, CapabilityRegistry, InboundTask, OutboundResponse, Provider, Responder,
};
use crate::sync::{Advance, ConnectionState, Connector, ConnectorStatus, Delivery, TaskHandle};
use crate::transport::{InboundFrame, Transport};
use crate::trust::{TrustEntry, TrustLedger};

/// How long replay-protection rows are kept.
const SEEN_RETENTION_HOURS: i64 = 24;
/// Requests with no final response after this long are failed locally.
const TASK_EXPIRY: Duration = Duration::from_secs(600);

#[derive(Debug, Default, Serialize)]
pub struct MaintenanceReport {
    pub memory: SweepReport,
    pub expired_advertisements: usize,
    pub relaxed_peers: usize,
    pub pruned_envelopes: usize,
    pub expired_tasks: usize,
    pub readvertised: usize,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub peer_id: String,
    pub connector: ConnectorStatus,
    pub store: StatsResponse,
    pub advertisements: usize,
    pub peers: Vec<TrustEntry>,
}

struct NodeInner {
    peer_id: String,
    config: NodeConfig,
    db: Database,
    store: Arc<MemoryStore>,
    trust: Arc<TrustLedger>,
    registry: Arc<CapabilityRegistry>,
    connector: Connector,
    responses: mpsc::UnboundedSender<OutboundResponse>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start the connector and background tasks. Must run inside a tokio runtime.
    pub async fn start(
        config: NodeConfig,
        db: Database,
        store: MemoryStore,
        transports: Vec<Arc<dyn Transport>>,
        completion: Option<Arc<dyn CompletionProvider>>,
    ) -> CoreResult<Self> {
        let peer_id = config.node.peer_id.clone();
        let trust = Arc::new(TrustLedger::open(db.clone(), config.trust.clone())?);
        let registry = Arc::new(CapabilityRegistry::new(&peer_id, config.registry.clone()));
        let (connector, inbound) = Connector::start(&peer_id, config.sync.clone(), transports, db.clone())?;
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let node = Self {
            inner: Arc::new(NodeInner {
                peer_id,
                config,
                db,
                store: Arc::new(store),
                trust,
                registry,
                connector,
                responses: responses_tx,
                shutdown,
                handles: Mutex::new(Vec::new()),
            }),
        };

        let mut handles = vec![
            tokio::spawn(node.clone().inbound_loop(inbound, shutdown_rx.clone())),
            tokio::spawn(node.clone().response_loop(responses_rx, shutdown_rx.clone())),
        ];
        if node.inner.config.maintenance.enabled {
            handles.push(tokio::spawn(node.clone().maintenance_loop(shutdown_rx)));
        }
        *node.inner.handles.lock() = handles;

        if let Some(provider) = completion {
            let version = provider.model();
            node.advertise(
                TEXT_COMPLETE,
                &version,
                &["llm".to_string()],
                None,
                CapabilityHandler::Completion(provider),
            )
            .await?;
        }

        tracing::info!(peer_id = %node.inner.peer_id, "node started");
        Ok(node)
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.inner.store
    }

    pub fn trust(&self) -> &Arc<TrustLedger> {
        &self.inner.trust
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub async fn ingest(
        &self,
        payload: &str,
        origin_module_id: &str,
        link_id: &str,
        deadline: Option<Deadline>,
    ) -> CoreResult<IngestOutcome> {
        self.inner.store.ingest(payload, origin_module_id, link_id, deadline).await
    }

    pub async fn query(
        &self,
        text: &str,
        k: usize,
        tiers: Option<Vec<Tier>>,
        deadline: Option<Deadline>,
    ) -> CoreResult<Vec<RecordHit>> {
        self.inner.store.query_text(text, k, tiers, deadline).await
    }

    /// Broadcast a stored record to peers as a fact.
    pub async fn share(&self, record_id: &str) -> CoreResult<Delivery> {
        let recalled = self.inner.store.recall(record_id).await?;
        let envelope = Envelope::new(
            &self.inner.peer_id,
            None,
            Body::Fact(FactBody {
                content: recalled.payload,
                link_id: recalled.record.link_id.clone(),
                source_record_id: Some(recalled.record.id.clone()),
            }),
        )
        .with_trust_hint(recalled.record.importance);
        self.inner.connector.send(&envelope).await
    }

    /// Advertise a local capability, register its handler and tell peers.
    pub async fn advertise(
        &self,
        capability_name: &str,
        version: &str,
        tags: &[String],
        ttl: Option<Duration>,
        handler: CapabilityHandler,
    ) -> CoreResult<Advertisement> {
        self.inner.registry.register_handler(capability_name, handler);
        let ad = self.inner.registry.advertise(capability_name, version, tags, ttl);
        self.broadcast_advertisement(&ad, ad.ttl_secs).await?;
        Ok(ad)
    }

    pub async fn withdraw(&self, capability_name: &str) -> CoreResult<()> {
        if let Some(ad) = self.inner.registry.withdraw(capability_name) {
            self.broadcast_advertisement(&ad, 0).await?;
        }
        Ok(())
    }

    /// Announce `ad` to peers; a `ttl_secs` of zero withdraws it.
    async fn broadcast_advertisement(&self, ad: &Advertisement, ttl_secs: u64) -> CoreResult<Delivery> {
        let envelope = Envelope::new(
            &self.inner.peer_id,
            None,
            Body::Advertisement(AdvertisementBody {
                capability_name: ad.capability_name.clone(),
                version: ad.version.clone(),
                tags: ad.tags.clone(),
                ttl_secs,
            }),
        );
        self.inner.connector.send(&envelope).await
    }

    pub fn discover(&self, capability_name: &str) -> Vec<Provider> {
        self.inner
            .registry
            .discover(capability_name, &self.inner.trust, Utc::now())
    }

    /// Send a request to the most trusted remote provider of `capability`.
    pub async fn request(&self, capability: &str, input: serde_json::Value) -> CoreResult<TaskHandle> {
        let provider = self
            .discover(capability)
            .into_iter()
            .find(|p| !p.local)
            .ok_or_else(|| CoreError::NotFound(format!("no remote provider for {capability}")))?;
        self.inner
            .connector
            .request(&provider.advertisement.provider_peer_id, capability, input)
            .await
    }

    pub async fn request_from(
        &self,
        provider: &str,
        capability: &str,
        input: serde_json::Value,
    ) -> CoreResult<TaskHandle> {
        self.inner.connector.request(provider, capability, input).await
    }

    /// Feed back whether a stored fact turned out to be wrong. Returns the
    /// source peer's new score, or `None` for records that did not come from
    /// a peer.
    pub async fn report_fact_outcome(&self, record_id: &str, contradicted: bool) -> CoreResult<Option<f64>> {
        let Some(peer) = self.inner.store.source_peer(record_id).await? else {
            return Ok(None);
        };
        let score = self.inner.trust.record_outcome(&peer, !contradicted)?;
        tracing::info!(record_id, peer = %peer, contradicted, score, "fact outcome recorded");
        Ok(Some(score))
    }

    /// One maintenance tick. Local advertisements are refreshed before the
    /// registry is swept so none lapses between ticks.
    pub async fn run_maintenance(&self) -> CoreResult<MaintenanceReport> {
        let now = Utc::now();
        let mut report = MaintenanceReport {
            memory: self.inner.store.run_maintenance().await?,
            ..Default::default()
        };

        let horizon = Duration::from_secs(self.inner.config.maintenance.interval_secs);
        for ad in self.inner.registry.due_for_refresh(now, horizon) {
            let refreshed = self.inner.registry.advertise(
                &ad.capability_name,
                &ad.version,
                &ad.tags,
                Some(Duration::from_secs(ad.ttl_secs)),
            );
            if let Err(e) = self.broadcast_advertisement(&refreshed, refreshed.ttl_secs).await {
                tracing::warn!(capability = %ad.capability_name, error = %e, "re-advertise failed");
            }
            report.readvertised += 1;
        }

        report.expired_advertisements = self.inner.registry.expire_sweep(now);
        report.relaxed_peers = self.inner.trust.relax_inactive(now)?;
        report.expired_tasks = self.inner.connector.pending().expire(TASK_EXPIRY);
        report.pruned_envelopes = self.prune_seen(now).await?;
        Ok(report)
    }

    pub async fn status(&self) -> CoreResult<NodeStatus> {
        Ok(NodeStatus {
            peer_id: self.inner.peer_id.clone(),
            connector: self.inner.connector.status().await?,
            store: self.inner.store.stats().await?,
            advertisements: self.inner.registry.len(),
            peers: self.inner.trust.entries(),
        })
    }

    /// Wait for the connector to settle after start.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.inner
            .connector
            .wait_for(
                |s| matches!(s, ConnectionState::ConnectedPrimary | ConnectionState::DegradedFallback),
                timeout,
            )
            .await
    }

    /// Drain the connector and stop every task.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.connector.shutdown().await;
        tracing::info!(peer_id = %self.inner.peer_id, "node stopped");
    }

    async fn inbound_loop(self, mut inbound: mpsc::Receiver<InboundFrame>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn response_loop(
        self,
        mut responses: mpsc::UnboundedReceiver<OutboundResponse>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let response = tokio::select! {
                r = responses.recv() => match r {
                    Some(r) => r,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            if let Err(e) = self
                .inner
                .connector
                .respond(&response.requester, &response.correlation_id, response.sequence, response.body)
                .await
            {
                tracing::warn!(correlation_id = %response.correlation_id, error = %e, "response not sent");
            }
        }
    }

    async fn maintenance_loop(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.inner.config.maintenance.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        tracing::error!(error = %e, "maintenance pass failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Decode, filter and route one inbound frame. Corrupt frames are dropped.
    pub async fn handle_frame(&self, frame: InboundFrame) {
        let envelope = match decode_frame(&frame.bytes, self.inner.config.sync.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(transport = %frame.transport, error = %e, "dropping corrupt envelope");
                return;
            }
        };
        if envelope.sender_id == self.inner.peer_id || !envelope.is_for(&self.inner.peer_id) {
            return;
        }
        if !matches!(envelope.body, Body::Heartbeat(_)) {
            match self.first_sighting(&envelope).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        correlation_id = %envelope.correlation_id,
                        sequence = envelope.sequence,
                        sender = %envelope.sender_id,
                        transport = %frame.transport,
                        "replayed envelope dropped"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "replay check failed, dropping envelope");
                    return;
                }
            }
        }
        if let Err(e) = self.inner.trust.observe_peer(&envelope.sender_id) {
            tracing::warn!(peer = %envelope.sender_id, error = %e, "could not record peer");
        }

        tracing::debug!(kind = envelope.kind(), sender = %envelope.sender_id, transport = %frame.transport, "envelope received");
        let sender = envelope.sender_id.clone();
        match &envelope.body {
            Body::Advertisement(ad) => {
                self.inner.registry.ingest_remote(&sender, ad, Utc::now());
            }
            Body::Request(request) => self.handle_request(&envelope, request).await,
            Body::Response(response) => {
                if let Advance::Delivered { closed: true } = self.inner.connector.pending().advance(&envelope) {
                    let positive = response.status == ResponseStatus::Ok;
                    if let Err(e) = self.inner.trust.record_outcome(&sender, positive) {
                        tracing::warn!(peer = %sender, error = %e, "trust update failed");
                    }
                }
            }
            Body::Fact(fact) => {
                if let Err(e) = self.handle_fact(&sender, fact, envelope.trust_hint).await {
                    tracing::warn!(peer = %sender, error = %e, "fact not stored, a redelivery will be accepted");
                    if let Err(e) = self.forget_sighting(&envelope).await {
                        tracing::error!(error = %e, "could not clear replay marker");
                    }
                }
            }
            Body::Heartbeat(_) => {}
        }
    }

    async fn handle_request(&self, envelope: &Envelope, request: &RequestBody) {
        let responder = Responder::new(&envelope.sender_id, &envelope.correlation_id, self.inner.responses.clone());
        match self.inner.registry.handler(&request.capability) {
            Some(CapabilityHandler::Channel(tx)) => {
                let task = InboundTask {
                    correlation_id: envelope.correlation_id.clone(),
                    requester: envelope.sender_id.clone(),
                    capability: request.capability.clone(),
                    input: request.input.clone(),
                    responder,
                };
                // The inbound loop must never block on a collaborator.
                match tx.try_send(task) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(task)) => {
                        tracing::warn!(capability = %task.capability, requester = %task.requester, "capability handler busy");
                        let _ = task.responder.fail(format!("{} is busy, retry later", task.capability));
                    }
                    Err(mpsc::error::TrySendError::Closed(task)) => {
                        let _ = task.responder.fail("capability handler is gone");
                    }
                }
            }
            Some(CapabilityHandler::Completion(provider)) => {
                let prompt = request
                    .input
                    .get("prompt")
                    .and_then(|p| p.as_str())
                    .map(str::to_string)
                    .or_else(|| request.input.as_str().map(str::to_string));
                tokio::spawn(async move {
                    let outcome = match prompt {
                        Some(prompt) => match provider.complete(&prompt).await {
                            Ok(text) => responder.finish(serde_json::json!({ "text": text })),
                            Err(e) => responder.fail(format!("completion failed: {e:#}")),
                        },
                        None => responder.fail("input must carry a prompt"),
                    };
                    if let Err(e) = outcome {
                        tracing::warn!(error = %e, "completion response dropped");
                    }
                });
            }
            None => {
                tracing::debug!(capability = %request.capability, requester = %envelope.sender_id, "request for unknown capability");
                let _ = responder.fail(format!("capability {} not provided here", request.capability));
            }
        }
    }

    async fn handle_fact(&self, sender: &str, fact: &FactBody, confidence: Option<f64>) -> CoreResult<()> {
        let trust = self.inner.trust.get_trust(sender);
        let floor = self.inner.trust.floor();
        let accepted = trust >= floor;
        let confidence = confidence.filter(|c| c.is_finite()).unwrap_or(1.0);
        let importance = (confidence * trust).clamp(0.0, 1.0);

        let input = FactInput {
            content: fact.content.clone(),
            link_id: fact.link_id.clone(),
            sender_id: sender.to_string(),
            importance,
            accepted,
        };
        let outcome = self.inner.store.ingest_fact(input, None).await?;
        if !accepted && !outcome.verified {
            let rejected = CoreError::TrustRejected {
                peer_id: sender.to_string(),
                score: trust,
                floor,
            };
            tracing::warn!(record_id = %outcome.id, error = %rejected, "fact stored unverified");
        } else {
            tracing::info!(record_id = %outcome.id, peer = sender, merged = outcome.merged, verified = outcome.verified, "fact stored");
        }
        Ok(())
    }

    /// Record `(correlation_id, sequence, sender)`; false if already seen.
    async fn first_sighting(&self, envelope: &Envelope) -> CoreResult<bool> {
        let db = self.inner.db.clone();
        let key = (
            envelope.correlation_id.clone(),
            envelope.sequence,
            envelope.sender_id.clone(),
        );
        tokio::task::spawn_blocking(move || -> CoreResult<bool> {
            let conn = db::lock(&db)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO seen_envelopes (correlation_id, sequence, sender_id, seen_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.0, key.1, key.2, Utc::now().to_rfc3339()],
            )?;
            Ok(inserted == 1)
        })
        .await
        .map_err(|e| CoreError::Other(format!("replay check task failed: {e}")))?
    }

    /// Undo [`Self::first_sighting`] for an envelope that was not applied.
    async fn forget_sighting(&self, envelope: &Envelope) -> CoreResult<()> {
        let db = self.inner.db.clone();
        let key = (
            envelope.correlation_id.clone(),
            envelope.sequence,
            envelope.sender_id.clone(),
        );
        tokio::task::spawn_blocking(move || -> CoreResult<()> {
            let conn = db::lock(&db)?;
            conn.execute(
                "DELETE FROM seen_envelopes WHERE correlation_id = ?1 AND sequence = ?2 AND sender_id = ?3",
                params![key.0, key.1, key.2],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Other(format!("replay marker task failed: {e}")))?
    }

    async fn prune_seen(&self, now: chrono::DateTime<Utc>) -> CoreResult<usize> {
        let db = self.inner.db.clone();
        let cutoff = (now - chrono::Duration::hours(SEEN_RETENTION_HOURS)).to_rfc3339();
        tokio::task::spawn_blocking(move || -> CoreResult<usize> {
            let conn = db::lock(&db)?;
            Ok(conn.execute("DELETE FROM seen_envelopes WHERE seen_at < ?1", params![cutoff])?)
        })
        .await
        .map_err(|e| CoreError::Other(format!("prune task failed: {e}")))?
    }
}
