//! The synchronization connector.
//!
//! A supervisor task owns the [`ConnectionState`] and is the only place that
//! changes it; everything else sends it [`StateEvent`]s and reads the state
//! through a watch channel. Sends walk the transports in priority order,
//! starting at the primary only while it is healthy, and fall into the
//! durable outbox when every transport has given up.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::outbox::{DeliveredWindow, Outbox};
use super::state::{transition, ConnectionState, StateEvent};
use super::tasks::{PendingRequests, TaskHandle};
use super::worker::{RetryPolicy, TransportWorker};
use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{encode_frame, Body, Envelope, HeartbeatBody, RequestBody, ResponseBody};
use crate::transport::{InboundFrame, Transport};

const OUTBOX_BATCH: usize = 256;

/// Where a send ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "delivery")]
pub enum Delivery {
    Sent { transport: String },
    Queued,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub state: ConnectionState,
    pub transports: Vec<String>,
    pub outbox_pending: usize,
    pub open_requests: usize,
}

struct Inner {
    peer_id: String,
    config: SyncConfig,
    workers: Vec<TransportWorker>,
    state: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<StateEvent>,
    outbox: Outbox,
    delivered: Mutex<DeliveredWindow>,
    pending: PendingRequests,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    /// Spawn workers and the supervisor. Inbound frames from every transport
    /// arrive on the returned receiver.
    pub fn start(
        peer_id: &str,
        config: SyncConfig,
        transports: Vec<Arc<dyn Transport>>,
        db: Database,
    ) -> CoreResult<(Self, mpsc::Receiver<InboundFrame>)> {
        if transports.is_empty() {
            return Err(CoreError::Config("at least one transport is required".into()));
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let policy = RetryPolicy {
            max_attempts: config.max_attempts,
            send_timeout: config.send_timeout(),
            backoff: Backoff::new(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
        };

        let mut handles = Vec::new();
        let workers: Vec<TransportWorker> = transports
            .into_iter()
            .map(|t| {
                let (worker, h) = TransportWorker::spawn(
                    t,
                    policy,
                    config.probe_interval(),
                    inbound_tx.clone(),
                    shutdown_rx.clone(),
                );
                handles.extend(h);
                worker
            })
            .collect();

        let inner = Arc::new(Inner {
            peer_id: peer_id.to_string(),
            delivered: Mutex::new(DeliveredWindow::new(config.delivered_window)),
            config,
            workers,
            state: state_rx,
            events: events_tx,
            outbox: Outbox::new(db),
            pending: PendingRequests::new(),
            shutdown,
            handles: Mutex::new(Vec::new()),
        });

        handles.push(tokio::spawn(supervise(
            Arc::clone(&inner),
            state_tx,
            events_rx,
            shutdown_rx,
        )));
        *inner.handles.lock() = handles;

        let names: Vec<&str> = inner.workers.iter().map(|w| w.name()).collect();
        tracing::info!(peer_id, transports = ?names, "connector started");
        Ok((Self { inner }, inbound_rx))
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Wait until `pred` holds for the current state, or time out.
    pub async fn wait_for(&self, pred: impl Fn(ConnectionState) -> bool, timeout: Duration) -> bool {
        let mut rx = self.inner.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| pred(*s)))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    /// Encode once and deliver over the first transport that accepts it.
    pub async fn send(&self, envelope: &Envelope) -> CoreResult<Delivery> {
        let state = self.state();
        if state == ConnectionState::Closed && !envelope.is_response() {
            return Err(CoreError::Closed);
        }
        let frame = encode_frame(envelope, self.inner.config.max_frame_bytes)?;
        self.inner
            .dispatch(
                &envelope.correlation_id,
                envelope.sequence,
                envelope.recipient.as_deref(),
                frame,
                state,
            )
            .await
    }

    /// Send a capability request and open the task that collects its responses.
    pub async fn request(
        &self,
        provider: &str,
        capability: &str,
        input: serde_json::Value,
    ) -> CoreResult<TaskHandle> {
        let envelope = Envelope::new(
            &self.inner.peer_id,
            Some(provider.to_string()),
            Body::Request(RequestBody {
                capability: capability.to_string(),
                input,
            }),
        );
        let handle = self.inner.pending.open(&envelope.correlation_id, capability, provider);
        match self.send(&envelope).await {
            Ok(delivery) => {
                tracing::debug!(correlation_id = %envelope.correlation_id, capability, provider, ?delivery, "request sent");
                Ok(handle)
            }
            Err(e) => {
                self.inner.pending.fail(&envelope.correlation_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Reply to a request. Allowed after drain.
    pub async fn respond(
        &self,
        requester: &str,
        correlation_id: &str,
        sequence: u32,
        body: ResponseBody,
    ) -> CoreResult<Delivery> {
        let envelope = Envelope::response(&self.inner.peer_id, requester, correlation_id, sequence, body);
        self.send(&envelope).await
    }

    /// Retry queued frames over the primary. Returns the number delivered.
    pub async fn flush_outbox(&self) -> CoreResult<usize> {
        self.inner.flush_outbox().await
    }

    pub async fn status(&self) -> CoreResult<ConnectorStatus> {
        Ok(ConnectorStatus {
            state: self.state(),
            transports: self.inner.workers.iter().map(|w| w.name().to_string()).collect(),
            outbox_pending: self.inner.outbox.len().await?,
            open_requests: self.inner.pending.len(),
        })
    }

    /// Refuse new sends. Responses still go out.
    pub fn drain(&self) {
        let _ = self.inner.events.send(StateEvent::Drain);
    }

    /// Drain, then stop every worker and wait for them.
    pub async fn shutdown(&self) {
        self.drain();
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(peer_id = %self.inner.peer_id, "connector stopped");
    }
}

impl Inner {
    fn first_transport(&self, state: ConnectionState) -> usize {
        match state {
            ConnectionState::ConnectedPrimary | ConnectionState::Closed => 0,
            _ if self.workers.len() == 1 => 0,
            _ => 1,
        }
    }

    async fn dispatch(
        &self,
        correlation_id: &str,
        sequence: u32,
        recipient: Option<&str>,
        frame: bytes::Bytes,
        state: ConnectionState,
    ) -> CoreResult<Delivery> {
        for (index, worker) in self.workers.iter().enumerate().skip(self.first_transport(state)) {
            match worker.submit(recipient, frame.clone()).await {
                Ok(()) => {
                    self.delivered.lock().insert(correlation_id, sequence);
                    if index > 0 {
                        tracing::debug!(correlation_id, transport = worker.name(), "sent over fallback");
                    }
                    return Ok(Delivery::Sent {
                        transport: worker.name().to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(correlation_id, transport = worker.name(), error = %e, "transport exhausted, escalating");
                    if index == 0 {
                        let _ = self.events.send(StateEvent::PrimarySendFailed);
                    }
                }
            }
        }

        self.outbox.push(correlation_id, sequence, recipient, frame).await?;
        tracing::warn!(correlation_id, sequence, "all transports failed, frame queued in outbox");
        Ok(Delivery::Queued)
    }

    async fn flush_outbox(&self) -> CoreResult<usize> {
        let primary = &self.workers[0];
        let mut delivered = 0;
        for entry in self.outbox.pending(OUTBOX_BATCH).await? {
            if self.delivered.lock().contains(&entry.correlation_id, entry.sequence) {
                self.outbox.remove(entry.id).await?;
                continue;
            }
            match primary.submit(entry.recipient.as_deref(), entry.frame.clone()).await {
                Ok(()) => {
                    self.delivered.lock().insert(&entry.correlation_id, entry.sequence);
                    self.outbox.remove(entry.id).await?;
                    delivered += 1;
                }
                Err(e) => {
                    self.outbox.record_attempt(entry.id).await?;
                    tracing::warn!(error = %e, "outbox flush interrupted");
                    break;
                }
            }
        }
        if delivered > 0 {
            tracing::info!(frames = delivered, "outbox flushed");
        }
        Ok(delivered)
    }

    fn primary(&self) -> &Arc<dyn Transport> {
        self.workers[0].transport()
    }

    async fn bounded<F>(&self, fut: F) -> CoreResult<()>
    where
        F: std::future::Future<Output = CoreResult<()>>,
    {
        let limit = self.config.send_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CoreError::Timeout(limit))?
    }

    async fn heartbeat(&self) -> CoreResult<()> {
        let envelope = Envelope::new(
            &self.peer_id,
            None,
            Body::Heartbeat(HeartbeatBody {
                transport: self.primary().name().to_string(),
            }),
        );
        let frame = encode_frame(&envelope, self.config.max_frame_bytes)?;
        self.bounded(self.primary().send(None, frame)).await
    }

    async fn probe(&self) -> CoreResult<()> {
        self.bounded(async {
            self.primary().connect().await?;
            self.primary().probe().await
        })
        .await
    }
}

/// Sole owner of the connection state.
async fn supervise(
    inner: Arc<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    mut events: mpsc::UnboundedReceiver<StateEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut probe = tokio::time::interval(inner.config.probe_interval());
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut missed = 0u32;

    let apply = |event: StateEvent| -> Option<ConnectionState> {
        let current = *state_tx.borrow();
        let next = transition(current, event)?;
        tracing::info!(from = %current, to = %next, ?event, "connector state change");
        state_tx.send_replace(next);
        Some(next)
    };

    apply(StateEvent::Start);
    let handshake = match inner.probe().await {
        Ok(()) => StateEvent::HandshakeSucceeded,
        Err(e) => {
            tracing::warn!(transport = inner.primary().name(), error = %e, "primary handshake failed");
            StateEvent::HandshakeFailed
        }
    };
    if apply(handshake) == Some(ConnectionState::ConnectedPrimary) {
        spawn_flush(&inner);
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return };
                if apply(event) == Some(ConnectionState::Closed) {
                    tracing::info!("connector drained");
                }
            }
            _ = heartbeat.tick() => {
                if *state_tx.borrow() != ConnectionState::ConnectedPrimary {
                    continue;
                }
                match inner.heartbeat().await {
                    Ok(()) => missed = 0,
                    Err(e) => {
                        missed += 1;
                        tracing::debug!(missed, error = %e, "heartbeat missed");
                        if missed >= inner.config.missed_heartbeats.max(1) {
                            apply(StateEvent::HeartbeatsMissed);
                            missed = 0;
                        }
                    }
                }
            }
            _ = probe.tick() => {
                if *state_tx.borrow() != ConnectionState::DegradedFallback {
                    continue;
                }
                apply(StateEvent::ProbeDue);
                let outcome = match inner.probe().await {
                    Ok(()) => StateEvent::ProbeSucceeded,
                    Err(e) => {
                        tracing::debug!(error = %e, "primary probe failed");
                        StateEvent::ProbeFailed
                    }
                };
                if apply(outcome) == Some(ConnectionState::ConnectedPrimary) {
                    missed = 0;
                    spawn_flush(&inner);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    apply(StateEvent::Drain);
                    return;
                }
            }
        }
    }
}

fn spawn_flush(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(e) = inner.flush_outbox().await {
            tracing::warn!(error = %e, "outbox flush failed");
        }
    });
}
