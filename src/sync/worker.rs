//! One worker per transport: a send loop that owns retries for that transport
//! and a receive loop that keeps the listener alive.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use crate::error::{CoreError, CoreResult};
use crate::transport::{InboundFrame, Transport};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub send_timeout: Duration,
    pub backoff: Backoff,
}

struct SendJob {
    recipient: Option<String>,
    frame: Bytes,
    reply: oneshot::Sender<CoreResult<()>>,
}

pub struct TransportWorker {
    transport: Arc<dyn Transport>,
    jobs: mpsc::Sender<SendJob>,
}

impl TransportWorker {
    /// Start the send and receive loops. Both stop when `shutdown` flips.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        reconnect_every: Duration,
        inbound: mpsc::Sender<InboundFrame>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (jobs, rx) = mpsc::channel(64);
        let send_loop = tokio::spawn(send_loop(Arc::clone(&transport), policy, rx, shutdown.clone()));
        let recv_loop = tokio::spawn(receive_loop(Arc::clone(&transport), reconnect_every, inbound, shutdown));
        (Self { transport, jobs }, vec![send_loop, recv_loop])
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Queue a frame and wait for the outcome of all retries.
    pub async fn submit(&self, recipient: Option<&str>, frame: Bytes) -> CoreResult<()> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(SendJob {
                recipient: recipient.map(str::to_string),
                frame,
                reply,
            })
            .await
            .map_err(|_| CoreError::transport(self.name(), "worker stopped"))?;
        outcome
            .await
            .map_err(|_| CoreError::transport(self.name(), "worker dropped the send"))?
    }
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    mut jobs: mpsc::Receiver<SendJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let outcome = send_with_retry(transport.as_ref(), &policy, job.recipient.as_deref(), job.frame).await;
        let _ = job.reply.send(outcome);
    }
}

/// Up to `max_attempts` tries, each bounded by `send_timeout`, with backoff
/// between them.
pub async fn send_with_retry(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    recipient: Option<&str>,
    frame: Bytes,
) -> CoreResult<()> {
    let mut last_err = CoreError::transport(transport.name(), "no attempts made");
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff.delay(attempt - 1)).await;
        }
        match tokio::time::timeout(policy.send_timeout, transport.send(recipient, frame.clone())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = CoreError::Timeout(policy.send_timeout),
        }
        tracing::debug!(
            transport = transport.name(),
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            error = %last_err,
            "send attempt failed"
        );
    }
    Err(last_err)
}

async fn receive_loop(
    transport: Arc<dyn Transport>,
    reconnect_every: Duration,
    inbound: mpsc::Sender<InboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match transport.connect().await {
            Ok(()) => {
                if let Err(e) = transport.listen(inbound.clone(), shutdown.clone()).await {
                    tracing::warn!(transport = transport.name(), error = %e, "listener failed");
                }
            }
            Err(e) => tracing::debug!(transport = transport.name(), error = %e, "listener not connected"),
        }
        if *shutdown.borrow() || inbound.is_closed() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_every) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
