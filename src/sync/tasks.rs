//! Requester-side task objects keyed by correlation id.
//!
//! A request opens a task; inbound response envelopes advance it. Each
//! response sequence is delivered at most once, so a response replayed over a
//! second transport never reaches the caller twice.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};
use crate::protocol::{Body, Envelope, ResponseBody, ResponseStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Sent, nothing back yet.
    Pending,
    /// At least one partial response received.
    Streaming,
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub sequence: u32,
    pub responder: String,
    pub response: ResponseBody,
}

struct TaskState {
    capability: String,
    provider: String,
    status: TaskStatus,
    seen: HashSet<u32>,
    opened_at: Instant,
    tx: mpsc::UnboundedSender<TaskUpdate>,
}

/// Outcome of feeding a response envelope to [`PendingRequests::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// No open task for this correlation id.
    Unknown,
    /// Sequence already delivered.
    Duplicate,
    /// Sent by a peer other than the one the request went to; ignored.
    Foreign,
    Delivered { closed: bool },
}

/// Receiving end of one request.
pub struct TaskHandle {
    pub correlation_id: String,
    rx: mpsc::UnboundedReceiver<TaskUpdate>,
}

impl TaskHandle {
    /// Next response, or `None` once the task has closed.
    pub async fn next(&mut self) -> Option<TaskUpdate> {
        self.rx.recv().await
    }

    /// Wait for the closing response, skipping partials.
    pub async fn final_response(mut self, timeout: Duration) -> CoreResult<TaskUpdate> {
        tokio::time::timeout(timeout, async {
            while let Some(update) = self.rx.recv().await {
                if update.response.is_final() {
                    return Ok(update);
                }
            }
            Err(CoreError::NotFound(format!("task {} closed without a final response", self.correlation_id)))
        })
        .await
        .map_err(|_| CoreError::Timeout(timeout))?
    }
}

#[derive(Default)]
pub struct PendingRequests {
    tasks: DashMap<String, TaskState>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, correlation_id: &str, capability: &str, provider: &str) -> TaskHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks.insert(
            correlation_id.to_string(),
            TaskState {
                capability: capability.to_string(),
                provider: provider.to_string(),
                status: TaskStatus::Pending,
                seen: HashSet::new(),
                opened_at: Instant::now(),
                tx,
            },
        );
        TaskHandle {
            correlation_id: correlation_id.to_string(),
            rx,
        }
    }

    /// Feed one inbound response. Final responses close the task.
    pub fn advance(&self, envelope: &Envelope) -> Advance {
        let Body::Response(response) = &envelope.body else {
            return Advance::Unknown;
        };
        let closed = {
            let Some(mut task) = self.tasks.get_mut(&envelope.correlation_id) else {
                return Advance::Unknown;
            };
            if task.provider != envelope.sender_id {
                tracing::warn!(
                    correlation_id = %envelope.correlation_id,
                    expected = %task.provider,
                    sender = %envelope.sender_id,
                    "response from a peer the request was not sent to"
                );
                return Advance::Foreign;
            }
            if !task.seen.insert(envelope.sequence) {
                return Advance::Duplicate;
            }
            let _ = task.tx.send(TaskUpdate {
                sequence: envelope.sequence,
                responder: envelope.sender_id.clone(),
                response: response.clone(),
            });
            task.status = TaskStatus::Streaming;
            response.is_final()
        };
        if closed {
            if let Some((_, task)) = self.tasks.remove(&envelope.correlation_id) {
                tracing::debug!(
                    correlation_id = %envelope.correlation_id,
                    capability = %task.capability,
                    elapsed_ms = task.opened_at.elapsed().as_millis() as u64,
                    "task closed"
                );
            }
        }
        Advance::Delivered { closed }
    }

    /// Close a task locally with an error response.
    pub fn fail(&self, correlation_id: &str, reason: &str) {
        if let Some((_, task)) = self.tasks.remove(correlation_id) {
            let _ = task.tx.send(TaskUpdate {
                sequence: u32::MAX,
                responder: String::new(),
                response: ResponseBody {
                    status: ResponseStatus::Error,
                    output: serde_json::json!({ "error": reason }),
                },
            });
        }
    }

    pub fn status(&self, correlation_id: &str) -> Option<TaskStatus> {
        self.tasks.get(correlation_id).map(|t| t.status)
    }

    /// Fail tasks open longer than `max_age`. Returns how many were closed.
    pub fn expire(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.opened_at.elapsed() >= max_age)
            .map(|t| t.key().clone())
            .collect();
        for id in &stale {
            self.fail(id, "no response before task expiry");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(corr: &str, seq: u32, status: ResponseStatus) -> Envelope {
        response_from("provider", corr, seq, status)
    }

    fn response_from(sender: &str, corr: &str, seq: u32, status: ResponseStatus) -> Envelope {
        Envelope::response(
            sender,
            "me",
            corr,
            seq,
            ResponseBody {
                status,
                output: serde_json::json!(seq),
            },
        )
    }

    #[tokio::test]
    async fn partials_then_final_close_the_task() {
        let pending = PendingRequests::new();
        let mut handle = pending.open("c1", "summarize", "provider");
        assert_eq!(pending.status("c1"), Some(TaskStatus::Pending));

        assert_eq!(
            pending.advance(&response("c1", 1, ResponseStatus::Partial)),
            Advance::Delivered { closed: false }
        );
        assert_eq!(pending.status("c1"), Some(TaskStatus::Streaming));
        assert_eq!(
            pending.advance(&response("c1", 2, ResponseStatus::Ok)),
            Advance::Delivered { closed: true }
        );
        assert!(pending.is_empty());

        assert_eq!(handle.next().await.unwrap().sequence, 1);
        assert_eq!(handle.next().await.unwrap().sequence, 2);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn replayed_sequence_is_delivered_once() {
        let pending = PendingRequests::new();
        let mut handle = pending.open("c1", "summarize", "provider");
        let partial = response("c1", 1, ResponseStatus::Partial);
        pending.advance(&partial);
        assert_eq!(pending.advance(&partial), Advance::Duplicate);
        pending.advance(&response("c1", 2, ResponseStatus::Ok));

        let mut sequences = Vec::new();
        while let Some(update) = handle.next().await {
            sequences.push(update.sequence);
        }
        assert_eq!(sequences, [1, 2]);
    }

    #[tokio::test]
    async fn unknown_and_expired_tasks() {
        let pending = PendingRequests::new();
        assert_eq!(pending.advance(&response("nope", 1, ResponseStatus::Ok)), Advance::Unknown);

        let handle = pending.open("c2", "summarize", "provider");
        assert_eq!(pending.expire(Duration::ZERO), 1);
        let update = handle.final_response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(update.response.status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn responses_from_other_peers_are_ignored() {
        let pending = PendingRequests::new();
        let mut handle = pending.open("c3", "summarize", "provider");

        let forged = response_from("intruder", "c3", 1, ResponseStatus::Ok);
        assert_eq!(pending.advance(&forged), Advance::Foreign);
        assert_eq!(pending.status("c3"), Some(TaskStatus::Pending));

        assert_eq!(
            pending.advance(&response("c3", 1, ResponseStatus::Ok)),
            Advance::Delivered { closed: true }
        );
        assert_eq!(handle.next().await.unwrap().responder, "provider");
    }
}
