//! The wire unit exchanged between peers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Current envelope version. Decoders reject other versions.
pub const ENVELOPE_VERSION: u8 = 1;

const MAX_PEER_ID_LEN: usize = 128;

/// Peer ids end up as mailbox directory names and NATS subject tokens, so only
/// ASCII letters, digits, `-`, `_`, `:` and `@` are allowed, plus `.` between
/// non-empty segments.
pub fn validate_peer_id(peer_id: &str) -> CoreResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '@' | '.');
    let valid = !peer_id.is_empty()
        && peer_id.len() <= MAX_PEER_ID_LEN
        && peer_id.chars().all(allowed)
        && peer_id.split('.').all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(CoreError::CorruptEnvelope(format!("invalid peer id {peer_id:?}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub version: u8,
    /// Ties a request to its responses. Responses reuse the request's id.
    pub correlation_id: String,
    /// 0 for requests, facts, advertisements and heartbeats; responses count
    /// up from 1.
    pub sequence: u32,
    pub sender_id: String,
    /// `None` broadcasts to every peer.
    pub recipient: Option<String>,
    pub body: Body,
    /// Sender's own confidence in the payload, in [0, 1].
    pub trust_hint: Option<f64>,
    pub sent_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Body {
    Advertisement(AdvertisementBody),
    Request(RequestBody),
    Response(ResponseBody),
    Fact(FactBody),
    Heartbeat(HeartbeatBody),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvertisementBody {
    pub capability_name: String,
    pub version: String,
    pub tags: Vec<String>,
    /// 0 withdraws the advertisement.
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestBody {
    pub capability: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Intermediate result; more responses follow.
    Partial,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseBody {
    pub status: ResponseStatus,
    pub output: serde_json::Value,
}

impl ResponseBody {
    /// Final responses close the task on the requester side.
    pub fn is_final(&self) -> bool {
        self.status != ResponseStatus::Partial
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactBody {
    pub content: String,
    pub link_id: String,
    /// Record id on the sending node, for tracing only.
    pub source_record_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatBody {
    /// Transport the heartbeat was sent on.
    pub transport: String,
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Advertisement(_) => "advertisement",
            Body::Request(_) => "request",
            Body::Response(_) => "response",
            Body::Fact(_) => "fact",
            Body::Heartbeat(_) => "heartbeat",
        }
    }
}

impl Envelope {
    /// New envelope with a fresh time-ordered correlation id.
    pub fn new(sender_id: impl Into<String>, recipient: Option<String>, body: Body) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            correlation_id: Uuid::now_v7().to_string(),
            sequence: 0,
            sender_id: sender_id.into(),
            recipient,
            body,
            trust_hint: None,
            sent_at: Utc::now().to_rfc3339(),
        }
    }

    /// Response number `sequence` to the request identified by `correlation_id`.
    pub fn response(
        sender_id: impl Into<String>,
        requester: impl Into<String>,
        correlation_id: impl Into<String>,
        sequence: u32,
        body: ResponseBody,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            correlation_id: correlation_id.into(),
            sequence,
            sender_id: sender_id.into(),
            recipient: Some(requester.into()),
            body: Body::Response(body),
            trust_hint: None,
            sent_at: Utc::now().to_rfc3339(),
        }
    }

    /// Attach the sender's confidence. Non-finite values are left off.
    pub fn with_trust_hint(mut self, hint: f64) -> Self {
        self.trust_hint = hint.is_finite().then(|| hint.clamp(0.0, 1.0));
        self
    }

    /// Header checks shared by the encoder and the decoder.
    pub fn validate(&self) -> CoreResult<()> {
        validate_peer_id(&self.sender_id)?;
        if let Some(recipient) = &self.recipient {
            validate_peer_id(recipient)?;
        }
        if let Some(hint) = self.trust_hint {
            if !(0.0..=1.0).contains(&hint) {
                return Err(CoreError::CorruptEnvelope(format!("trust hint {hint} outside [0, 1]")));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn is_response(&self) -> bool {
        matches!(self.body, Body::Response(_))
    }

    /// Addressed to `peer_id`, either directly or by broadcast.
    pub fn is_for(&self, peer_id: &str) -> bool {
        self.recipient.as_deref().is_none_or(|r| r == peer_id)
    }
}
