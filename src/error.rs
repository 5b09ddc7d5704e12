//! Error taxonomy shared by the memory store, trust ledger and sync layer.
//!
//! Transport- and timing-related variants are recovered locally (retry, failover,
//! outbox). Integrity variants are surfaced to the caller and never auto-corrected.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The payload could not be turned into a semantic vector (e.g. empty input).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A transport failed to deliver or receive. Transient.
    #[error("transport error: {transport}: {message}")]
    Transport { transport: String, message: String },

    /// Inbound fact from a peer below the trust floor with no corroboration.
    #[error("fact from {peer_id} rejected: trust {score:.2} below floor {floor:.2}")]
    TrustRejected { peer_id: String, score: f64, floor: f64 },

    /// Caller deadline exceeded. Nothing was written.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed wire data.
    #[error("corrupt envelope: {0}")]
    CorruptEnvelope(String),

    /// Data-integrity failure. Fatal for the operation that raised it.
    #[error("store invariant violated: {0}")]
    StoreInvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The connector was drained and refuses new sends.
    #[error("connector is closed")]
    Closed,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Errors the sync layer may retry or fail over on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }

    /// Errors that indicate corrupted or conflicting stored data.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::StoreInvariantViolation(_) | Self::Crypto(_) | Self::CorruptEnvelope(_)
        )
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(other) => Self::Other(format!("{other:#}")),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
