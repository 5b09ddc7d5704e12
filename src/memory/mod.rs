pub mod engine;
pub mod forget;
pub mod maintenance;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Caller-supplied time budget for one store operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Fails with [`CoreError::Timeout`] once the budget is spent.
    pub fn check(&self) -> CoreResult<()> {
        if Instant::now() >= self.at {
            return Err(CoreError::Timeout(self.budget));
        }
        Ok(())
    }
}

/// Check an optional deadline. Called right before a transaction commits.
pub(crate) fn check_deadline(deadline: Option<Deadline>) -> CoreResult<()> {
    deadline.map_or(Ok(()), |d| d.check())
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

/// Inverse of [`embedding_to_bytes`] for vectors read back from `records_vec`.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity threshold → L2 distance between unit vectors.
/// `‖a − b‖² = 2 − 2·cos(a, b)`.
pub fn cosine_threshold_to_l2(threshold: f64) -> f64 {
    (2.0 - 2.0 * threshold).max(0.0).sqrt()
}

/// L2 distance between unit vectors → cosine similarity.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - distance * distance / 2.0
}

/// Trim, collapse whitespace and lower-case: the form ids and checksums use.
pub fn normalize_payload(payload: &str) -> String {
    payload
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Content-derived record id over the normalized payload and its origin.
pub fn record_id(normalized: &str, origin_module_id: &str, link_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(origin_module_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(link_id.as_bytes());
    hex(&hasher.finalize())
}

/// SHA-256 of the normalized payload. Verified after every decryption.
pub fn payload_checksum(normalized: &str) -> String {
    hex(&Sha256::digest(normalized.as_bytes()))
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_ts(value: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::StoreInvariantViolation(format!("bad timestamp {value:?}: {e}")))
}

/// Seconds elapsed from `earlier` to `now`, zero if `earlier` is in the future.
pub(crate) fn secs_between(earlier: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - earlier).num_milliseconds().max(0) as f64) / 1000.0
}

/// Lowercase hex of `bytes`.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex(&[0x00, 0x0f, 0xab]), "000fab");
    }

    #[test]
    fn threshold_conversion_matches_cosine() {
        let d = cosine_threshold_to_l2(0.92);
        assert!((l2_to_cosine(d) - 0.92).abs() < 1e-9);
        assert_eq!(cosine_threshold_to_l2(1.0), 0.0);
    }

    #[test]
    fn expired_deadline_times_out() {
        let d = Deadline::after(Duration::ZERO);
        assert!(matches!(d.check(), Err(CoreError::Timeout(_))));
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
        assert!(check_deadline(None).is_ok());
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![0.25f32, -1.0, 3.5];
        assert_eq!(bytes_to_embedding(embedding_to_bytes(&v)), v);
    }

    #[test]
    fn id_ignores_case_and_spacing_but_not_origin() {
        let a = record_id(&normalize_payload("  User likes   Tea "), "chat", "s1");
        let b = record_id(&normalize_payload("user likes tea"), "chat", "s1");
        let c = record_id(&normalize_payload("user likes tea"), "chat", "s2");
        let d = record_id(&normalize_payload("user likes tea"), "planner", "s1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
