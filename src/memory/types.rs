//! Core record type definitions.
//!
//! Defines [`Tier`] (retention class), [`Record`] (stored metadata without the
//! encrypted payload), [`RecordHit`] (a ranked query result) and the result
//! types of the write path.

use serde::{Deserialize, Serialize};

/// Retention class of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fresh, unconsolidated. Purged once past its ttl unless promoted.
    Ephemeral,
    ShortTerm,
    /// No ttl. Decays on the long half-life.
    LongTerm,
    /// Terminal. Evicted after the grace period.
    Purged,
}

impl Tier {
    pub const LIVE: [Tier; 3] = [Tier::Ephemeral, Tier::ShortTerm, Tier::LongTerm];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Purged => "purged",
        }
    }

    /// Position along the promotion path. PURGED is terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Ephemeral => 0,
            Self::ShortTerm => 1,
            Self::LongTerm => 2,
            Self::Purged => 3,
        }
    }

    /// Whether moving from `self` to `next` is allowed. Advancing and purging
    /// always are; LONG_TERM → SHORT_TERM only when `demotion` is set.
    pub fn can_move_to(&self, next: Tier, demotion: bool) -> bool {
        match (self, next) {
            (Self::Purged, _) => false,
            (_, Self::Purged) => true,
            (Self::LongTerm, Self::ShortTerm) => demotion,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(Self::Ephemeral),
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            "purged" => Ok(Self::Purged),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// A record row, matching the `records` table minus the encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Hex SHA-256 of the normalized payload and its origin.
    pub id: String,
    /// Local component that produced the record.
    pub origin_module_id: String,
    /// External interaction the record belongs to.
    pub link_id: String,
    pub importance: f64,
    pub tier: Tier,
    /// `false` for inbound facts awaiting corroboration.
    pub verified: bool,
    /// Peer that supplied the record, for facts received over sync.
    pub source_peer: Option<String>,
    pub access_count: u32,
    pub window_started_at: String,
    pub window_count: u32,
    pub created_at: String,
    pub last_accessed_at: String,
    pub expires_at: Option<String>,
    pub purged_at: Option<String>,
    /// Last time the forgetting curve was applied.
    pub decayed_at: Option<String>,
    pub revision: i64,
}

/// Column list matching [`Record::from_row`].
pub(crate) const RECORD_COLUMNS: &str = "id, origin_module_id, link_id, importance, tier, verified, \
     source_peer, access_count, window_started_at, window_count, created_at, last_accessed_at, \
     expires_at, purged_at, decayed_at, revision";

impl Record {
    /// Map a row selected with [`RECORD_COLUMNS`] (starting at column 0).
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let tier: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            origin_module_id: row.get(1)?,
            link_id: row.get(2)?,
            importance: row.get(3)?,
            tier: tier.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
            })?,
            verified: row.get(5)?,
            source_peer: row.get(6)?,
            access_count: row.get(7)?,
            window_started_at: row.get(8)?,
            window_count: row.get(9)?,
            created_at: row.get(10)?,
            last_accessed_at: row.get(11)?,
            expires_at: row.get(12)?,
            purged_at: row.get(13)?,
            decayed_at: row.get(14)?,
            revision: row.get(15)?,
        })
    }
}

/// A ranked query result.
#[derive(Debug, Clone, Serialize)]
pub struct RecordHit {
    #[serde(flatten)]
    pub record: Record,
    /// L2 distance between unit vectors.
    pub distance: f64,
    /// Cosine similarity derived from `distance`.
    pub similarity: f64,
}

/// A record with its decrypted payload.
#[derive(Debug, Clone, Serialize)]
pub struct RecalledRecord {
    #[serde(flatten)]
    pub record: Record,
    pub payload: String,
}

/// Result returned from an ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// Id of the stored record, or of the record it merged into.
    pub id: String,
    /// `true` if an existing near-duplicate absorbed the payload.
    pub merged: bool,
    pub tier: Tier,
    pub verified: bool,
}
