//! Per-peer credibility scores.
//!
//! Scores live in the `trust_entries` table and are mirrored in an in-process
//! cache so lookups on the inbound path never touch SQLite. Every update is
//! written through before the cache changes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::TrustConfig;
use crate::db::{self, Database};
use crate::error::CoreResult;
use crate::memory::parse_ts;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrustEntry {
    pub peer_id: String,
    pub score: f64,
    pub successes: u64,
    pub failures: u64,
    pub last_updated: String,
}

pub struct TrustLedger {
    db: Database,
    config: TrustConfig,
    cache: RwLock<HashMap<String, TrustEntry>>,
}

impl TrustLedger {
    /// Load every stored entry into the cache.
    pub fn open(db: Database, config: TrustConfig) -> CoreResult<Self> {
        let entries = {
            let conn = db::lock(&db)?;
            load_entries(&conn)?
        };
        tracing::debug!(peers = entries.len(), "trust ledger loaded");
        Ok(Self {
            db,
            config,
            cache: RwLock::new(entries.into_iter().map(|e| (e.peer_id.clone(), e)).collect()),
        })
    }

    pub fn floor(&self) -> f64 {
        self.config.trust_floor
    }

    /// Score for `peer_id`, or the neutral default for peers never seen.
    pub fn get_trust(&self, peer_id: &str) -> f64 {
        self.cache
            .read()
            .get(peer_id)
            .map_or(self.config.default_score, |e| e.score)
            .clamp(0.0, 1.0)
    }

    pub fn is_trusted(&self, peer_id: &str) -> bool {
        self.get_trust(peer_id) >= self.config.trust_floor
    }

    pub fn entry(&self, peer_id: &str) -> Option<TrustEntry> {
        self.cache.read().get(peer_id).cloned()
    }

    /// All entries, highest score first.
    pub fn entries(&self) -> Vec<TrustEntry> {
        let mut entries: Vec<TrustEntry> = self.cache.read().values().cloned().collect();
        entries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.peer_id.cmp(&b.peer_id)));
        entries
    }

    fn neutral(&self, peer_id: &str, now: DateTime<Utc>) -> TrustEntry {
        TrustEntry {
            peer_id: peer_id.to_string(),
            score: self.config.default_score,
            successes: 0,
            failures: 0,
            last_updated: now.to_rfc3339(),
        }
    }

    /// Create the neutral entry on first contact. No-op for known peers.
    pub fn observe_peer(&self, peer_id: &str) -> CoreResult<TrustEntry> {
        if let Some(existing) = self.entry(peer_id) {
            return Ok(existing);
        }
        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(peer_id) {
            return Ok(existing.clone());
        }
        let entry = self.neutral(peer_id, Utc::now());
        self.persist(&entry)?;
        tracing::info!(peer_id, score = entry.score, "new peer");
        cache.insert(peer_id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Read, change, write through and cache one entry under the cache write
    /// lock, so concurrent updates to a peer are applied one after another.
    fn update(&self, peer_id: &str, now: DateTime<Utc>, change: impl FnOnce(&mut TrustEntry)) -> CoreResult<TrustEntry> {
        let mut cache = self.cache.write();
        let mut entry = cache
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| self.neutral(peer_id, now));
        change(&mut entry);
        entry.last_updated = now.to_rfc3339();
        self.persist(&entry)?;
        cache.insert(peer_id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Move the score toward 1 (positive) or 0 by the learning rate.
    pub fn record_outcome(&self, peer_id: &str, positive: bool) -> CoreResult<f64> {
        let rate = self.config.learning_rate;
        let entry = self.update(peer_id, Utc::now(), |entry| {
            entry.score = updated_score(entry.score, if positive { 1.0 } else { 0.0 }, rate);
            if positive {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
        })?;
        tracing::debug!(peer_id, positive, score = entry.score, "trust updated");
        Ok(entry.score)
    }

    /// Operator override, e.g. pinning a known-bad peer.
    pub fn set_score(&self, peer_id: &str, score: f64) -> CoreResult<()> {
        self.update(peer_id, Utc::now(), |entry| entry.score = score.clamp(0.0, 1.0))?;
        Ok(())
    }

    /// Relax scores of peers idle past `inactivity_days` toward the default.
    /// Returns the number of entries changed.
    pub fn relax_inactive(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let idle_secs = (self.config.inactivity_days * 86_400) as i64;
        let is_idle = |e: &TrustEntry| {
            parse_ts(&e.last_updated)
                .map(|t| (now - t).num_seconds() >= idle_secs)
                .unwrap_or(true)
        };
        let stale: Vec<String> = self
            .cache
            .read()
            .values()
            .filter(|e| is_idle(e))
            .map(|e| e.peer_id.clone())
            .collect();

        let (target, rate) = (self.config.default_score, self.config.relax_rate);
        for peer_id in &stale {
            self.update(peer_id, now, |entry| entry.score = updated_score(entry.score, target, rate))?;
        }
        if !stale.is_empty() {
            tracing::info!(peers = stale.len(), "relaxed idle trust scores");
        }
        Ok(stale.len())
    }

    fn persist(&self, entry: &TrustEntry) -> CoreResult<()> {
        let conn = db::lock(&self.db)?;
        conn.execute(
            "INSERT INTO trust_entries (peer_id, score, successes, failures, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(peer_id) DO UPDATE SET score = ?2, successes = ?3, failures = ?4, last_updated = ?5",
            params![
                entry.peer_id,
                entry.score,
                entry.successes as i64,
                entry.failures as i64,
                entry.last_updated
            ],
        )?;
        Ok(())
    }
}

/// `score + rate·(target − score)`, clamped to [0, 1].
pub fn updated_score(score: f64, target: f64, rate: f64) -> f64 {
    let next = score + rate * (target - score);
    if next.is_finite() {
        next.clamp(0.0, 1.0)
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn load_entries(conn: &Connection) -> CoreResult<Vec<TrustEntry>> {
    let mut stmt =
        conn.prepare("SELECT peer_id, score, successes, failures, last_updated FROM trust_entries")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TrustEntry {
                peer_id: row.get(0)?,
                score: row.get(1)?,
                successes: row.get::<_, i64>(2)? as u64,
                failures: row.get::<_, i64>(3)? as u64,
                last_updated: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
