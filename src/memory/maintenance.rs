//! Consolidation, decay, eviction and capacity sweeps.
//!
//! Every sweep is split into a pure planning step over a snapshot of the
//! `records` table and an apply step. Each planned change carries the row's
//! `revision` at snapshot time; applying is a compare-and-set, so a record
//! touched by a concurrent ingest or query after the snapshot is skipped and
//! picked up by the next sweep. Ingestion is never blocked for the duration of
//! a sweep, only for the short per-partition apply transaction.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::store::{delete_record, write_audit_log};
use super::types::{Record, Tier, RECORD_COLUMNS};
use super::{parse_ts, secs_between};
use crate::config::MemoryConfig;
use crate::error::{CoreError, CoreResult};

/// What a sweep wants to do with one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Advance to the given tier.
    Promote(Tier),
    /// LONG_TERM → SHORT_TERM after decaying below the long-term floor.
    Demote,
    /// Importance lowered, tier unchanged.
    Decay,
    Purge,
    /// Delete a PURGED record past its grace period.
    Evict,
}

impl Action {
    fn log_operation(&self) -> &'static str {
        match self {
            Self::Promote(_) => "promote",
            Self::Demote => "demote",
            Self::Decay => "decay",
            Self::Purge => "purge",
            Self::Evict => "evict",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub id: String,
    pub link_id: String,
    /// `revision` observed in the snapshot.
    pub revision: i64,
    pub from: Tier,
    pub action: Action,
    /// Importance to write.
    pub importance: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub decayed: usize,
    pub purged: usize,
    pub evicted: usize,
    /// Changes dropped because the record moved on since the snapshot.
    pub skipped: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: &SweepReport) {
        self.examined += other.examined;
        self.promoted += other.promoted;
        self.demoted += other.demoted;
        self.decayed += other.decayed;
        self.purged += other.purged;
        self.evicted += other.evicted;
        self.skipped += other.skipped;
    }

    fn count(&mut self, action: Action) {
        match action {
            Action::Promote(_) => self.promoted += 1,
            Action::Demote => self.demoted += 1,
            Action::Decay => self.decayed += 1,
            Action::Purge => self.purged += 1,
            Action::Evict => self.evicted += 1,
        }
    }
}

/// Every record, including PURGED ones.
pub fn load_snapshot(conn: &Connection) -> CoreResult<Vec<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], Record::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `importance · 0.5^(elapsed / half_life)`.
pub fn decayed_importance(importance: f64, elapsed_secs: f64, half_life_secs: u64) -> f64 {
    if half_life_secs == 0 {
        return 0.0;
    }
    importance * 0.5f64.powf(elapsed_secs / half_life_secs as f64)
}

fn window_hits(record: &Record, config: &MemoryConfig, now: DateTime<Utc>) -> CoreResult<u32> {
    let started = parse_ts(&record.window_started_at)?;
    Ok(if secs_between(started, now) <= config.access_window_secs as f64 {
        record.window_count
    } else {
        0
    })
}

fn is_expired(record: &Record, now: DateTime<Utc>) -> CoreResult<bool> {
    match &record.expires_at {
        Some(at) => Ok(parse_ts(at)? <= now),
        None => Ok(false),
    }
}

/// Tier promotions and ttl purges.
///
/// EPHEMERAL → SHORT_TERM when importance or windowed access count reach the
/// promotion bar, SHORT_TERM → LONG_TERM on the higher bar. Unverified records
/// never advance. Unpromoted records past their ttl are purged.
pub fn plan_consolidation(
    snapshot: &[Record],
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> CoreResult<Vec<PlannedChange>> {
    let mut changes = Vec::new();
    for record in snapshot {
        let (importance_bar, count_bar, next) = match record.tier {
            Tier::Ephemeral => (
                config.promote_importance,
                config.promote_access_count,
                Tier::ShortTerm,
            ),
            Tier::ShortTerm => (
                config.long_term_importance,
                config.long_term_access_count,
                Tier::LongTerm,
            ),
            Tier::LongTerm | Tier::Purged => continue,
        };

        let qualifies = record.verified
            && (record.importance >= importance_bar || window_hits(record, config, now)? >= count_bar);
        let action = if qualifies {
            Action::Promote(next)
        } else if is_expired(record, now)? {
            Action::Purge
        } else {
            continue;
        };

        changes.push(PlannedChange {
            id: record.id.clone(),
            link_id: record.link_id.clone(),
            revision: record.revision,
            from: record.tier,
            action,
            importance: record.importance,
        });
    }
    Ok(changes)
}

/// Forgetting curve over records idle for at least `decay_idle_secs`.
///
/// Elapsed time runs from the later of the last access and the last decay, so
/// repeated sweeps compound to the same curve. LONG_TERM records use the long
/// half-life and are demoted to SHORT_TERM under the long-term floor. Any tier
/// under `purge_threshold` is purged.
pub fn plan_decay(
    snapshot: &[Record],
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> CoreResult<Vec<PlannedChange>> {
    let mut changes = Vec::new();
    for record in snapshot {
        if record.tier == Tier::Purged {
            continue;
        }
        let last_access = parse_ts(&record.last_accessed_at)?;
        if secs_between(last_access, now) < config.decay_idle_secs as f64 {
            continue;
        }
        let since = match &record.decayed_at {
            Some(at) => parse_ts(at)?.max(last_access),
            None => last_access,
        };
        let half_life = if record.tier == Tier::LongTerm {
            config.long_term_half_life_secs
        } else {
            config.short_term_half_life_secs
        };

        let importance = decayed_importance(record.importance, secs_between(since, now), half_life);
        let action = if importance < config.purge_threshold {
            Action::Purge
        } else if record.tier == Tier::LongTerm && importance < config.long_term_floor {
            Action::Demote
        } else {
            Action::Decay
        };

        changes.push(PlannedChange {
            id: record.id.clone(),
            link_id: record.link_id.clone(),
            revision: record.revision,
            from: record.tier,
            action,
            importance,
        });
    }
    Ok(changes)
}

/// PURGED records whose grace period has run out.
pub fn plan_eviction(
    snapshot: &[Record],
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> CoreResult<Vec<PlannedChange>> {
    let mut changes = Vec::new();
    for record in snapshot.iter().filter(|r| r.tier == Tier::Purged) {
        let purged_at = match &record.purged_at {
            Some(at) => parse_ts(at)?,
            None => parse_ts(&record.last_accessed_at)?,
        };
        if secs_between(purged_at, now) >= config.purge_grace_secs as f64 {
            changes.push(PlannedChange {
                id: record.id.clone(),
                link_id: record.link_id.clone(),
                revision: record.revision,
                from: Tier::Purged,
                action: Action::Evict,
                importance: record.importance,
            });
        }
    }
    Ok(changes)
}

/// Purge the least important, least recently used live records beyond `max_records`.
pub fn plan_capacity(snapshot: &[Record], max_records: usize) -> Vec<PlannedChange> {
    let mut live: Vec<&Record> = snapshot.iter().filter(|r| r.tier != Tier::Purged).collect();
    if max_records == 0 || live.len() <= max_records {
        return Vec::new();
    }
    live.sort_by(|a, b| {
        a.importance
            .total_cmp(&b.importance)
            .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
    });
    let excess = live.len() - max_records;
    live.into_iter()
        .take(excess)
        .map(|r| PlannedChange {
            id: r.id.clone(),
            link_id: r.link_id.clone(),
            revision: r.revision,
            from: r.tier,
            action: Action::Purge,
            importance: r.importance,
        })
        .collect()
}

/// Group planned changes by partition.
pub fn by_partition(changes: Vec<PlannedChange>) -> HashMap<String, Vec<PlannedChange>> {
    let mut partitions: HashMap<String, Vec<PlannedChange>> = HashMap::new();
    for change in changes {
        partitions.entry(change.link_id.clone()).or_default().push(change);
    }
    partitions
}

/// Apply changes in one transaction. Each update is conditional on the
/// snapshot revision; stale changes are counted as skipped.
pub fn apply_changes(
    conn: &mut Connection,
    changes: &[PlannedChange],
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> CoreResult<SweepReport> {
    let mut report = SweepReport {
        examined: changes.len(),
        ..Default::default()
    };
    if changes.is_empty() {
        return Ok(report);
    }

    let now_s = now.to_rfc3339();
    let short_term_expiry =
        (now + ChronoDuration::seconds(config.short_term_ttl_secs as i64)).to_rfc3339();
    let tx = conn.transaction()?;

    for change in changes {
        let target = match change.action {
            Action::Promote(tier) => Some(tier),
            Action::Demote => Some(Tier::ShortTerm),
            Action::Purge => Some(Tier::Purged),
            Action::Decay | Action::Evict => None,
        };
        if let Some(to) = target {
            if !change.from.can_move_to(to, change.action == Action::Demote) {
                return Err(CoreError::StoreInvariantViolation(format!(
                    "record {} cannot move from {} to {}",
                    change.id, change.from, to
                )));
            }
        }

        let rows = match change.action {
            Action::Evict => {
                let current: Option<i64> = tx
                    .query_row(
                        "SELECT revision FROM records WHERE id = ?1 AND tier = 'purged'",
                        params![change.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current == Some(change.revision) {
                    delete_record(&tx, &change.id)?;
                    1
                } else {
                    0
                }
            }
            Action::Decay => tx.execute(
                "UPDATE records SET importance = ?1, decayed_at = ?2, revision = revision + 1 \
                 WHERE id = ?3 AND revision = ?4",
                params![change.importance, now_s, change.id, change.revision],
            )?,
            Action::Purge => tx.execute(
                "UPDATE records SET tier = 'purged', importance = ?1, purged_at = ?2, decayed_at = ?2, \
                 revision = revision + 1 WHERE id = ?3 AND revision = ?4",
                params![change.importance, now_s, change.id, change.revision],
            )?,
            Action::Promote(Tier::LongTerm) => tx.execute(
                "UPDATE records SET tier = 'long_term', expires_at = NULL, revision = revision + 1 \
                 WHERE id = ?1 AND revision = ?2",
                params![change.id, change.revision],
            )?,
            Action::Promote(tier) => tx.execute(
                "UPDATE records SET tier = ?1, expires_at = ?2, revision = revision + 1 \
                 WHERE id = ?3 AND revision = ?4",
                params![tier.as_str(), short_term_expiry, change.id, change.revision],
            )?,
            Action::Demote => tx.execute(
                "UPDATE records SET tier = 'short_term', importance = ?1, expires_at = ?2, decayed_at = ?3, \
                 revision = revision + 1 WHERE id = ?4 AND revision = ?5",
                params![change.importance, short_term_expiry, now_s, change.id, change.revision],
            )?,
        };

        if rows == 0 {
            report.skipped += 1;
            tracing::debug!(record_id = %change.id, action = ?change.action, "record changed since snapshot, skipping");
            continue;
        }

        report.count(change.action);
        if change.action != Action::Decay {
            write_audit_log(
                &tx,
                change.action.log_operation(),
                &change.id,
                Some(&serde_json::json!({
                    "from": change.from.as_str(),
                    "to": target.map(|t| t.as_str()),
                    "importance": change.importance,
                })),
                now,
            )?;
        }
    }

    if report.decayed > 0 {
        write_audit_log(
            &tx,
            "decay",
            "batch",
            Some(&serde_json::json!({"affected": report.decayed})),
            now,
        )?;
    }

    tx.commit()?;
    Ok(report)
}

/// Snapshot, plan and apply consolidation in one call, without partition locks.
pub fn consolidate(conn: &mut Connection, config: &MemoryConfig, now: DateTime<Utc>) -> CoreResult<SweepReport> {
    let snapshot = load_snapshot(conn)?;
    let changes = plan_consolidation(&snapshot, config, now)?;
    apply_changes(conn, &changes, config, now)
}

/// Snapshot, plan and apply decay in one call, without partition locks.
pub fn decay(conn: &mut Connection, config: &MemoryConfig, now: DateTime<Utc>) -> CoreResult<SweepReport> {
    let snapshot = load_snapshot(conn)?;
    let changes = plan_decay(&snapshot, config, now)?;
    apply_changes(conn, &changes, config, now)
}

/// Snapshot, plan and apply eviction in one call, without partition locks.
pub fn evict(conn: &mut Connection, config: &MemoryConfig, now: DateTime<Utc>) -> CoreResult<SweepReport> {
    let snapshot = load_snapshot(conn)?;
    let changes = plan_eviction(&snapshot, config, now)?;
    apply_changes(conn, &changes, config, now)
}

/// Snapshot, plan and apply the capacity check in one call.
pub fn enforce_capacity(
    conn: &mut Connection,
    config: &MemoryConfig,
    max_records: usize,
    now: DateTime<Utc>,
) -> CoreResult<SweepReport> {
    let snapshot = load_snapshot(conn)?;
    let changes = plan_capacity(&snapshot, max_records);
    apply_changes(conn, &changes, config, now)
}
