//! Write path: normalization, deduplication, encryption, storage and audit logging.
//!
//! [`ingest_record`] is the single entry point. It runs the full pipeline inside
//! a transaction: exact-id check, near-duplicate search scoped to the
//! `(link_id, origin_module_id)` partition, merge or insert (record row plus
//! vector), corroboration bookkeeping for facts received from peers, and an
//! audit log entry. The caller's deadline is checked right before commit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::types::{IngestOutcome, RecalledRecord, Record, Tier, RECORD_COLUMNS};
use super::{
    bytes_to_embedding, check_deadline, embedding_to_bytes, normalize_payload, parse_ts,
    payload_checksum, record_id, secs_between, Deadline,
};
use crate::cipher::PayloadCipher;
use crate::config::MemoryConfig;
use crate::embedding::cosine_similarity;
use crate::error::{CoreError, CoreResult};

/// One payload to store.
#[derive(Debug, Clone)]
pub struct IngestRequest<'a> {
    pub payload: &'a str,
    pub origin_module_id: &'a str,
    pub link_id: &'a str,
    pub importance: f64,
    /// Unverified records are stored but excluded from queries and dedup.
    pub verified: bool,
    /// Peer that supplied the payload. Each distinct peer counts as one corroboration.
    pub source_peer: Option<&'a str>,
}

/// Full write path: exact-id check → dedup → merge or insert → corroboration → audit log.
pub fn ingest_record(
    conn: &mut Connection,
    cipher: &PayloadCipher,
    config: &MemoryConfig,
    req: &IngestRequest<'_>,
    vector: &[f32],
    now: DateTime<Utc>,
    deadline: Option<Deadline>,
) -> CoreResult<IngestOutcome> {
    let normalized = normalize_payload(req.payload);
    if normalized.is_empty() {
        return Err(CoreError::Encoding("empty payload".into()));
    }
    if req.payload.len() > config.max_payload_bytes {
        return Err(CoreError::Encoding(format!(
            "payload of {} bytes exceeds the {} byte limit",
            req.payload.len(),
            config.max_payload_bytes
        )));
    }

    let id = record_id(&normalized, req.origin_module_id, req.link_id);
    let checksum = payload_checksum(&normalized);
    let tx = conn.transaction()?;

    let existing: Option<(String, String, bool)> = tx
        .query_row(
            "SELECT tier, checksum, verified FROM records WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (target_id, merged) = match existing {
        Some((_, stored, _)) if stored != checksum => {
            return Err(CoreError::StoreInvariantViolation(format!(
                "record {id} already exists with different content"
            )));
        }
        Some((tier, _, _)) if tier == Tier::Purged.as_str() => {
            delete_record(&tx, &id)?;
            write_audit_log(
                &tx,
                "evict",
                &id,
                Some(&serde_json::json!({"reason": "reingested"})),
                now,
            )?;
            insert_record(&tx, cipher, config, req, &id, &checksum, vector, now)?;
            (id, false)
        }
        Some((_, _, existing_verified)) => {
            if req.verified {
                if !existing_verified {
                    verify_record(&tx, &id, now)?;
                }
                touch_access(&tx, &id, config.access_boost, config.access_window_secs, now)?;
                write_audit_log(&tx, "merge", &id, Some(&serde_json::json!({"exact": true})), now)?;
            }
            (id, true)
        }
        None => {
            let duplicate = if req.verified {
                find_near_duplicate(
                    &tx,
                    req.link_id,
                    req.origin_module_id,
                    vector,
                    config.dedup_threshold,
                )?
            } else {
                None
            };
            match duplicate {
                Some((existing_id, similarity)) => {
                    touch_access(
                        &tx,
                        &existing_id,
                        config.access_boost,
                        config.access_window_secs,
                        now,
                    )?;
                    write_audit_log(
                        &tx,
                        "merge",
                        &existing_id,
                        Some(&serde_json::json!({"similarity": similarity, "candidate_id": id})),
                        now,
                    )?;
                    (existing_id, true)
                }
                None => {
                    insert_record(&tx, cipher, config, req, &id, &checksum, vector, now)?;
                    (id, false)
                }
            }
        }
    };

    if let Some(peer) = req.source_peer {
        let peers = add_corroboration(&tx, &target_id, peer, now)?;
        let verified: bool = tx.query_row(
            "SELECT verified FROM records WHERE id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        if !verified && peers >= 2 {
            verify_record(&tx, &target_id, now)?;
            tracing::info!(record_id = %target_id, peers, "fact corroborated");
        }
    }

    let (tier, verified): (String, bool) = tx.query_row(
        "SELECT tier, verified FROM records WHERE id = ?1",
        params![target_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let tier = tier.parse::<Tier>().map_err(CoreError::StoreInvariantViolation)?;

    check_deadline(deadline)?;
    tx.commit()?;

    Ok(IngestOutcome {
        id: target_id,
        merged,
        tier,
        verified,
    })
}

/// Closest verified, non-purged record of the partition at or above `threshold`.
///
/// The scan is bounded by the partition size, not the store size.
fn find_near_duplicate(
    conn: &Connection,
    link_id: &str,
    origin_module_id: &str,
    vector: &[f32],
    threshold: f64,
) -> CoreResult<Option<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, v.embedding FROM records r JOIN records_vec v ON v.id = r.id \
         WHERE r.link_id = ?1 AND r.origin_module_id = ?2 AND r.tier != 'purged' AND r.verified = 1",
    )?;
    let rows = stmt.query_map(params![link_id, origin_module_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut best: Option<(String, f64)> = None;
    for row in rows {
        let (id, bytes) = row?;
        let similarity = f64::from(cosine_similarity(vector, &bytes_to_embedding(&bytes)));
        if similarity >= threshold && best.as_ref().map_or(true, |(_, s)| similarity > *s) {
            best = Some((id, similarity));
        }
    }
    Ok(best)
}

#[allow(clippy::too_many_arguments)]
fn insert_record(
    conn: &Connection,
    cipher: &PayloadCipher,
    config: &MemoryConfig,
    req: &IngestRequest<'_>,
    id: &str,
    checksum: &str,
    vector: &[f32],
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let ciphertext = cipher.encrypt(req.payload.as_bytes())?;
    let now_s = now.to_rfc3339();
    let expires_at = (now + ChronoDuration::seconds(config.ephemeral_ttl_secs as i64)).to_rfc3339();

    conn.execute(
        "INSERT INTO records (id, origin_module_id, link_id, payload, checksum, key_id, importance, tier, \
         verified, source_peer, access_count, window_started_at, window_count, created_at, last_accessed_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ephemeral', ?8, ?9, 1, ?10, 1, ?10, ?10, ?11)",
        params![
            id,
            req.origin_module_id,
            req.link_id,
            ciphertext,
            checksum,
            cipher.key_id(),
            req.importance.clamp(0.0, 1.0),
            req.verified,
            req.source_peer,
            now_s,
            expires_at,
        ],
    )?;
    conn.execute(
        "INSERT INTO records_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(vector)],
    )?;
    write_audit_log(
        conn,
        "ingest",
        id,
        Some(&serde_json::json!({"verified": req.verified, "source_peer": req.source_peer})),
        now,
    )?;
    Ok(())
}

/// Count an access: bump `access_count`, the sliding-window counter and
/// importance (by `boost`, capped at 1.0).
pub(crate) fn touch_access(
    conn: &Connection,
    id: &str,
    boost: f64,
    window_secs: u64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let (window_started_at, window_count): (String, u32) = conn.query_row(
        "SELECT window_started_at, window_count FROM records WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let now_s = now.to_rfc3339();
    let (window_start, window_count) =
        if secs_between(parse_ts(&window_started_at)?, now) > window_secs as f64 {
            (now_s.clone(), 1)
        } else {
            (window_started_at, window_count + 1)
        };

    conn.execute(
        "UPDATE records SET access_count = access_count + 1, last_accessed_at = ?1, \
         importance = MIN(importance + ?2, 1.0), window_started_at = ?3, window_count = ?4, \
         revision = revision + 1 WHERE id = ?5",
        params![now_s, boost, window_start, window_count, id],
    )?;
    Ok(())
}

fn add_corroboration(
    conn: &Connection,
    record_id: &str,
    peer_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<u32> {
    conn.execute(
        "INSERT OR IGNORE INTO fact_corroborations (record_id, peer_id, received_at) VALUES (?1, ?2, ?3)",
        params![record_id, peer_id, now.to_rfc3339()],
    )?;
    let peers: u32 = conn.query_row(
        "SELECT COUNT(DISTINCT peer_id) FROM fact_corroborations WHERE record_id = ?1",
        params![record_id],
        |row| row.get(0),
    )?;
    Ok(peers)
}

fn verify_record(conn: &Connection, id: &str, now: DateTime<Utc>) -> CoreResult<()> {
    conn.execute(
        "UPDATE records SET verified = 1, revision = revision + 1 WHERE id = ?1",
        params![id],
    )?;
    write_audit_log(conn, "verify", id, None, now)?;
    Ok(())
}

/// Remove a record, its vector and its corroborations.
pub(crate) fn delete_record(conn: &Connection, id: &str) -> CoreResult<()> {
    conn.execute("DELETE FROM records_vec WHERE id = ?1", params![id])?;
    conn.execute("DELETE FROM fact_corroborations WHERE record_id = ?1", params![id])?;
    conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
    Ok(())
}

/// Fetch one record's metadata.
pub fn get_record(conn: &Connection, id: &str) -> CoreResult<Option<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], Record::from_row).optional()?)
}

/// Decrypt one record and verify its checksum.
pub fn recall_record(conn: &Connection, cipher: &PayloadCipher, id: &str) -> CoreResult<RecalledRecord> {
    let sql = format!("SELECT {RECORD_COLUMNS}, payload, checksum, key_id FROM records WHERE id = ?1");
    let (record, ciphertext, checksum, key_id): (Record, Vec<u8>, String, String) = conn
        .query_row(&sql, params![id], |row| {
            Ok((Record::from_row(row)?, row.get(16)?, row.get(17)?, row.get(18)?))
        })
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("record {id}")))?;

    let plaintext = cipher.decrypt(&key_id, &ciphertext)?;
    let payload = String::from_utf8(plaintext)
        .map_err(|e| CoreError::StoreInvariantViolation(format!("record {id} payload is not UTF-8: {e}")))?;
    if payload_checksum(&normalize_payload(&payload)) != checksum {
        return Err(CoreError::StoreInvariantViolation(format!(
            "record {id} failed checksum verification"
        )));
    }
    Ok(RecalledRecord { record, payload })
}

/// Re-encrypt every payload under `next`'s active key in one transaction.
///
/// `current` must be able to decrypt every stored payload. Returns the number
/// of records rewritten.
pub fn rotate_payload_key(
    conn: &mut Connection,
    current: &PayloadCipher,
    next: &PayloadCipher,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let tx = conn.transaction()?;
    let rows: Vec<(String, Vec<u8>, String)> = {
        let mut stmt = tx.prepare("SELECT id, payload, key_id FROM records")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (id, ciphertext, key_id) in &rows {
        let plaintext = current.decrypt(key_id, ciphertext)?;
        let rewritten = next.encrypt(&plaintext)?;
        tx.execute(
            "UPDATE records SET payload = ?1, key_id = ?2 WHERE id = ?3",
            params![rewritten, next.key_id(), id],
        )?;
    }
    write_audit_log(
        &tx,
        "rotate",
        "*",
        Some(&serde_json::json!({"key_id": next.key_id(), "records": rows.len()})),
        now,
    )?;
    tx.commit()?;

    tracing::info!(records = rows.len(), key_id = %next.key_id(), "payload key rotated");
    Ok(rows.len())
}

/// Write an entry to the `record_log` audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    record_id: &str,
    details: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO record_log (operation, record_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, record_id, details.map(|d| d.to_string()), now.to_rfc3339()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::time::Duration;

    const DIM: usize = 8;

    fn test_db() -> Connection {
        db::open_memory_database(DIM).unwrap()
    }

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[axis] = 1.0;
        v
    }

    /// Cosine ~0.997 with `unit(0)`.
    fn near_unit0() -> Vec<f32> {
        crate::embedding::l2_normalize(&[0.99, 0.07, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn request<'a>(payload: &'a str, link: &'a str) -> IngestRequest<'a> {
        IngestRequest {
            payload,
            origin_module_id: "chat",
            link_id: link,
            importance: 0.5,
            verified: true,
            source_peer: None,
        }
    }

    fn ingest(
        conn: &mut Connection,
        cipher: &PayloadCipher,
        req: &IngestRequest<'_>,
        vector: &[f32],
    ) -> CoreResult<IngestOutcome> {
        ingest_record(conn, cipher, &MemoryConfig::default(), req, vector, Utc::now(), None)
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn new_record_is_ephemeral_and_encrypted() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let out = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();

        assert!(!out.merged);
        assert_eq!(out.tier, Tier::Ephemeral);

        let payload: Vec<u8> = conn
            .query_row("SELECT payload FROM records WHERE id = ?1", params![out.id], |r| r.get(0))
            .unwrap();
        assert!(!payload.windows(3).any(|w| w == b"tea"));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records_vec"), 1);

        let recalled = recall_record(&conn, &cipher, &out.id).unwrap();
        assert_eq!(recalled.payload, "user likes tea");
        assert_eq!(recalled.record.access_count, 1);
    }

    #[test]
    fn near_duplicate_in_partition_merges() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let first = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        let second =
            ingest(&mut conn, &cipher, &request("user enjoys tea", "s1"), &near_unit0()).unwrap();

        assert!(second.merged);
        assert_eq!(second.id, first.id);

        let record = get_record(&conn, &first.id).unwrap().unwrap();
        assert_eq!(record.access_count, 2);
        assert!((record.importance - 0.6).abs() < 1e-9);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records"), 1);
    }

    #[test]
    fn dissimilar_or_other_partition_does_not_merge() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        let other = ingest(&mut conn, &cipher, &request("deploy on friday", "s1"), &unit(3)).unwrap();
        let elsewhere =
            ingest(&mut conn, &cipher, &request("user enjoys tea", "s2"), &near_unit0()).unwrap();

        assert!(!other.merged);
        assert!(!elsewhere.merged);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records"), 3);
    }

    #[test]
    fn exact_reingest_merges_without_duplicate() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let a = ingest(&mut conn, &cipher, &request("User likes tea", "s1"), &unit(0)).unwrap();
        let b = ingest(&mut conn, &cipher, &request("user  likes tea ", "s1"), &unit(0)).unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.merged);
        assert_eq!(get_record(&conn, &a.id).unwrap().unwrap().access_count, 2);
    }

    #[test]
    fn empty_payload_is_an_encoding_error() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let err = ingest(&mut conn, &cipher, &request("   \n ", "s1"), &unit(0)).unwrap_err();
        assert!(matches!(err, CoreError::Encoding(_)));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records"), 0);
    }

    #[test]
    fn conflicting_content_for_same_id_is_fatal() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let out = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        conn.execute("UPDATE records SET checksum = 'deadbeef' WHERE id = ?1", params![out.id])
            .unwrap();

        let err = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap_err();
        assert!(matches!(err, CoreError::StoreInvariantViolation(_)));
    }

    #[test]
    fn purged_id_is_reinserted_fresh() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let out = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        conn.execute(
            "UPDATE records SET tier = 'purged', importance = 0.01, access_count = 9 WHERE id = ?1",
            params![out.id],
        )
        .unwrap();

        let again = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        assert_eq!(again.id, out.id);
        assert!(!again.merged);
        assert_eq!(again.tier, Tier::Ephemeral);
        assert_eq!(get_record(&conn, &out.id).unwrap().unwrap().access_count, 1);
    }

    #[test]
    fn unverified_fact_needs_second_peer() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let fact = |peer| IngestRequest {
            payload: "the build server is down",
            origin_module_id: "hsp.fact",
            link_id: "ops",
            importance: 0.05,
            verified: false,
            source_peer: Some(peer),
        };

        let first = ingest(&mut conn, &cipher, &fact("peer-a"), &unit(1)).unwrap();
        assert!(!first.verified);
        // same peer again is not independent
        let again = ingest(&mut conn, &cipher, &fact("peer-a"), &unit(1)).unwrap();
        assert!(!again.verified);

        let second = ingest(&mut conn, &cipher, &fact("peer-b"), &unit(1)).unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.verified);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM fact_corroborations"), 2);
    }

    #[test]
    fn expired_deadline_leaves_no_partial_write() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let err = ingest_record(
            &mut conn,
            &cipher,
            &MemoryConfig::default(),
            &request("user likes tea", "s1"),
            &unit(0),
            Utc::now(),
            Some(Deadline::after(Duration::ZERO)),
        )
        .unwrap_err();

        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM records_vec"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM record_log"), 0);
    }

    #[test]
    fn recall_detects_tampered_payload() {
        let mut conn = test_db();
        let cipher = PayloadCipher::generate();
        let out = ingest(&mut conn, &cipher, &request("user likes tea", "s1"), &unit(0)).unwrap();
        let forged = cipher.encrypt(b"user likes coffee").unwrap();
        conn.execute("UPDATE records SET payload = ?1 WHERE id = ?2", params![forged, out.id])
            .unwrap();

        let err = recall_record(&conn, &cipher, &out.id).unwrap_err();
        assert!(matches!(err, CoreError::StoreInvariantViolation(_)));
        assert!(matches!(
            recall_record(&conn, &cipher, "missing"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn rotation_rewrites_every_payload() {
        let mut conn = test_db();
        let old = PayloadCipher::generate();
        let a = ingest(&mut conn, &old, &request("user likes tea", "s1"), &unit(0)).unwrap();
        ingest(&mut conn, &old, &request("deploy on friday", "s2"), &unit(4)).unwrap();

        let new = old.rotated();
        assert_eq!(rotate_payload_key(&mut conn, &new, &new, Utc::now()).unwrap(), 2);

        let fresh = new.without_retired();
        assert_eq!(recall_record(&conn, &fresh, &a.id).unwrap().payload, "user likes tea");
        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE key_id != ?1",
                params![fresh.key_id()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);
    }
}
