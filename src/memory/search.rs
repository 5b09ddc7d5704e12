//! k-nearest-neighbor retrieval over the `records_vec` index.
//!
//! Candidates come from sqlite-vec KNN with an over-fetch factor, are filtered
//! by tier and verification, ranked, and then have their access statistics
//! updated in the same transaction. A query is therefore a write.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::store::touch_access;
use super::types::{Record, RecordHit, Tier, RECORD_COLUMNS};
use super::{check_deadline, embedding_to_bytes, l2_to_cosine, Deadline};
use crate::config::MemoryConfig;
use crate::error::CoreResult;

/// sqlite-vec refuses KNN limits above this.
const VEC_MAX_K: usize = 4096;

/// Rank verified records by distance to `vector`.
///
/// `tiers` of `None` means every live tier; PURGED records are only returned
/// when requested explicitly. Ties break by higher importance, then by more
/// recent access.
pub fn query_records(
    conn: &mut Connection,
    config: &MemoryConfig,
    vector: &[f32],
    k: usize,
    tiers: Option<&[Tier]>,
    now: DateTime<Utc>,
    deadline: Option<Deadline>,
) -> CoreResult<Vec<RecordHit>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let allowed: Vec<Tier> = tiers.map_or_else(|| Tier::LIVE.to_vec(), <[Tier]>::to_vec);
    let tx = conn.transaction()?;

    let total: usize = tx.query_row("SELECT COUNT(*) FROM records_vec", [], |r| {
        r.get::<_, i64>(0)
    })? as usize;

    let mut limit = (k * 4).max(config.query_overfetch).min(VEC_MAX_K);
    let mut hits = loop {
        let candidates = vector_search(&tx, vector, limit)?;
        let exhausted = candidates.len() < limit || limit >= total;
        let hits = visible_hits(&tx, candidates, &allowed)?;

        if hits.len() >= k || exhausted {
            break hits;
        }
        if limit >= VEC_MAX_K {
            // The KNN window cannot grow any further.
            tracing::debug!(k, total, "knn window exhausted, scanning filtered rows");
            let candidates = filtered_scan(&tx, vector, k, &allowed)?;
            break visible_hits(&tx, candidates, &allowed)?;
        }
        limit = (limit * 2).min(VEC_MAX_K);
    };

    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| b.record.importance.total_cmp(&a.record.importance))
            .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
    });
    hits.truncate(k);

    for hit in &mut hits {
        touch_access(&tx, &hit.record.id, config.access_boost, config.access_window_secs, now)?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
        hit.record = tx.query_row(&sql, params![hit.record.id], Record::from_row)?;
    }

    check_deadline(deadline)?;
    tx.commit()?;
    Ok(hits)
}

fn visible_hits(conn: &Connection, candidates: Vec<(String, f64)>, allowed: &[Tier]) -> CoreResult<Vec<RecordHit>> {
    let records = fetch_records(conn, candidates.iter().map(|(id, _)| id.as_str()))?;
    Ok(candidates
        .into_iter()
        .filter_map(|(id, distance)| {
            let record = records.get(&id)?;
            (record.verified && allowed.contains(&record.tier)).then(|| RecordHit {
                record: record.clone(),
                distance,
                similarity: l2_to_cosine(distance),
            })
        })
        .collect())
}

/// Exact nearest rows among those the filter admits, without the KNN limit.
fn filtered_scan(conn: &Connection, embedding: &[f32], k: usize, allowed: &[Tier]) -> CoreResult<Vec<(String, f64)>> {
    let tiers: Vec<String> = allowed.iter().map(|t| format!("'{}'", t.as_str())).collect();
    let sql = format!(
        "SELECT v.id, vec_distance_l2(v.embedding, ?1) AS distance \
         FROM records_vec v JOIN records r ON r.id = v.id \
         WHERE r.verified = 1 AND r.tier IN ({}) \
         ORDER BY distance LIMIT ?2",
        tiers.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), k as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> CoreResult<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM records_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

fn fetch_records<'a>(
    conn: &Connection,
    ids: impl Iterator<Item = &'a str>,
) -> CoreResult<HashMap<String, Record>> {
    let ids: Vec<&str> = ids.collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(params.as_slice(), Record::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|r| (r.id.clone(), r)).collect())
}
