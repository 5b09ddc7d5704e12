use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::CoreResult;

/// Response from [`store_stats`].
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_records: u64,
    pub by_tier: HashMap<String, u64>,
    pub unverified_records: u64,
    pub partitions: u64,
    pub outbox_pending: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<String>,
}

/// Compute store statistics.
///
/// `db_path` is used for file size calculation; pass None for in-memory databases.
pub fn store_stats(conn: &Connection, db_path: Option<&Path>) -> CoreResult<StatsResponse> {
    let mut by_tier: HashMap<String, u64> = ["ephemeral", "short_term", "long_term", "purged"]
        .iter()
        .map(|t| (t.to_string(), 0))
        .collect();
    let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM records GROUP BY tier")?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (tier, count) in rows {
        by_tier.insert(tier, count as u64);
    }

    let scalar = |sql: &str| -> CoreResult<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM records",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_records: by_tier.values().sum(),
        by_tier,
        unverified_records: scalar("SELECT COUNT(*) FROM records WHERE verified = 0")?,
        partitions: scalar("SELECT COUNT(DISTINCT link_id) FROM records")?,
        outbox_pending: scalar("SELECT COUNT(*) FROM outbox")?,
        db_size_bytes,
        oldest_record: oldest,
        newest_record: newest,
    })
}
