//! SQL DDL for all tables.
//!
//! Defines `records`, `records_vec` (vec0), `record_log`, `trust_entries`,
//! `outbox`, `seen_envelopes`, `fact_corroborations` and `schema_meta`. All DDL
//! uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::{Connection, OptionalExtension};

const SCHEMA_SQL: &str = r#"
-- Tiered memory records
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    origin_module_id TEXT NOT NULL,
    link_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    checksum TEXT NOT NULL,
    key_id TEXT NOT NULL,
    importance REAL NOT NULL CHECK(importance >= 0.0 AND importance <= 1.0),
    tier TEXT NOT NULL CHECK(tier IN ('ephemeral','short_term','long_term','purged')),
    verified INTEGER NOT NULL DEFAULT 1,
    source_peer TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    window_started_at TEXT NOT NULL,
    window_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    expires_at TEXT,
    purged_at TEXT,
    decayed_at TEXT,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_link ON records(link_id);
CREATE INDEX IF NOT EXISTS idx_records_tier ON records(tier);
CREATE INDEX IF NOT EXISTS idx_records_tier_accessed ON records(tier, last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_records_partition ON records(link_id, origin_module_id);

-- Audit log
CREATE TABLE IF NOT EXISTS record_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('ingest','merge','verify','promote','demote','decay','purge','evict','forget','rotate')),
    record_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Per-peer credibility
CREATE TABLE IF NOT EXISTS trust_entries (
    peer_id TEXT PRIMARY KEY,
    score REAL NOT NULL CHECK(score >= 0.0 AND score <= 1.0),
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);

-- Frames that exhausted every transport
CREATE TABLE IF NOT EXISTS outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    recipient TEXT,
    frame BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(correlation_id, sequence)
);

-- Inbound replay protection
CREATE TABLE IF NOT EXISTS seen_envelopes (
    correlation_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    seen_at TEXT NOT NULL,
    PRIMARY KEY (correlation_id, sequence, sender_id)
);

CREATE INDEX IF NOT EXISTS idx_seen_at ON seen_envelopes(seen_at);

-- Which peers have asserted which fact
CREATE TABLE IF NOT EXISTS fact_corroborations (
    record_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (record_id, peer_id)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax) and carries
/// the deployment's fixed dimension.
fn vec_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS records_vec USING vec0(\n    id TEXT PRIMARY KEY,\n    embedding FLOAT[{dimensions}]\n);"
    )
}

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
///
/// Fails if the database was created with a different vector dimension.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'vector_dim'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stored) = stored {
        if stored != dimensions.to_string() {
            return Err(rusqlite::Error::InvalidParameterName(format!(
                "vector dimension mismatch: database has {stored}, configured {dimensions}"
            )));
        }
    }

    conn.execute_batch(&vec_table_sql(dimensions))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('vector_dim', ?1)",
        [dimensions.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "records",
            "record_log",
            "trust_entries",
            "outbox",
            "seen_envelopes",
            "fact_corroborations",
            "schema_meta",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();
        init_schema(&conn, 8).unwrap();
    }

    #[test]
    fn schema_rejects_dimension_change() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();
        let err = init_schema(&conn, 16).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }
}
