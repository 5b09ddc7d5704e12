mod helpers;

use mnemosync::db;
use rusqlite::Connection;

fn table_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name")
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn schema_creates_every_table() {
    let db = helpers::test_db();
    let conn = db::lock(&db).unwrap();
    let tables = table_names(&conn);

    for expected in [
        "records",
        "records_vec",
        "record_log",
        "trust_entries",
        "outbox",
        "seen_envelopes",
        "fact_corroborations",
        "schema_meta",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
    }
}

#[test]
fn vector_dimension_is_recorded() {
    let db = helpers::test_db();
    let conn = db::lock(&db).unwrap();
    let dim: String = conn
        .query_row("SELECT value FROM schema_meta WHERE key = 'vector_dim'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(dim, helpers::DIM.to_string());
}

#[test]
fn reopening_with_another_dimension_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("dims.db");
    drop(db::open_database(&path, 16).unwrap());

    assert!(db::open_database(&path, 32).is_err());
    assert!(db::open_database(&path, 16).is_ok());
}

#[test]
fn outbox_rejects_duplicate_envelope_keys() {
    let db = helpers::test_db();
    let conn = db::lock(&db).unwrap();
    let insert = "INSERT OR IGNORE INTO outbox (correlation_id, sequence, recipient, frame, attempts, created_at) \
                  VALUES ('c1', 0, NULL, x'00', 0, '2026-01-01T00:00:00Z')";
    assert_eq!(conn.execute(insert, []).unwrap(), 1);
    assert_eq!(conn.execute(insert, []).unwrap(), 0);
}
