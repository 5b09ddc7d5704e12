use mnemosync::cipher::PayloadCipher;
use mnemosync::db;
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("new.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path, 16).unwrap();

    assert!(db_path.exists());
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn health_check_passes_on_valid_db() {
    let conn = db::open_memory_database(16).unwrap();

    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert!(!report.sqlite_vec_version.is_empty());
    assert_eq!(report.record_count, 0);
    assert_eq!(report.trust_entry_count, 0);
    assert_eq!(report.outbox_count, 0);
}

#[test]
fn busy_timeout_is_set() {
    let tmp = TempDir::new().unwrap();
    let conn = db::open_database(tmp.path().join("test.db"), 16).unwrap();

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
}

#[test]
fn key_file_is_created_once_and_reloaded() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("keys").join("payload.key");

    let created = PayloadCipher::load_or_create(&path).unwrap();
    let loaded = PayloadCipher::load_or_create(&path).unwrap();
    assert_eq!(created.key_id(), loaded.key_id());

    let sealed = created.encrypt(b"secret").unwrap();
    assert_eq!(loaded.decrypt(created.key_id(), &sealed).unwrap(), b"secret");
}

#[test]
fn empty_key_file_is_a_crypto_error() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("payload.key");
    std::fs::write(&path, "\n").unwrap();

    let err = PayloadCipher::load_or_create(&path).unwrap_err();
    assert!(matches!(err, mnemosync::CoreError::Crypto(_)));
}
