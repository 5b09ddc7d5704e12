//! Schema versioning and the `schema_meta` keys.
//!
//! [`crate::db::schema`] creates the version-1 layout directly. Later layouts
//! are reached by appending a step to [`MIGRATIONS`]; a database stamped with
//! a version this binary does not know is refused rather than written to.

use rusqlite::{Connection, OptionalExtension, Transaction};

/// One forward step: `(target_version, apply)`.
type Migration = (u32, fn(&Transaction<'_>) -> rusqlite::Result<()>);

/// Steps beyond the base layout, in ascending target order.
const MIGRATIONS: &[Migration] = &[];

/// The schema version this binary reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

fn meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM schema_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        [key, value],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw = meta(conn, "schema_version")?.unwrap_or_default();
    raw.parse::<u32>().map_err(|_| {
        rusqlite::Error::InvalidParameterName(format!("unreadable schema_version {raw:?}"))
    })
}

/// Model id of the encoder that produced the stored vectors, if one has
/// been recorded. Written by [`crate::memory::engine::MemoryStore::new`].
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    meta(conn, "embedding_model")
}

pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    set_meta(conn, "embedding_model", model)
}

/// Bring the database up to [`CURRENT_SCHEMA_VERSION`], one transaction per
/// step. Fails on databases written by a newer binary.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "database schema v{version} is newer than supported v{CURRENT_SCHEMA_VERSION}"
        )));
    }

    for (target, apply) in MIGRATIONS.iter().filter(move |(target, _)| *target > version) {
        tracing::info!(from = version, to = target, "running migration");
        let tx = conn.transaction()?;
        apply(&tx)?;
        set_meta(&tx, "schema_version", &target.to_string())?;
        tx.commit()?;
        version = *target;
    }
    tracing::debug!(schema_version = version, "schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn, 8).unwrap();
        conn
    }

    #[test]
    fn fresh_db_is_current_and_has_no_model() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(get_embedding_model(&conn).unwrap(), None);
    }

    #[test]
    fn newer_database_is_refused() {
        let mut conn = test_db();
        set_meta(&conn, "schema_version", "99").unwrap();
        let err = run_migrations(&mut conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn embedding_model_is_overwritten() {
        let conn = test_db();
        set_embedding_model(&conn, "hashing-32").unwrap();
        set_embedding_model(&conn, "all-MiniLM-L6-v2").unwrap();
        assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("all-MiniLM-L6-v2"));
    }
}
