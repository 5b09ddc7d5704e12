//! Explicit hard deletion for privacy and compliance requests.
//!
//! Removes the record, its vector and its corroborations. Only the audit row
//! (id, timestamp, reason) survives; the payload is gone.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::store::{delete_record, write_audit_log};
use crate::error::{CoreError, CoreResult};

/// Result returned from a forget operation.
#[derive(Debug, Serialize)]
pub struct ForgetResult {
    pub id: String,
    pub link_id: String,
}

/// Permanently delete one record.
pub fn forget_record(
    conn: &mut Connection,
    record_id: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<ForgetResult> {
    let tx = conn.transaction()?;

    let link_id: String = tx
        .query_row(
            "SELECT link_id FROM records WHERE id = ?1",
            params![record_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("record {record_id}")),
            other => other.into(),
        })?;

    delete_record(&tx, record_id)?;
    write_audit_log(
        &tx,
        "forget",
        record_id,
        Some(&serde_json::json!({"reason": reason, "link_id": link_id})),
        now,
    )?;
    tx.commit()?;

    tracing::info!(record_id, "record forgotten");
    Ok(ForgetResult {
        id: record_id.to_string(),
        link_id,
    })
}

/// Partition of a record, if it exists.
pub fn link_of(conn: &Connection, record_id: &str) -> CoreResult<Option<String>> {
    use rusqlite::OptionalExtension;
    Ok(conn
        .query_row(
            "SELECT link_id FROM records WHERE id = ?1",
            params![record_id],
            |row| row.get(0),
        )
        .optional()?)
}
