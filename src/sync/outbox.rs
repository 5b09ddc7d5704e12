//! Durable queue for frames that every transport refused, plus the bounded
//! window of `(correlation_id, sequence)` pairs already delivered.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use chrono::Utc;
use rusqlite::params;

use crate::db::{self, Database};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub correlation_id: String,
    pub sequence: u32,
    pub recipient: Option<String>,
    pub frame: Bytes,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct Outbox {
    db: Database,
}

impl Outbox {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> CoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&*db::lock(&db)?))
            .await
            .map_err(|e| CoreError::Other(format!("outbox task failed: {e}")))?
    }

    /// Queue a frame. A second push for the same pair is ignored.
    pub async fn push(
        &self,
        correlation_id: &str,
        sequence: u32,
        recipient: Option<&str>,
        frame: Bytes,
    ) -> CoreResult<bool> {
        let correlation_id = correlation_id.to_string();
        let recipient = recipient.map(str::to_string);
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO outbox (correlation_id, sequence, recipient, frame, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![correlation_id, sequence, recipient, frame.as_ref(), Utc::now().to_rfc3339()],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    /// Oldest entries first.
    pub async fn pending(&self, limit: usize) -> CoreResult<Vec<OutboxEntry>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, correlation_id, sequence, recipient, frame, attempts \
                 FROM outbox ORDER BY seq LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(OutboxEntry {
                        id: row.get(0)?,
                        correlation_id: row.get(1)?,
                        sequence: row.get(2)?,
                        recipient: row.get(3)?,
                        frame: Bytes::from(row.get::<_, Vec<u8>>(4)?),
                        attempts: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn remove(&self, id: i64) -> CoreResult<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM outbox WHERE seq = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn record_attempt(&self, id: i64) -> CoreResult<()> {
        self.blocking(move |conn| {
            conn.execute("UPDATE outbox SET attempts = attempts + 1 WHERE seq = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn len(&self) -> CoreResult<usize> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

/// Remembers the most recent `capacity` delivered pairs.
#[derive(Debug)]
pub struct DeliveredWindow {
    capacity: usize,
    order: VecDeque<(String, u32)>,
    seen: HashSet<(String, u32)>,
}

impl DeliveredWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, correlation_id: &str, sequence: u32) -> bool {
        self.seen.contains(&(correlation_id.to_string(), sequence))
    }

    pub fn insert(&mut self, correlation_id: &str, sequence: u32) {
        let key = (correlation_id.to_string(), sequence);
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}
