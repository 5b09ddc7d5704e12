//! Async facade over the tiered store.
//!
//! [`MemoryStore`] owns the database handle, the encoder and the payload
//! cipher. Writes are serialized per `link_id` partition through an async
//! mutex; different partitions proceed independently. CPU-bound encoding and
//! blocking SQLite work run on `spawn_blocking`. Caller deadlines bound the
//! whole call and are re-checked right before each commit.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use super::maintenance::{self, PlannedChange, SweepReport};
use super::stats::{store_stats, StatsResponse};
use super::store::{self, IngestRequest};
use super::types::{IngestOutcome, RecalledRecord, RecordHit, Tier};
use super::{forget, normalize_payload, search, Deadline};
use crate::cipher::PayloadCipher;
use crate::config::MemoryConfig;
use crate::db::{self, migrations, Database};
use crate::embedding::SemanticEncoder;
use crate::error::{CoreError, CoreResult};

/// Origin used for facts received from peers.
pub const FACT_ORIGIN: &str = "hsp.fact";

/// An inbound fact, already trust-scored by the caller.
#[derive(Debug, Clone)]
pub struct FactInput {
    pub content: String,
    pub link_id: String,
    pub sender_id: String,
    pub importance: f64,
    /// Sender trust met the floor.
    pub accepted: bool,
}

pub struct MemoryStore {
    db: Database,
    encoder: Arc<dyn SemanticEncoder>,
    cipher: Arc<RwLock<PayloadCipher>>,
    config: MemoryConfig,
    key_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    partitions: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl MemoryStore {
    /// Wrap an initialized database. Records the encoder's model id and
    /// refuses an encoder whose dimension differs from the stored vectors.
    pub fn new(
        db: Database,
        encoder: Arc<dyn SemanticEncoder>,
        cipher: PayloadCipher,
        config: MemoryConfig,
    ) -> CoreResult<Self> {
        {
            let conn = db::lock(&db)?;
            let stored_dim: String = conn.query_row(
                "SELECT value FROM schema_meta WHERE key = 'vector_dim'",
                [],
                |row| row.get(0),
            )?;
            if stored_dim != encoder.dimensions().to_string() {
                return Err(CoreError::Config(format!(
                    "encoder produces {} dimensions, database stores {stored_dim}",
                    encoder.dimensions()
                )));
            }

            let model = encoder.model_id();
            match migrations::get_embedding_model(&conn)? {
                Some(existing) if existing != model => {
                    tracing::warn!(stored = %existing, current = %model, "embedding model changed; similarity across models is unreliable");
                    migrations::set_embedding_model(&conn, &model)?;
                }
                Some(_) => {}
                None => migrations::set_embedding_model(&conn, &model)?,
            }
        }

        Ok(Self {
            db,
            encoder,
            cipher: Arc::new(RwLock::new(cipher)),
            config,
            key_path: None,
            db_path: None,
            partitions: DashMap::new(),
        })
    }

    /// Persist rotated keys to this file.
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Used for file-size reporting in [`MemoryStore::stats`].
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn partition(&self, link_id: &str) -> Arc<AsyncMutex<()>> {
        self.partitions
            .entry(link_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db::lock(&db)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::Other(format!("db task failed: {e}")))?
    }

    /// Encode text into a unit vector of the deployment's dimension.
    pub async fn encode(&self, text: &str) -> CoreResult<Vec<f32>> {
        if normalize_payload(text).is_empty() {
            return Err(CoreError::Encoding("empty payload".into()));
        }
        let encoder = Arc::clone(&self.encoder);
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || encoder.encode(&text))
            .await
            .map_err(|e| CoreError::Other(format!("encoding task failed: {e}")))?
            .map_err(|e| CoreError::Encoding(format!("{e:#}")))?;

        if vector.len() != self.encoder.dimensions() {
            return Err(CoreError::Encoding(format!(
                "encoder returned {} dimensions, expected {}",
                vector.len(),
                self.encoder.dimensions()
            )));
        }
        if vector.iter().all(|x| *x == 0.0) || vector.iter().any(|x| !x.is_finite()) {
            return Err(CoreError::Encoding("encoder returned a degenerate vector".into()));
        }
        Ok(vector)
    }

    /// Store a payload produced by a local module.
    pub async fn ingest(
        &self,
        payload: &str,
        origin_module_id: &str,
        link_id: &str,
        deadline: Option<Deadline>,
    ) -> CoreResult<IngestOutcome> {
        let importance = self.config.initial_importance;
        let outcome = within(deadline, async {
            let vector = self.encode(payload).await?;
            let _guard = self.partition(link_id).lock_owned().await;
            self.write(
                payload.to_string(),
                origin_module_id.to_string(),
                link_id.to_string(),
                importance,
                true,
                None,
                vector,
                deadline,
            )
            .await
        })
        .await;

        match &outcome {
            Ok(o) => tracing::info!(record_id = %o.id, link_id, merged = o.merged, "record ingested"),
            Err(CoreError::Encoding(reason)) => {
                tracing::warn!(link_id, origin_module_id, %reason, "ingestion skipped")
            }
            Err(_) => {}
        }
        outcome
    }

    /// Store a fact received from a peer. Unaccepted facts are kept unverified
    /// until a second peer sends the same content.
    pub async fn ingest_fact(&self, fact: FactInput, deadline: Option<Deadline>) -> CoreResult<IngestOutcome> {
        within(deadline, async {
            let vector = self.encode(&fact.content).await?;
            let _guard = self.partition(&fact.link_id).lock_owned().await;
            self.write(
                fact.content,
                FACT_ORIGIN.to_string(),
                fact.link_id,
                fact.importance,
                fact.accepted,
                Some(fact.sender_id),
                vector,
                deadline,
            )
            .await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        payload: String,
        origin_module_id: String,
        link_id: String,
        importance: f64,
        verified: bool,
        source_peer: Option<String>,
        vector: Vec<f32>,
        deadline: Option<Deadline>,
    ) -> CoreResult<IngestOutcome> {
        let cipher = Arc::clone(&self.cipher);
        let config = self.config.clone();
        self.with_conn(move |conn| {
            let cipher = cipher.read();
            let req = IngestRequest {
                payload: &payload,
                origin_module_id: &origin_module_id,
                link_id: &link_id,
                importance,
                verified,
                source_peer: source_peer.as_deref(),
            };
            store::ingest_record(conn, &cipher, &config, &req, &vector, Utc::now(), deadline)
        })
        .await
    }

    /// k-nearest-neighbor search. Updates access statistics of the hits.
    pub async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        tiers: Option<Vec<Tier>>,
        deadline: Option<Deadline>,
    ) -> CoreResult<Vec<RecordHit>> {
        if vector.len() != self.encoder.dimensions() {
            return Err(CoreError::Encoding(format!(
                "query vector has {} dimensions, expected {}",
                vector.len(),
                self.encoder.dimensions()
            )));
        }
        let config = self.config.clone();
        within(
            deadline,
            self.with_conn(move |conn| {
                search::query_records(conn, &config, &vector, k, tiers.as_deref(), Utc::now(), deadline)
            }),
        )
        .await
    }

    /// Encode `text` and query with the result.
    pub async fn query_text(
        &self,
        text: &str,
        k: usize,
        tiers: Option<Vec<Tier>>,
        deadline: Option<Deadline>,
    ) -> CoreResult<Vec<RecordHit>> {
        within(deadline, async {
            let vector = self.encode(text).await?;
            self.query(vector, k, tiers, deadline).await
        })
        .await
    }

    /// Decrypt one record and verify its checksum.
    pub async fn recall(&self, record_id: &str) -> CoreResult<RecalledRecord> {
        let cipher = Arc::clone(&self.cipher);
        let id = record_id.to_string();
        self.with_conn(move |conn| store::recall_record(conn, &cipher.read(), &id))
            .await
    }

    /// Permanently delete a record.
    pub async fn forget(&self, record_id: &str, reason: Option<&str>) -> CoreResult<forget::ForgetResult> {
        let id = record_id.to_string();
        let link_id = self
            .with_conn(move |conn| forget::link_of(conn, &id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("record {record_id}")))?;

        let _guard = self.partition(&link_id).lock_owned().await;
        let id = record_id.to_string();
        let reason = reason.map(str::to_string);
        self.with_conn(move |conn| forget::forget_record(conn, &id, reason.as_deref(), Utc::now()))
            .await
    }

    /// Source peer of a stored fact, if any.
    pub async fn source_peer(&self, record_id: &str) -> CoreResult<Option<String>> {
        let id = record_id.to_string();
        let record = self
            .with_conn(move |conn| store::get_record(conn, &id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("record {record_id}")))?;
        Ok(record.source_peer)
    }

    /// Snapshot, plan, then apply per partition under that partition's lock.
    async fn sweep<P>(&self, plan: P) -> CoreResult<SweepReport>
    where
        P: FnOnce(&[super::types::Record]) -> CoreResult<Vec<PlannedChange>> + Send + 'static,
    {
        let changes = self
            .with_conn(move |conn| {
                let snapshot = maintenance::load_snapshot(conn)?;
                plan(&snapshot)
            })
            .await?;

        let mut report = SweepReport::default();
        for (link_id, changes) in maintenance::by_partition(changes) {
            let _guard = self.partition(&link_id).lock_owned().await;
            let config = self.config.clone();
            let partial = self
                .with_conn(move |conn| maintenance::apply_changes(conn, &changes, &config, Utc::now()))
                .await?;
            report.merge(&partial);
        }
        Ok(report)
    }

    /// Promote qualifying records and purge expired unpromoted ones.
    pub async fn consolidate(&self) -> CoreResult<SweepReport> {
        let config = self.config.clone();
        self.sweep(move |s| maintenance::plan_consolidation(s, &config, Utc::now()))
            .await
    }

    /// Apply the forgetting curve.
    pub async fn decay(&self) -> CoreResult<SweepReport> {
        let config = self.config.clone();
        self.sweep(move |s| maintenance::plan_decay(s, &config, Utc::now()))
            .await
    }

    /// Delete PURGED records past the grace period.
    pub async fn evict(&self) -> CoreResult<SweepReport> {
        let config = self.config.clone();
        self.sweep(move |s| maintenance::plan_eviction(s, &config, Utc::now()))
            .await
    }

    /// Purge the least valuable records beyond `max_records`.
    pub async fn enforce_capacity(&self, max_records: usize) -> CoreResult<SweepReport> {
        self.sweep(move |s| Ok(maintenance::plan_capacity(s, max_records)))
            .await
    }

    /// One full maintenance pass: consolidate, decay, capacity, evict.
    pub async fn run_maintenance(&self) -> CoreResult<SweepReport> {
        let mut report = self.consolidate().await?;
        report.merge(&self.decay().await?);
        if self.config.max_records > 0 {
            report.merge(&self.enforce_capacity(self.config.max_records).await?);
        }
        report.merge(&self.evict().await?);

        self.partitions.retain(|_, lock| Arc::strong_count(lock) > 1);

        tracing::info!(
            promoted = report.promoted,
            demoted = report.demoted,
            decayed = report.decayed,
            purged = report.purged,
            evicted = report.evicted,
            skipped = report.skipped,
            "maintenance sweep complete"
        );
        Ok(report)
    }

    /// Re-encrypt every payload under a fresh key. Returns the new key id.
    ///
    /// The key file is written with both keys before the database changes and
    /// trimmed to the new key afterwards, so a crash in between loses nothing.
    pub async fn rotate_key(&self) -> CoreResult<String> {
        let cipher = Arc::clone(&self.cipher);
        let key_path = self.key_path.clone();
        self.with_conn(move |conn| {
            let mut guard = cipher.write();
            let next = guard.rotated();
            if let Some(path) = &key_path {
                next.save(path)?;
            }
            store::rotate_payload_key(conn, &next, &next, Utc::now())?;
            let next = next.without_retired();
            if let Some(path) = &key_path {
                next.save(path)?;
            }
            let key_id = next.key_id().to_string();
            *guard = next;
            Ok(key_id)
        })
        .await
    }

    pub async fn stats(&self) -> CoreResult<StatsResponse> {
        let db_path = self.db_path.clone();
        self.with_conn(move |conn| store_stats(conn, db_path.as_deref()))
            .await
    }
}

/// Bound a future by an optional deadline.
async fn within<T>(deadline: Option<Deadline>, fut: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
    match deadline {
        Some(d) => tokio::time::timeout(d.remaining(), fut)
            .await
            .map_err(|_| CoreError::Timeout(d.budget()))?,
        None => fut.await,
    }
}
