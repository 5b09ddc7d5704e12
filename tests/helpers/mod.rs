#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mnemosync::cipher::PayloadCipher;
use mnemosync::config::{MemoryConfig, NodeConfig};
use mnemosync::db::{self, Database};
use mnemosync::embedding::hashing::HashingEncoder;
use mnemosync::embedding::SemanticEncoder;
use mnemosync::memory::engine::MemoryStore;
use mnemosync::memory::types::Record;
use mnemosync::transport::{MemoryHub, Transport};
use mnemosync::Node;

/// Vector dimension used by every test store.
pub const DIM: usize = 32;

/// Returns scripted vectors for known texts and falls back to feature hashing.
pub struct ScriptedEncoder {
    scripted: HashMap<String, Vec<f32>>,
    fallback: HashingEncoder,
}

impl ScriptedEncoder {
    pub fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
        Self {
            scripted: vectors.iter().map(|(t, v)| (t.to_string(), v.clone())).collect(),
            fallback: HashingEncoder::new(DIM),
        }
    }
}

impl SemanticEncoder for ScriptedEncoder {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        match self.scripted.get(text) {
            Some(v) => Ok(v.clone()),
            None => self.fallback.encode(text),
        }
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn model_id(&self) -> String {
        "scripted".into()
    }
}

/// Unit vector along dimension `i`.
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[i % DIM] = 1.0;
    v
}

/// `base` nudged toward dimension `i` by `eps`, re-normalized.
/// Cosine similarity to `base` is `1 / sqrt(1 + eps²)` for orthogonal nudges.
pub fn nudged(base: &[f32], i: usize, eps: f32) -> Vec<f32> {
    let mut v = base.to_vec();
    v[i % DIM] += eps;
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

/// Fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Database {
    Arc::new(Mutex::new(db::open_memory_database(DIM).unwrap()))
}

pub fn test_store(vectors: &[(&str, Vec<f32>)]) -> MemoryStore {
    test_store_with(test_db(), vectors, MemoryConfig::default())
}

pub fn test_store_with(db: Database, vectors: &[(&str, Vec<f32>)], config: MemoryConfig) -> MemoryStore {
    MemoryStore::new(
        db,
        Arc::new(ScriptedEncoder::new(vectors)),
        PayloadCipher::generate(),
        config,
    )
    .unwrap()
}

/// Read a record row straight from the database.
pub fn record(store: &MemoryStore, id: &str) -> Option<Record> {
    let conn = db::lock(store.database()).unwrap();
    mnemosync::memory::store::get_record(&conn, id).unwrap()
}

/// Node config with timings short enough for tests.
pub fn test_config(peer_id: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.peer_id = peer_id.to_string();
    config.embedding.provider = "hashing".into();
    config.embedding.dimensions = DIM;
    config.maintenance.enabled = false;
    config.sync.heartbeat_interval_ms = 50;
    config.sync.missed_heartbeats = 2;
    config.sync.probe_interval_ms = 50;
    config.sync.send_timeout_ms = 200;
    config.sync.max_attempts = 2;
    config.sync.backoff_base_ms = 5;
    config.sync.backoff_max_ms = 20;
    config
}

/// Start a node attached to `hubs`, in priority order.
pub async fn start_node(peer_id: &str, hubs: &[&Arc<MemoryHub>], vectors: &[(&str, Vec<f32>)]) -> Node {
    let transports: Vec<Arc<dyn Transport>> = hubs
        .iter()
        .map(|hub| Arc::new(hub.transport(peer_id)) as Arc<dyn Transport>)
        .collect();
    start_node_with(test_config(peer_id), transports, vectors).await
}

pub async fn start_node_with(
    config: NodeConfig,
    transports: Vec<Arc<dyn Transport>>,
    vectors: &[(&str, Vec<f32>)],
) -> Node {
    let db = test_db();
    let store = test_store_with(db.clone(), vectors, config.memory.clone());
    Node::start(config, db, store, transports, None).await.unwrap()
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `count` listeners are attached to every hub.
pub async fn wait_attached(hubs: &[&Arc<MemoryHub>], count: usize) {
    let attached = wait_until(Duration::from_secs(5), || async {
        hubs.iter().all(|h| h.peer_count() >= count)
    })
    .await;
    assert!(attached, "listeners did not attach");
}
