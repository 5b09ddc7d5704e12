use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub node: NodeSection,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub trust: TrustConfig,
    pub registry: RegistryConfig,
    pub sync: SyncConfig,
    pub maintenance: MaintenanceConfig,
    pub completion: CompletionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// MCP transport: `"stdio"` or `"http"`.
    pub transport: String,
    /// Listen address for the streamable HTTP MCP endpoint.
    pub bind: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeSection {
    /// Identifier this process announces to peers.
    pub peer_id: String,
    /// Origin used for payloads ingested through the MCP surface.
    pub default_origin: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Base64 AES-256 key file. Created on first start.
    pub key_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX all-MiniLM-L6-v2) or `"hashing"` (feature hashing, no model files).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Cosine similarity at or above which two records of one partition merge.
    pub dedup_threshold: f64,
    /// Importance assigned to a locally ingested record.
    pub initial_importance: f64,
    /// Importance added on a dedup merge or a query hit.
    pub access_boost: f64,
    /// EPHEMERAL → SHORT_TERM importance bar.
    pub promote_importance: f64,
    /// EPHEMERAL → SHORT_TERM access-count bar within the window.
    pub promote_access_count: u32,
    /// SHORT_TERM → LONG_TERM importance bar.
    pub long_term_importance: f64,
    /// SHORT_TERM → LONG_TERM access-count bar within the window.
    pub long_term_access_count: u32,
    pub access_window_secs: u64,
    pub ephemeral_ttl_secs: u64,
    /// Unpromoted SHORT_TERM records are purged past this age in the tier.
    pub short_term_ttl_secs: u64,
    /// Records idle for less than this are not decayed.
    pub decay_idle_secs: u64,
    pub short_term_half_life_secs: u64,
    pub long_term_half_life_secs: u64,
    /// LONG_TERM records whose importance decays below this are demoted to SHORT_TERM.
    pub long_term_floor: f64,
    pub purge_threshold: f64,
    /// PURGED records are evicted once purged for longer than this.
    pub purge_grace_secs: u64,
    /// Upper bound on live records; 0 disables the capacity check.
    pub max_records: usize,
    pub max_payload_bytes: usize,
    /// Candidates examined per kNN query before tier filtering.
    pub query_overfetch: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrustConfig {
    pub default_score: f64,
    /// Learning rate α in `score ← score + α·(outcome − score)`.
    pub learning_rate: f64,
    pub trust_floor: f64,
    /// Entries untouched for this long relax toward the default score.
    pub inactivity_days: u64,
    pub relax_rate: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_ttl_secs: u64,
    /// Local advertisements are re-broadcast at this fraction of their ttl.
    pub readvertise_fraction: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Transport names in priority order; the first is the primary.
    pub transports: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
    pub probe_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_frame_bytes: usize,
    /// Delivered `(correlation_id, sequence)` pairs remembered for outbox dedup.
    pub delivered_window: usize,
    pub nats: NatsConfig,
    pub http: HttpLinkConfig,
    pub mailbox: MailboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub subject_prefix: String,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpLinkConfig {
    pub bind: String,
    /// peer_id → base URL of that peer's direct-link listener.
    pub peers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MailboxConfig {
    pub root: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompletionConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`. Unset
    /// means this node does not provide `text.complete`.
    pub base_url: Option<String>,
    pub model: String,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            bind: "127.0.0.1:8766".into(),
            log_level: "info".into(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
        Self {
            peer_id: format!("mnemosync-{host}"),
            default_origin: "mcp".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            key_path: dir.join("payload.key").to_string_lossy().into_owned(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_data_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            dimensions: 384,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.92,
            initial_importance: 0.5,
            access_boost: 0.1,
            promote_importance: 0.6,
            promote_access_count: 3,
            long_term_importance: 0.85,
            long_term_access_count: 8,
            access_window_secs: 24 * 3600,
            ephemeral_ttl_secs: 6 * 3600,
            short_term_ttl_secs: 14 * 24 * 3600,
            decay_idle_secs: 3600,
            short_term_half_life_secs: 3 * 24 * 3600,
            long_term_half_life_secs: 30 * 24 * 3600,
            long_term_floor: 0.3,
            purge_threshold: 0.05,
            purge_grace_secs: 24 * 3600,
            max_records: 0,
            max_payload_bytes: 64 * 1024,
            query_overfetch: 64,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            default_score: 0.5,
            learning_rate: 0.1,
            trust_floor: 0.3,
            inactivity_days: 30,
            relax_rate: 0.1,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            readvertise_fraction: 0.5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transports: vec!["nats".into(), "http".into(), "mailbox".into()],
            heartbeat_interval_ms: 5_000,
            missed_heartbeats: 3,
            probe_interval_ms: 10_000,
            send_timeout_ms: 3_000,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            max_frame_bytes: 1024 * 1024,
            delivered_window: 4096,
            nats: NatsConfig::default(),
            http: HttpLinkConfig::default(),
            mailbox: MailboxConfig::default(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".into(),
            subject_prefix: "hsp".into(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl Default for HttpLinkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8765".into(),
            peers: HashMap::new(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir()
                .join("mailbox")
                .to_string_lossy()
                .into_owned(),
            poll_interval_ms: 500,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "llama3.2".into(),
            api_key_env: "MNEMOSYNC_LLM_API_KEY".into(),
            timeout_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Returns `~/.mnemosync/`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mnemosync")
}

/// Returns the default config file path: `~/.mnemosync/config.toml`
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

impl NodeConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            NodeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MNEMOSYNC_DB, MNEMOSYNC_PEER_ID, MNEMOSYNC_LOG_LEVEL, MNEMOSYNC_NATS_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMOSYNC_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMOSYNC_PEER_ID") {
            self.node.peer_id = val;
        }
        if let Ok(val) = std::env::var("MNEMOSYNC_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MNEMOSYNC_NATS_URL") {
            self.sync.nats.url = val;
        }
    }

    /// Reject threshold combinations that would break tier or trust invariants.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            anyhow::ensure!((0.0..=1.0).contains(&v), "{name} must be within [0, 1], got {v}");
            Ok(())
        };
        unit("memory.dedup_threshold", self.memory.dedup_threshold)?;
        unit("memory.initial_importance", self.memory.initial_importance)?;
        unit("memory.promote_importance", self.memory.promote_importance)?;
        unit("memory.long_term_importance", self.memory.long_term_importance)?;
        unit("memory.purge_threshold", self.memory.purge_threshold)?;
        unit("trust.default_score", self.trust.default_score)?;
        unit("trust.learning_rate", self.trust.learning_rate)?;
        unit("trust.trust_floor", self.trust.trust_floor)?;
        anyhow::ensure!(
            self.memory.long_term_importance >= self.memory.promote_importance,
            "memory.long_term_importance must not be below memory.promote_importance"
        );
        anyhow::ensure!(
            self.memory.long_term_half_life_secs >= self.memory.short_term_half_life_secs,
            "long-term records must not decay faster than short-term ones"
        );
        crate::protocol::validate_peer_id(&self.node.peer_id)?;
        anyhow::ensure!(self.embedding.dimensions > 0, "embedding.dimensions must be > 0");
        anyhow::ensure!(!self.sync.transports.is_empty(), "sync.transports must not be empty");
        anyhow::ensure!(self.sync.max_attempts > 0, "sync.max_attempts must be > 0");
        Ok(())
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_key_path(&self) -> PathBuf {
        expand_tilde(&self.storage.key_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
