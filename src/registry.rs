//! Capability registry.
//!
//! Advertisements from every peer (this one included) live in a copy-on-write
//! map: readers clone an `Arc` under a momentary read lock and work on that
//! snapshot, writers rebuild the map and swap it in. Discovery never waits on
//! a writer for longer than the swap and never touches the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::completion::CompletionProvider;
use crate::config::RegistryConfig;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{AdvertisementBody, ResponseBody, ResponseStatus};
use crate::trust::TrustLedger;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Advertisement {
    pub capability_name: String,
    pub provider_peer_id: String,
    pub version: String,
    pub tags: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Advertisement {
    pub fn expires_at(&self) -> DateTime<Utc> {
        expiry(self.issued_at, self.ttl_secs)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }

    /// Whole seconds left before expiry, rounded up.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.expires_at() - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// A discovery result.
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    #[serde(flatten)]
    pub advertisement: Advertisement,
    pub trust: f64,
    pub local: bool,
}

/// A response produced by a local handler, waiting to be sent.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub requester: String,
    pub correlation_id: String,
    pub sequence: u32,
    pub body: ResponseBody,
}

/// Lets a handler answer one request, any number of times.
#[derive(Clone)]
pub struct Responder {
    requester: String,
    correlation_id: String,
    next_sequence: Arc<AtomicU32>,
    tx: mpsc::UnboundedSender<OutboundResponse>,
}

impl Responder {
    pub fn new(requester: &str, correlation_id: &str, tx: mpsc::UnboundedSender<OutboundResponse>) -> Self {
        Self {
            requester: requester.to_string(),
            correlation_id: correlation_id.to_string(),
            next_sequence: Arc::new(AtomicU32::new(1)),
            tx,
        }
    }

    fn emit(&self, status: ResponseStatus, output: serde_json::Value) -> CoreResult<()> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(OutboundResponse {
                requester: self.requester.clone(),
                correlation_id: self.correlation_id.clone(),
                sequence,
                body: ResponseBody { status, output },
            })
            .map_err(|_| CoreError::Closed)
    }

    /// Intermediate result; the task stays open.
    pub fn partial(&self, output: serde_json::Value) -> CoreResult<()> {
        self.emit(ResponseStatus::Partial, output)
    }

    pub fn finish(self, output: serde_json::Value) -> CoreResult<()> {
        self.emit(ResponseStatus::Ok, output)
    }

    pub fn fail(self, reason: impl Into<String>) -> CoreResult<()> {
        self.emit(ResponseStatus::Error, serde_json::json!({ "error": reason.into() }))
    }
}

/// A request addressed to a capability this node provides.
pub struct InboundTask {
    pub correlation_id: String,
    pub requester: String,
    pub capability: String,
    pub input: serde_json::Value,
    pub responder: Responder,
}

/// How a local capability is served.
#[derive(Clone)]
pub enum CapabilityHandler {
    /// Tasks are handed to a collaborator over a channel.
    Channel(mpsc::Sender<InboundTask>),
    /// Served in-process by a completion provider.
    Completion(Arc<dyn CompletionProvider>),
}

type Key = (String, String);

fn expiry(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct CapabilityRegistry {
    local_peer: String,
    config: RegistryConfig,
    snapshot: RwLock<Arc<HashMap<Key, Advertisement>>>,
    handlers: RwLock<HashMap<String, CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new(local_peer: &str, config: RegistryConfig) -> Self {
        Self {
            local_peer: local_peer.to_string(),
            config,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> Arc<HashMap<Key, Advertisement>> {
        Arc::clone(&self.snapshot.read())
    }

    fn update<R>(&self, f: impl FnOnce(&mut HashMap<Key, Advertisement>) -> R) -> R {
        let mut guard = self.snapshot.write();
        let mut next = HashMap::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    /// Advertise a local capability. `ttl` of `None` uses the configured default.
    pub fn advertise(&self, capability_name: &str, version: &str, tags: &[String], ttl: Option<Duration>) -> Advertisement {
        let ttl = ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs));
        let ad = Advertisement {
            capability_name: capability_name.to_string(),
            provider_peer_id: self.local_peer.clone(),
            version: version.to_string(),
            tags: tags.to_vec(),
            issued_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        self.update(|map| {
            map.insert((ad.capability_name.clone(), ad.provider_peer_id.clone()), ad.clone())
        });
        tracing::info!(capability = capability_name, ttl_secs = ttl.as_secs(), "capability advertised");
        ad
    }

    pub fn register_handler(&self, capability_name: &str, handler: CapabilityHandler) {
        self.handlers.write().insert(capability_name.to_string(), handler);
    }

    pub fn handler(&self, capability_name: &str) -> Option<CapabilityHandler> {
        self.handlers.read().get(capability_name).cloned()
    }

    /// Remove a local capability and its handler.
    pub fn withdraw(&self, capability_name: &str) -> Option<Advertisement> {
        self.handlers.write().remove(capability_name);
        self.update(|map| map.remove(&(capability_name.to_string(), self.local_peer.clone())))
    }

    /// Apply an advertisement envelope from `provider`. A zero ttl withdraws.
    /// Returns true if the registry changed.
    pub fn ingest_remote(&self, provider: &str, body: &AdvertisementBody, now: DateTime<Utc>) -> bool {
        if provider == self.local_peer {
            return false;
        }
        let key = (body.capability_name.clone(), provider.to_string());
        if body.ttl_secs == 0 {
            return self.update(|map| map.remove(&key)).is_some();
        }
        let ad = Advertisement {
            capability_name: body.capability_name.clone(),
            provider_peer_id: provider.to_string(),
            version: body.version.clone(),
            tags: body.tags.clone(),
            issued_at: now,
            ttl_secs: body.ttl_secs,
        };
        tracing::debug!(capability = %ad.capability_name, provider, "remote advertisement");
        self.update(|map| map.insert(key, ad));
        true
    }

    fn is_local(&self, ad: &Advertisement) -> bool {
        ad.provider_peer_id == self.local_peer
    }

    /// Live providers of `capability_name`: this node first, then by trust.
    /// Local advertisements stay until withdrawn.
    pub fn discover(&self, capability_name: &str, trust: &TrustLedger, now: DateTime<Utc>) -> Vec<Provider> {
        let snapshot = self.snapshot();
        let mut providers: Vec<Provider> = snapshot
            .values()
            .filter(|ad| ad.capability_name == capability_name && (self.is_local(ad) || ad.is_live(now)))
            .map(|ad| {
                let local = self.is_local(ad);
                Provider {
                    trust: if local { 1.0 } else { trust.get_trust(&ad.provider_peer_id) },
                    local,
                    advertisement: ad.clone(),
                }
            })
            .collect();
        providers.sort_by(|a, b| {
            b.local
                .cmp(&a.local)
                .then_with(|| b.trust.total_cmp(&a.trust))
                .then_with(|| a.advertisement.provider_peer_id.cmp(&b.advertisement.provider_peer_id))
        });
        providers
    }

    /// Remove every remote advertisement past its own expiry.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let stale = |ad: &Advertisement| !self.is_local(ad) && !ad.is_live(now);
        if !self.snapshot().values().any(stale) {
            return 0;
        }
        let removed = self.update(|map| {
            let before = map.len();
            map.retain(|_, ad| !stale(ad));
            before - map.len()
        });
        tracing::debug!(removed, "expired advertisements swept");
        removed
    }

    /// Local advertisements that would lapse at peers before `horizon` has
    /// passed, or whose remaining ttl is under the re-advertise fraction.
    pub fn due_for_refresh(&self, now: DateTime<Utc>, horizon: Duration) -> Vec<Advertisement> {
        self.snapshot()
            .values()
            .filter(|ad| self.is_local(ad))
            .filter(|ad| {
                let threshold = (ad.ttl_secs as f64 * self.config.readvertise_fraction).max(horizon.as_secs_f64());
                (ad.remaining_secs(now) as f64) <= threshold
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
