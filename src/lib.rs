//! Tiered semantic memory for AI processes, shared with peers over HSP.
//!
//! A node stores payloads as encrypted records with semantic vectors, moves
//! them between retention tiers, and exchanges facts, capability
//! advertisements and task requests with other nodes over a set of transports
//! with automatic fallback.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for nearest-neighbour search; payloads sealed with AES-256-GCM
//! - **Encoders**: local ONNX all-MiniLM-L6-v2 or a model-free hashing encoder
//! - **Sync**: HSP envelopes in length-prefixed, checksummed MessagePack frames
//!   over NATS (primary), a direct HTTP link and a filesystem mailbox
//! - **Surface**: MCP over stdio or streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with env overrides
//! - [`db`]: schema, migrations and health checks
//! - [`embedding`]: the [`embedding::SemanticEncoder`] trait and providers
//! - [`memory`]: the tiered store, search, maintenance and forgetting
//! - [`cipher`]: payload encryption and key rotation
//! - [`protocol`]: HSP envelopes and the frame codec
//! - [`transport`]: NATS, HTTP, mailbox and in-process transports
//! - [`sync`]: connection state machine, retries, fallback and the outbox
//! - [`trust`]: per-peer trust scores
//! - [`registry`]: capability advertisement and discovery
//! - [`node`]: the process-lifetime context tying it all together

pub mod cipher;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sync;
pub mod tools;
pub mod transport;
pub mod trust;

pub use error::{CoreError, CoreResult};
pub use node::Node;
