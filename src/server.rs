//! Node bootstrap and MCP server entry points.
//!
//! [`open_store`] wires the database, payload key and encoder into a
//! [`MemoryStore`]; [`start_node`] adds transports and the optional completion
//! provider; [`serve_stdio`] and [`serve_http`] expose the node over MCP.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rmcp::ServiceExt;

use crate::cipher::PayloadCipher;
use crate::completion::{self, CompletionProvider};
use crate::config::NodeConfig;
use crate::db::{self, Database};
use crate::embedding;
use crate::memory::engine::MemoryStore;
use crate::node::Node;
use crate::tools::MnemoTools;
use crate::transport;

/// Open the database and build the store on top of it.
pub fn open_store(config: &NodeConfig) -> Result<(Database, MemoryStore)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.embedding.dimensions)?;
    tracing::info!(db = %db_path.display(), "database ready");
    let db: Database = Arc::new(Mutex::new(conn));

    let encoder: Arc<dyn embedding::SemanticEncoder> =
        Arc::from(embedding::create_encoder(&config.embedding)?);
    tracing::info!(model = %encoder.model_id(), "encoder ready");

    let key_path = config.resolved_key_path();
    let cipher = PayloadCipher::load_or_create(&key_path)
        .with_context(|| format!("failed to load payload key from {}", key_path.display()))?;

    let store = MemoryStore::new(db.clone(), encoder, cipher, config.memory.clone())?
        .with_key_path(key_path)
        .with_db_path(db_path);
    Ok((db, store))
}

/// Build everything and start the node's background tasks.
pub async fn start_node(config: NodeConfig) -> Result<Node> {
    let (db, store) = open_store(&config)?;
    let transports = transport::build_transports(&config.sync, &config.node.peer_id)?;
    let completion: Option<Arc<dyn CompletionProvider>> =
        completion::create_provider(&config.completion)?.map(Arc::from);
    if let Some(provider) = &completion {
        tracing::info!(model = %provider.model(), "completion provider ready");
    }
    Ok(Node::start(config, db, store, transports, completion).await?)
}

/// Start the MCP server over stdio.
pub async fn serve_stdio(config: NodeConfig) -> Result<()> {
    tracing::info!("starting mnemosync MCP server on stdio");

    let node = start_node(config).await?;
    let tools = MnemoTools::new(node.clone());
    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    let outcome = server.waiting().await;
    node.shutdown().await;
    outcome?;
    tracing::info!("MCP server shut down");
    Ok(())
}

/// Start the MCP server over streamable HTTP.
pub async fn serve_http(config: NodeConfig) -> Result<()> {
    let bind_addr = config.server.bind.clone();
    tracing::info!(addr = %bind_addr, "starting mnemosync MCP server on HTTP");

    let node = start_node(config).await?;
    let service_node = node.clone();
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(MnemoTools::new(service_node.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    node.shutdown().await;
    Ok(())
}
