use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mnemosync::{cli, config, server};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mnemosync", version, about = "Tiered semantic memory shared between AI processes")]
struct Cli {
    /// Config file (defaults to ~/.mnemosync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the node and its MCP server (transport from `server.transport`)
    Serve,
    /// Run one maintenance pass offline
    Maintenance,
    /// Re-encrypt every payload under a new key
    RotateKey,
    /// Show store statistics
    Stats,
    /// Check database health
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.mnemosync/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::NodeConfig::load_from(path)?,
        None => config::NodeConfig::load()?,
    };

    // stdout carries MCP JSON-RPC on stdio; logs go to stderr.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => match config.server.transport.as_str() {
            "http" => server::serve_http(config).await?,
            _ => server::serve_stdio(config).await?,
        },
        Command::Maintenance => cli::maintenance::run(&config).await?,
        Command::RotateKey => cli::maintenance::rotate_key(&config).await?,
        Command::Stats => cli::stats::stats(&config)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
