//! # meshdb node binary
//!
//! Assembles a node from a YAML config: store, p2p swarm, replicator,
//! resync timers, sweepers, auto-backup and the HTTP/WebSocket adapter.

use anyhow::Context;
use clap::Parser;
use meshdb_api::AppState;
use meshdb_core::Config;
use meshdb_net::MeshNode;
use meshdb_store::memory::{self, MemoryManager, MemoryManagerConfig};
use meshdb_store::{backup, cache, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshdb")]
#[command(about = "meshdb - decentralized peer-to-peer document database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a node
    Start {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(short, long, default_value = "config.yaml")]
        path: PathBuf,
    },
    /// List backups in a data directory without starting a node
    Backups {
        #[arg(short, long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config } => start(config).await,
        Commands::InitConfig { path } => {
            Config::default()
                .save(&path)
                .with_context(|| format!("writing {path:?}"))?;
            println!("wrote default configuration to {}", path.display());
            Ok(())
        }
        Commands::Backups { data_dir } => {
            let store = Store::open(&data_dir)
                .with_context(|| format!("opening data dir {data_dir:?}"))?;
            for name in store.list_backups()? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("loading {config_path:?}"))?
    } else {
        warn!(path = ?config_path, "config file not found, using defaults");
        Config::default()
    };

    let node = MeshNode::start(&config).await?;
    let store = node.store();
    let shutdown = node.shutdown_signal();

    info!(node = %node.node_id(), data_dir = ?config.general.data_dir, "node is up");

    // Store-side background workers.
    let state = AppState::new(store.clone());
    let mut workers = vec![cache::spawn_sweeper(state.cache.clone(), shutdown.clone())];

    let manager = Arc::new(MemoryManager::new(
        store.clone(),
        MemoryManagerConfig::default(),
    ));
    workers.push(memory::spawn_sweeper(manager, shutdown.clone()));

    if let Some(handle) = backup::spawn_auto_backup(
        store.clone(),
        config.database.backup.clone(),
        shutdown.clone(),
    ) {
        workers.push(handle);
    }

    // Adapters.
    if config.api.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
        let api_state = state.clone();
        let api_shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = meshdb_api::serve(api_state, addr, api_shutdown).await {
                error!(error = %e, "http api terminated");
            }
        }));
    }
    if config.websocket.enabled && config.websocket.port != config.api.port {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.websocket.port));
        let ws_state = state.clone();
        let ws_shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = meshdb_api::serve(ws_state, addr, ws_shutdown).await {
                error!(error = %e, "websocket listener terminated");
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    node.shutdown().await;
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
