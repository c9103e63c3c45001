use std::sync::Arc;

use clap::Parser;
use tracing::info;

use place_common::config::{load_config, RelayConfig, StoreConfig};
use place_store::{ChunkStore, FileStore, MemoryStore, RedisStore};

use crate::manager::CanvasManager;
use crate::server::RelayServer;

mod manager;
mod server;
mod state;

#[derive(Parser, Debug)]
#[command(name = "place-relay", version, about = "Shared pixel canvas relay")]
struct Args {
    #[arg(long, default_value = "config/relay.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config: RelayConfig = load_config(&args.config)?;
    info!(store = %config.store, width = config.canvas.width, height = config.canvas.height, "starting relay");

    let store = open_store(&config.store)?;
    let canvas = Arc::new(CanvasManager::new(config.canvas.clone(), store));
    let warmed = canvas.warm().await?;
    info!(chunks = warmed, "canvas cache warmed");

    let server = RelayServer::new(config, Arc::clone(&canvas));
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!(cached_chunks = canvas.cached_chunks(), "shutting down");
            Ok(())
        }
    }
}

fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ChunkStore>> {
    let store: Arc<dyn ChunkStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::File { data_dir } => Arc::new(FileStore::new(data_dir)?),
        StoreConfig::Redis { url } => {
            let store = RedisStore::new(url)?;
            store.ping()?;
            Arc::new(store)
        }
    };
    Ok(store)
}
