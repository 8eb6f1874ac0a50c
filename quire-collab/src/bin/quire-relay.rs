//! Standalone relay.
//!
//! `QUIRE_BIND_ADDR` (default `127.0.0.1:9090`) and `QUIRE_STORAGE_PATH`
//! (snapshots disabled when unset). Log level via `RUST_LOG`.

use std::path::PathBuf;

use log::info;
use quire_collab::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("QUIRE_BIND_ADDR") {
        config.bind_addr = addr;
    }
    config.storage_path = std::env::var_os("QUIRE_STORAGE_PATH").map(PathBuf::from);

    info!(
        "Starting quire relay on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string())
    );

    let server = RelayServer::new(config)?;
    server.run().await
}
