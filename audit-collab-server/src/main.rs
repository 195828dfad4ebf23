//! Collaboration server binary.
//!
//! Usage: `audit-collab-server [config.json]`
//!
//! `AUDIT_COLLAB_BIND` overrides the bind address, `RUST_LOG` the log level.

use std::process::ExitCode;

use audit_collab::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to read config {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    }
    .with_env_overrides();

    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No storage path configured, documents are kept in memory"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open document store: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting audit collaboration server...");
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
