//! Chat gateway - Entry Point
//!
//! Loads configuration, opens the SQLite store, and runs the gateway until
//! Ctrl-C.

use std::env;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_gateway::config::LoggingConfig;
use chat_gateway::{Config, Gateway, SqliteChatStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config file path from command line, defaults otherwise
    let config = match env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    }
    .with_env_overrides()?;
    config.validate()?;

    init_logging(&config.logging);

    let store = SqliteChatStore::open(&config.storage.database_path)?;
    info!("Opened chat store at {}", config.storage.database_path.display());

    let listener = TcpListener::bind(&config.server.addr).await?;
    info!("Chat gateway listening on {}", config.server.addr);

    let gateway = Arc::new(Gateway::new(&config, Arc::new(store)));

    // Ctrl-C triggers an orderly shutdown
    let signal_gateway = Arc::clone(&gateway);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_gateway.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    gateway.serve(listener).await;

    info!("Chat gateway stopped");
    Ok(())
}

/// Initialize logging with environment filter
///
/// RUST_LOG takes precedence over the configured level,
/// e.g. RUST_LOG=debug or RUST_LOG=chat_gateway=trace
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chat_gateway={}", logging.level)));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
