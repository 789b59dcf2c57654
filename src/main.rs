//! ack-server: a readiness-driven TCP acknowledgment server
//!
//! Features:
//! - Single reactor thread for accept and readiness multiplexing
//! - Fixed worker pool for all connection I/O
//! - One acknowledgment per received chunk
//! - Configuration via CLI arguments or TOML file

use ack_server::config::Config;
use ack_server::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count(),
        max_connections = config.max_connections,
        "Starting ack-server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
