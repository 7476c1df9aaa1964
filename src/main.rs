//! packet-gate: a multi-threaded TCP server core
//!
//! Serves length-prefixed binary packets:
//! - 8-byte header with length, message code and CRC-32 of the body
//! - Single readiness event loop plus worker, sender, recycle and heartbeat threads
//! - Connection pool with epoch-tagged slots and delayed recycling
//! - Bounded outbound queue, flood guard and heartbeat eviction
//! - Configuration via CLI arguments or TOML file

mod config;
mod logic;
mod runtime;

use config::Config;
use tracing::info;
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
        ports = ?config.listen_ports,
        worker_connections = config.worker_connections,
        worker_threads = config.worker_threads,
        heartbeat = config.heartbeat_enabled,
        flood_guard = config.flood_enabled,
        "Starting packet-gate server"
    );

    runtime::run(config, logic::dispatcher())?;
    Ok(())
}
