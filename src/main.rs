//! shard-echo: a thread-per-core TCP echo server
//!
//! Every byte a client sends is written back unchanged until the client
//! closes its send side.
//!
//! Features:
//! - One shard per CPU core, each with its own listener on the shared port
//! - Share-nothing shards: a connection stays on the shard that accepted it
//! - Optional drain on shutdown and CPU pinning
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::Config;
use runtime::Coordinator;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for the ready banner
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        port = config.port,
        shards = config.shards,
        shutdown = ?config.shutdown,
        on_accept_error = ?config.on_accept_error,
        pin_shards = config.pin_shards,
        "Starting shard-echo server"
    );

    let mut coordinator = Coordinator::new(config.clone());
    let port = coordinator.start(config.port)?;
    println!("TCP echo server listen on: {port}");

    wait_for_shutdown()?;

    coordinator.stop()?;
    info!(states = ?coordinator.shard_states(), "Server stopped");
    Ok(())
}

/// Block until Ctrl-C.
fn wait_for_shutdown() -> std::io::Result<()> {
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;
    info!("Shutdown signal received");
    Ok(())
}
