//! forward-relay: a forward protocol log collector
//!
//! Accepts connections from log forwarders and decodes:
//! - Message frames (one entry)
//! - Forward frames (inline batch)
//! - PackedForward frames (binary-packed batch)
//!
//! Features:
//! - Decoded entries written as JSON lines, logged, or discarded
//! - Entry and connection counters, logged periodically
//! - Configuration via CLI arguments or TOML file

use forward_relay::config::Config;
use forward_relay::metrics::{self, Scoreboard};
use forward_relay::{sink, ForwardServer, ProtocolServer};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for entry output
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        address = %config.bind_address(),
        output = ?config.output,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        "Starting forward-relay"
    );

    let server = Arc::new(ForwardServer::bind(&config, sink::from_kind(config.output))?);

    let mut board = Scoreboard::new();
    server.register_metrics(&mut board);
    let board = Arc::new(board);

    if config.metrics_interval > 0 {
        tokio::spawn(metrics::report_task(
            Arc::clone(&board),
            config.metrics_interval,
        ));
    }

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown requested");
        if let Err(e) = stopper.shutdown() {
            error!(error = %e, "Shutdown failed");
        }
    });

    let result = server.serve().await;
    board.log_snapshot();
    result?;
    Ok(())
}
