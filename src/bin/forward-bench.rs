//! forward-bench: load generator for forward protocol collectors
//!
//! Usage: forward-bench [OPTIONS] <TAG> <COUNT>
//!
//! Sends COUNT records tagged TAG, split into batches of --multi records
//! over --concurrent connections.

use clap::Parser;
use forward_relay::bench::{self, BenchArgs};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = BenchArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let params = match args.into_params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("forward-bench: {e}");
            return ExitCode::from(255);
        }
    };

    match bench::run(params).await {
        Ok(report) => {
            info!(
                records = report.records,
                batches = report.batches,
                elapsed_ms = report.elapsed.as_millis() as u64,
                rate = format!("{:.0}/s", report.rate()),
                finished_at = %chrono::Utc::now().to_rfc3339(),
                "Load generation complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Load generation failed");
            ExitCode::FAILURE
        }
    }
}
