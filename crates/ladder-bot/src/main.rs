//! Ladder bot entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Laddered entry trading bot for derivatives exchanges.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LADDER_CONFIG)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any WS connections.
    ladder_ws::init_crypto();

    let args = Args::parse();
    ladder_bot::init_logging();

    info!("Starting ladder-bot v{}", env!("CARGO_PKG_VERSION"));

    let config = ladder_bot::AppConfig::load(args.config.as_deref())?;
    info!(symbol = %config.symbol, side = %config.side, "Configuration loaded");

    let app = ladder_bot::App::new(config)?.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    app.stop().await;
    Ok(())
}
