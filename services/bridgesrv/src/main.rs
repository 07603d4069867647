//! PLC bridge service entry point.

use anyhow::Context;
use bridge_config::BridgeConfig;
use bridgesrv::BridgeEngine;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bridgesrv", about = "PLC bridge engine over Modbus RTU")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "bridge.toml")]
    config: String,

    /// Log filter, e.g. "info" or "bridgesrv=debug"
    #[arg(long, default_value = "info")]
    log: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let config = BridgeConfig::load(&args.config)
        .with_context(|| format!("Loading configuration from {}", args.config))?;

    if args.validate {
        info!("Configuration {} is valid", args.config);
        return Ok(());
    }

    info!(
        "Starting bridge for slave {} on {}",
        config.modbus.device_address, config.serial.port
    );
    let handle = BridgeEngine::start(config)
        .await
        .context("Starting bridge engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal")?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    Ok(())
}
