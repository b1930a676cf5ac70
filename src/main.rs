//! # courier
//!
//! Real-time dispatch gateway binary. Loads configuration, connects the
//! broker, and serves until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// How long shutdown waits for in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Real-time dispatch gateway.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Real-time dispatch gateway")]
struct Cli {
    /// JSON config file. Missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Broker URL, e.g. redis://localhost:6379. Omit to run standalone.
    #[arg(long)]
    redis_url: Option<String>,

    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = courier_server::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(url) = cli.redis_url {
        config.broker.redis_url = Some(url);
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    let log_level = parse_level(&config.log_level)
        .with_context(|| format!("Unknown log level `{}`", config.log_level))?;
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        json: !cli.pretty,
        ..Default::default()
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting courier");

    let brokers = courier_broker::connect(&config.broker).await;
    let resolver = courier_server::resolver_from_config(&config.auth);
    let handle = courier_server::start(&config, brokers, resolver, telemetry.metrics())
        .await
        .context("Failed to start server")?;

    tracing::info!(host = %config.server.host, port = handle.port, "Courier ready");

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl+c")?;
    tracing::info!("Interrupt received");
    handle.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
