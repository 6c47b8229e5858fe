//! Trustless Gateway Server
//!
//! Loads configuration, sets up logging, and serves the gateway over HTTP/1.1.

use anyhow::{anyhow, Context};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use trustless_gateway::{Gateway, GatewayConfig, GatewayServer};

/// Default configuration file, used when no path is given
const DEFAULT_CONFIG_PATH: &str = "trustless_gateway.yaml";

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (trustless_gateway.yaml)
/// trustless-gateway
///
/// # Start with custom config
/// trustless-gateway /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = GatewayConfig::from_file(&config_path)
        .map_err(|e| anyhow!("Failed to load configuration from {}: {}", config_path, e))?;

    tracing_subscriber::fmt()
        .with_max_level(log_level(&config.log_level))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Trustless Gateway");
    info!("Configuration loaded from: {}", config_path);
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Offline: {}", config.offline);
    info!("  - Upstream gateways: {:?}", config.upstream_gateways);
    info!("  - Store timeout: {} ms", config.store_timeout_ms);
    info!("  - Max outstanding fetches: {}", config.max_outstanding_fetches);
    info!("  - Static names: {}", config.static_names.len());
    info!("  - Metrics enabled: {}", config.metrics_enabled);

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_address))?;

    let gateway = Gateway::builder(config)
        .build()
        .map_err(|e| anyhow!("Failed to build gateway: {}", e))?;

    if let Err(e) = GatewayServer::new(Arc::new(gateway), addr).start().await {
        error!("Server stopped: {}", e);
        return Err(anyhow!("server error: {}", e));
    }
    Ok(())
}

fn log_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
