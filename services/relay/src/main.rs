//! realm
//!
//! Runs one relay configured from the environment until interrupted.
//!
//! REALM_REMOTE is required; see `RelayConfig` for the rest.

use anyhow::{Context, Result};
use tracing::info;

use realm_relay::{logging, RelayConfig, RelayRegistry, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env()?;
    logging::init(&config.log_level, config.log_json);

    info!(version = VERSION, "Starting realm relay");

    let identity = config
        .relay
        .clone()
        .context("Missing relay configuration. Set REALM_REMOTE (and optionally REALM_HOST, REALM_PATH).")?;

    info!(
        remote = identity.remote(),
        host = identity.host(),
        path = identity.path(),
        tls = identity.tls(),
        insecure = identity.insecure(),
        proxy_protocol = config.proxy_protocol,
        udp = config.udp,
        "Configuration loaded"
    );

    let registry = RelayRegistry::new(config.relay_options()?);
    let status = registry
        .start(identity.clone())
        .await
        .with_context(|| format!("failed to start relay {identity}"))?;

    info!(listen = %status, "Relay running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    registry.stop_all().await;
    info!("Relay stopped");

    Ok(())
}
