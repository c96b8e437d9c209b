//! Blocking control surface.
//!
//! `start_realm` / `stop_realm` drive the process-wide registry from
//! synchronous callers (the C ABI, embedders without a runtime). Relays run
//! on one shared multi-thread runtime created on first use.

use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};
use tracing::warn;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::identity::RelayIdentity;
use crate::registry::RelayRegistry;

/// Worker threads for the shared runtime.
const RUNTIME_WORKER_THREADS: usize = 2;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static REGISTRY: OnceLock<RelayRegistry> = OnceLock::new();

/// The shared runtime, created on first call.
pub fn runtime() -> Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RUNTIME_WORKER_THREADS)
        .thread_name("realm-relay")
        .enable_all()
        .build()
        .map_err(|e| RelayError::Runtime(format!("failed to create runtime: {e}")))?;

    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The process-wide registry. Options come from the environment on first
/// use; bad configuration falls back to defaults.
pub fn registry() -> &'static RelayRegistry {
    REGISTRY.get_or_init(|| {
        let options = RelayConfig::from_env().and_then(|config| config.relay_options());
        match options {
            Ok(options) => RelayRegistry::new(options),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Invalid relay configuration, using defaults");
                RelayRegistry::default()
            }
        }
    })
}

/// Start (or reuse) the relay for this identity. Returns the bound local
/// endpoint.
pub fn start_realm(
    remote: &str,
    host: &str,
    path: &str,
    tls: bool,
    insecure: bool,
) -> Result<String> {
    let identity = RelayIdentity::new(remote, host, path, tls, insecure);
    block_on(registry().start(identity))?
}

/// Stop the relay for this identity. A no-op if none is running.
pub fn stop_realm(remote: &str, host: &str, path: &str, tls: bool, insecure: bool) -> Result<()> {
    let identity = RelayIdentity::new(remote, host, path, tls, insecure);
    block_on(registry().stop(&identity))
}

/// Stop every relay started through this surface.
pub fn stop_all_realms() -> Result<()> {
    block_on(registry().stop_all())
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    if Handle::try_current().is_ok() {
        return Err(RelayError::Runtime(
            "blocking control call made from inside an async runtime; use RelayRegistry instead"
                .to_string(),
        ));
    }
    Ok(runtime()?.block_on(future))
}
