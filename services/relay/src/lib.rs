//! realm relay
//!
//! Forwards a local TCP (and UDP) endpoint to one remote endpoint:
//! - optional TLS on the outbound leg, with SNI set to the remote host
//! - optional PROXY protocol v2 header carrying the original client address
//! - bounded connect, TCP keepalive, UDP session idle expiry
//!
//! Relays are keyed by their identity (remote, host, path, tls, insecure)
//! in a `RelayRegistry`; `start_realm` / `stop_realm` wrap the process-wide
//! registry for synchronous callers.

pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod relay;

pub use config::RelayConfig;
pub use control::{start_realm, stop_all_realms, stop_realm};
pub use error::{RelayError, Result};
pub use identity::{ListenEndpoint, RelayIdentity, RemoteEndpoint};
pub use policy::TimeoutPolicy;
pub use registry::RelayRegistry;
pub use relay::{RelayInstance, RelayOptions, RelayState, RelayStats};

/// Crate version, reported by the binary and the C ABI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
