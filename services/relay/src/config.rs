//! Relay configuration.
//!
//! Environment-driven. Everything here shapes relay behaviour that the
//! five identity values do not carry: PROXY protocol, UDP, drain grace and
//! extra trust anchors.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use realm_proxy_protocol::FamilyPolicy;

use crate::identity::RelayIdentity;
use crate::policy::{TimeoutPolicy, DEFAULT_DRAIN_GRACE};
use crate::relay::RelayOptions;

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON logs instead of compact text.
    pub log_json: bool,

    /// Send a PROXY v2 header on each forwarded TCP connection.
    pub proxy_protocol: bool,

    /// Prefix each forwarded UDP datagram with a PROXY v2 header.
    pub proxy_protocol_udp: bool,

    /// Address family negotiation for PROXY headers.
    pub proxy_family: FamilyPolicy,

    /// Also relay UDP on the same local port.
    pub udp: bool,

    /// Grace period for draining connections on stop.
    pub drain_grace: Duration,

    /// Extra PEM trust anchors for the outbound TLS leg.
    pub tls_ca_file: Option<PathBuf>,

    /// Relay started by the `realm` binary, if configured.
    pub relay: Option<RelayIdentity>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            proxy_protocol: false,
            proxy_protocol_udp: false,
            proxy_family: FamilyPolicy::Auto,
            udp: true,
            drain_grace: DEFAULT_DRAIN_GRACE,
            tls_ca_file: None,
            relay: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let log_level = lookup("REALM_LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_json = flag(&lookup, "REALM_LOG_JSON").unwrap_or(defaults.log_json);
        let proxy_protocol =
            flag(&lookup, "REALM_PROXY_PROTOCOL").unwrap_or(defaults.proxy_protocol);
        let proxy_protocol_udp =
            flag(&lookup, "REALM_PROXY_PROTOCOL_UDP").unwrap_or(defaults.proxy_protocol_udp);
        let udp = flag(&lookup, "REALM_UDP").unwrap_or(defaults.udp);

        let proxy_family = lookup("REALM_PROXY_FAMILY")
            .map(|v| v.parse::<FamilyPolicy>())
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("REALM_PROXY_FAMILY must be one of auto, ipv4, ipv6.")?
            .unwrap_or(defaults.proxy_family);

        let drain_grace = lookup("REALM_DRAIN_GRACE_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("REALM_DRAIN_GRACE_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_grace);

        let tls_ca_file = lookup("REALM_TLS_CA_FILE").map(PathBuf::from);

        let relay = match lookup("REALM_REMOTE") {
            Some(remote) => Some(RelayIdentity::new(
                remote,
                lookup("REALM_HOST").unwrap_or_default(),
                lookup("REALM_PATH").unwrap_or_default(),
                flag(&lookup, "REALM_TLS").unwrap_or(false),
                flag(&lookup, "REALM_INSECURE").unwrap_or(false),
            )),
            None => None,
        };

        Ok(Self {
            log_level,
            log_json,
            proxy_protocol,
            proxy_protocol_udp,
            proxy_family,
            udp,
            drain_grace,
            tls_ca_file,
            relay,
        })
    }

    /// Per-relay options derived from this configuration.
    ///
    /// Reads the CA file, if one is configured.
    pub fn relay_options(&self) -> Result<RelayOptions> {
        let mut options = RelayOptions {
            proxy_protocol: self.proxy_protocol,
            proxy_protocol_udp: self.proxy_protocol_udp,
            proxy_family: self.proxy_family,
            udp: self.udp,
            policy: TimeoutPolicy {
                drain_grace: self.drain_grace,
                ..TimeoutPolicy::default()
            },
            ..RelayOptions::default()
        };

        if let Some(path) = &self.tls_ca_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read REALM_TLS_CA_FILE {}", path.display()))?;
            options
                .add_ca_pem(&pem)
                .with_context(|| format!("invalid PEM in {}", path.display()))?;
        }

        Ok(options)
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}
