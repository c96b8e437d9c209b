//! Timeout policy.
//!
//! Fixed constants for every blocking point in the forwarding pipeline.
//! `TimeoutPolicy` carries them as `Duration`s so tests can shrink them.

use std::time::Duration;

/// Outbound TCP connect timeout, seconds.
pub const TCP_TIMEOUT: u64 = 5;

/// TCP keepalive probe interval, seconds.
pub const TCP_KEEPALIVE: u64 = 15;

/// Missed keepalive probes before a connection is considered dead.
pub const TCP_KEEPALIVE_PROBE: u32 = 3;

/// UDP session idle timeout, seconds.
pub const UDP_TIMEOUT: u64 = 30;

/// PROXY protocol version emitted on the outbound leg.
pub const PROXY_PROTOCOL_VERSION: u8 = 2;

/// Bound on writing the PROXY protocol header, seconds.
pub const PROXY_PROTOCOL_TIMEOUT: u64 = 5;

/// Default grace period for draining connections on stop.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Timeouts applied by a relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Outbound connect (and TLS handshake) bound.
    pub connect_timeout: Duration,
    /// Keepalive idle time and probe interval.
    pub keepalive_interval: Duration,
    /// Keepalive probe count.
    pub keepalive_probes: u32,
    /// Idle time after which a UDP session is torn down.
    pub udp_idle_timeout: Duration,
    /// Bound on the PROXY header write.
    pub proxy_header_timeout: Duration,
    /// How long stop() waits for in-flight connections before force-closing.
    pub drain_grace: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(TCP_TIMEOUT),
            keepalive_interval: Duration::from_secs(TCP_KEEPALIVE),
            keepalive_probes: TCP_KEEPALIVE_PROBE,
            udp_idle_timeout: Duration::from_secs(UDP_TIMEOUT),
            proxy_header_timeout: Duration::from_secs(PROXY_PROTOCOL_TIMEOUT),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl TimeoutPolicy {
    /// Total time a silent peer survives keepalive probing.
    pub fn keepalive_budget(&self) -> Duration {
        self.keepalive_interval * (self.keepalive_probes + 1)
    }

    /// How often idle UDP sessions are swept.
    pub fn udp_sweep_interval(&self) -> Duration {
        (self.udp_idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}
