//! Relay identity and endpoint parsing.
//!
//! A relay is identified by the five values the embedding caller passes to
//! start/stop. The identity is only a key; it is parsed into concrete
//! endpoints when the relay starts.

use std::fmt;
use std::net::Ipv6Addr;
#[cfg(unix)]
use std::path::PathBuf;

use crate::error::{RelayError, Result};

/// Default bind host when the caller gives only a port.
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Registry key for one forwarding rule.
///
/// Two identities are equal iff all five fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayIdentity {
    remote: String,
    host: String,
    path: String,
    tls: bool,
    insecure: bool,
}

impl RelayIdentity {
    pub fn new(
        remote: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        tls: bool,
        insecure: bool,
    ) -> Self {
        Self {
            remote: remote.into(),
            host: host.into(),
            path: path.into(),
            tls,
            insecure,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Insecure mode only has an effect when TLS is enabled.
    pub fn insecure(&self) -> bool {
        self.tls && self.insecure
    }

    /// Parse the forwarding target.
    pub fn remote_endpoint(&self) -> Result<RemoteEndpoint> {
        RemoteEndpoint::parse(&self.remote)
    }

    /// Parse the local bind point from `host` and `path`.
    pub fn listen_endpoint(&self) -> Result<ListenEndpoint> {
        ListenEndpoint::parse(&self.host, &self.path)
    }

    /// Parse both endpoints, failing with `InvalidIdentity` on the first error.
    pub fn validate(&self) -> Result<(ListenEndpoint, RemoteEndpoint)> {
        Ok((self.listen_endpoint()?, self.remote_endpoint()?))
    }
}

impl fmt::Display for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (tls={}, insecure={})",
            if self.path.is_empty() {
                self.host.clone()
            } else {
                format!("{}/{}", self.host, self.path)
            },
            self.remote,
            self.tls,
            self.insecure
        )
    }
}

/// Outbound target: a host name or IP literal plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    host: String,
    port: u16,
}

impl RemoteEndpoint {
    /// Parse `host:port`, `ip:port` or `[ipv6]:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        if port == 0 {
            return Err(RelayError::InvalidIdentity(format!(
                "remote port must be non-zero: {s}"
            )));
        }
        Ok(Self { host, port })
    }

    /// Host part, without brackets. Used as the TLS server name.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Target suitable for `TcpStream::connect` / `lookup_host`.
    pub fn target(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_host_port(f, &self.host, self.port)
    }
}

/// Local bind point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenEndpoint {
    /// TCP (and optionally UDP) on `host:port`. Port 0 binds an ephemeral port.
    Inet { host: String, port: u16 },
    /// Unix domain stream socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenEndpoint {
    /// Resolve `host`/`path` into a bind point.
    ///
    /// - numeric `path`: `host:path` (empty host means loopback)
    /// - absolute `path` (unix only): unix domain socket at that path
    /// - empty `path`: `host` must itself be `addr:port`
    /// - empty `host` and `path`: ephemeral port on loopback
    pub fn parse(host: &str, path: &str) -> Result<Self> {
        let host = host.trim();
        let path = path.trim();

        if path.is_empty() {
            if host.is_empty() {
                return Ok(ListenEndpoint::Inet {
                    host: DEFAULT_LISTEN_HOST.to_string(),
                    port: 0,
                });
            }
            let (host, port) = split_host_port(host)?;
            return Ok(ListenEndpoint::Inet { host, port });
        }

        if path.starts_with('/') {
            return Self::unix(path);
        }

        let port = path.parse::<u16>().map_err(|_| {
            RelayError::InvalidIdentity(format!(
                "path must be a port number or an absolute socket path: {path}"
            ))
        })?;

        let host = strip_brackets(host);
        let host = if host.is_empty() {
            DEFAULT_LISTEN_HOST.to_string()
        } else {
            validate_host(host)?;
            host.to_string()
        };

        Ok(ListenEndpoint::Inet { host, port })
    }

    #[cfg(unix)]
    fn unix(path: &str) -> Result<Self> {
        Ok(ListenEndpoint::Unix(PathBuf::from(path)))
    }

    #[cfg(not(unix))]
    fn unix(path: &str) -> Result<Self> {
        Err(RelayError::InvalidIdentity(format!(
            "unix socket endpoints are not supported on this platform: {path}"
        )))
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Inet { host, port } => fmt_host_port(f, host, *port),
            #[cfg(unix)]
            ListenEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn split_host_port(s: &str) -> Result<(String, u16)> {
    let s = s.trim();
    let invalid = |why: &str| RelayError::InvalidIdentity(format!("{why}: {s:?}"));

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        host.parse::<Ipv6Addr>()
            .map_err(|_| invalid("invalid IPv6 literal"))?;
        (host, port)
    } else {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 literals must be bracketed"));
        }
        validate_host(host)?;
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(RelayError::InvalidIdentity("empty host".to_string()));
    }
    if host.contains(':') && host.parse::<Ipv6Addr>().is_err() {
        return Err(RelayError::InvalidIdentity(format!("invalid host: {host:?}")));
    }
    if host
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '[' || c == ']')
    {
        return Err(RelayError::InvalidIdentity(format!("invalid host: {host:?}")));
    }
    Ok(())
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn fmt_host_port(f: &mut fmt::Formatter<'_>, host: &str, port: u16) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{host}]:{port}")
    } else {
        write!(f, "{host}:{port}")
    }
}
