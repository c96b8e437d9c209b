//! Error types for the relay.

use std::io;
use std::time::Duration;

use realm_proxy_protocol::EncodeError;
use thiserror::Error;

/// Result alias used throughout the relay.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Relay errors with standardized reason codes.
///
/// `InvalidIdentity` and `Bind` are returned from start; everything else is
/// local to one connection or session and never stops the owning relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Remote, host or path could not be parsed.
    #[error("invalid relay identity: {0}")]
    InvalidIdentity(String),

    /// The local endpoint could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The outbound connect did not complete in time.
    #[error("connect to {remote} timed out after {timeout:?}")]
    ConnectTimeout { remote: String, timeout: Duration },

    /// The outbound connect failed.
    #[error("connect to {remote} failed: {source}")]
    Connect {
        remote: String,
        #[source]
        source: io::Error,
    },

    /// TLS configuration, handshake or certificate failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The PROXY header could not be encoded or written.
    #[error("proxy header error: {0}")]
    ProxyHeader(String),

    /// Mid-stream I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The process-wide runtime could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::InvalidIdentity(_) => "invalid_identity",
            RelayError::Bind { .. } => "bind_error",
            RelayError::ConnectTimeout { .. } => "connect_timeout",
            RelayError::Connect { .. } => "connect_error",
            RelayError::Tls(_) => "tls_error",
            RelayError::ProxyHeader(_) => "proxy_header_error",
            RelayError::Io(_) => "io_error",
            RelayError::Runtime(_) => "runtime_error",
        }
    }
}

impl From<EncodeError> for RelayError {
    fn from(err: EncodeError) -> Self {
        RelayError::ProxyHeader(err.to_string())
    }
}

impl From<rustls::Error> for RelayError {
    fn from(err: rustls::Error) -> Self {
        RelayError::Tls(err.to_string())
    }
}
