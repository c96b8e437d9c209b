//! Relay instances.
//!
//! A relay instance owns one local endpoint and forwards everything it
//! accepts there to one remote endpoint:
//! - TCP (or unix socket) connections, optionally over TLS, optionally
//!   prefixed with a PROXY v2 header
//! - UDP datagrams on the same port, as per-client sessions
//!
//! Lifecycle: Starting -> Running -> Stopping -> Stopped. The state lives in
//! a watch channel that every loop and connection subscribes to as its
//! shutdown signal; transitions only move forward.

mod connection;
mod tcp;
mod tls;
mod transport;
mod udp;

pub use connection::{ConnectionHandle, ConnectionInfo, ConnectionTable, TransportKind};
pub use tls::TlsClient;
pub use transport::{
    connect, connect_with_timeout, copy_bidirectional, set_keepalive, write_proxy_header,
    LocalListener, LocalStream, PeerAddr, RemoteStream,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use realm_proxy_protocol::FamilyPolicy;
use rustls::pki_types::CertificateDer;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn, Instrument};

use crate::error::{RelayError, Result};
use crate::identity::{RelayIdentity, RemoteEndpoint};
use crate::policy::TimeoutPolicy;

/// Default maximum concurrent TCP connections per relay.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Behaviour shared by every relay a registry starts.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Prefix outbound TCP streams with a PROXY v2 header.
    pub proxy_protocol: bool,
    /// Also prefix each outbound UDP datagram with a header.
    pub proxy_protocol_udp: bool,
    /// Address family used in PROXY headers.
    pub proxy_family: FamilyPolicy,
    /// Forward UDP on the listen port (never for TLS relays).
    pub udp: bool,
    pub policy: TimeoutPolicy,
    /// Maximum concurrent TCP connections.
    pub max_connections: usize,
    /// Extra trust anchors for TLS remotes.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            proxy_protocol: false,
            proxy_protocol_udp: false,
            proxy_family: FamilyPolicy::Auto,
            udp: true,
            policy: TimeoutPolicy::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            extra_roots: Vec::new(),
        }
    }
}

impl RelayOptions {
    /// Trust every certificate in a PEM bundle. Returns how many were added.
    pub fn add_ca_pem(&mut self, pem: &[u8]) -> Result<usize> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RelayError::Tls(format!("invalid CA bundle: {e}")))?;

        if certs.is_empty() {
            return Err(RelayError::Tls("no certificates in CA bundle".to_string()));
        }

        let added = certs.len();
        self.extra_roots.extend(certs);
        Ok(added)
    }
}

/// Lifecycle state of a relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelayState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Starting => write!(f, "starting"),
            RelayState::Running => write!(f, "running"),
            RelayState::Stopping => write!(f, "stopping"),
            RelayState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Resolve once the relay has started stopping (or its state is gone).
pub(crate) async fn wait_stopping(state: &mut watch::Receiver<RelayState>) {
    let _ = state.wait_for(|s| *s >= RelayState::Stopping).await;
}

/// Statistics for a relay instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total TCP connections accepted.
    pub connections_accepted: AtomicU64,
    /// TCP connections currently active.
    pub connections_active: AtomicU64,
    /// Total TCP connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections closed by the drain deadline.
    pub connections_forced: AtomicU64,
    /// Outbound connects that failed or timed out.
    pub connect_failed: AtomicU64,
    /// TLS handshakes that failed.
    pub tls_failed: AtomicU64,
    /// PROXY headers that could not be encoded or written.
    pub proxy_header_failed: AtomicU64,
    /// Bytes forwarded to the remote.
    pub bytes_to_remote: AtomicU64,
    /// Bytes forwarded back to clients.
    pub bytes_from_remote: AtomicU64,
    /// UDP sessions created.
    pub udp_sessions_created: AtomicU64,
    /// UDP sessions torn down for inactivity.
    pub udp_sessions_expired: AtomicU64,
    /// Datagrams dropped because a session queue was full.
    pub udp_datagrams_dropped: AtomicU64,
}

impl RelayStats {
    /// Count a per-connection failure under its reason.
    pub(crate) fn record_failure(&self, err: &RelayError) {
        let counter = match err {
            RelayError::Connect { .. } | RelayError::ConnectTimeout { .. } => &self.connect_failed,
            RelayError::Tls(_) => &self.tls_failed,
            RelayError::ProxyHeader(_) => &self.proxy_header_failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished connection's counters into the totals.
    pub(crate) fn record_closed(&self, handle: &ConnectionHandle) {
        self.bytes_to_remote
            .fetch_add(handle.bytes_up.load(Ordering::Relaxed), Ordering::Relaxed);
        self.bytes_from_remote
            .fetch_add(handle.bytes_down.load(Ordering::Relaxed), Ordering::Relaxed);

        if handle.kind() == TransportKind::Tcp {
            self.connections_active.fetch_sub(1, Ordering::Relaxed);
            self.connections_closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// State shared by a relay's loops and connections.
pub(crate) struct RelayContext {
    pub identity: RelayIdentity,
    pub remote: RemoteEndpoint,
    pub tls: Option<TlsClient>,
    pub options: RelayOptions,
    pub connections: ConnectionTable,
    pub stats: RelayStats,
}

impl RelayContext {
    /// Take a finished connection out of the table and count it closed.
    /// Returns false if the drain already force-closed it.
    pub(crate) async fn finish(&self, handle: &ConnectionHandle) -> bool {
        if !self.connections.remove(handle.id()).await {
            return false;
        }
        self.stats.record_closed(handle);
        true
    }

    /// Wait up to the drain grace for `tasks`, then force-close the rest.
    pub(crate) async fn drain<T: 'static>(&self, tasks: &mut JoinSet<T>, kind: TransportKind) {
        if tasks.is_empty() {
            return;
        }

        let grace = self.options.policy.drain_grace;
        let pending = tasks.len();
        info!(transport = %kind, pending, grace = ?grace, "Draining connections");

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            // Aborted tasks never reach `finish`; count them here.
            let forced = self.connections.remove_kind(kind).await;
            for handle in &forced {
                self.stats.record_closed(handle);
            }
            self.stats
                .connections_forced
                .fetch_add(forced.len() as u64, Ordering::Relaxed);
            warn!(
                transport = %kind,
                forced = forced.len(),
                "Drain grace period elapsed, force-closing connections"
            );
            tasks.shutdown().await;
        }
    }
}

/// One running relay: a bound listener forwarding to one remote.
pub struct RelayInstance {
    context: Arc<RelayContext>,
    status: String,
    local_addr: Option<SocketAddr>,
    state: watch::Sender<RelayState>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayInstance {
    /// Bind the identity's local endpoint and start forwarding.
    ///
    /// Returns once the listener is bound and the acceptance loops are
    /// running; the instance is then `Running`. Identity and bind failures
    /// leave nothing behind.
    pub async fn start(identity: RelayIdentity, options: RelayOptions) -> Result<Arc<Self>> {
        let (listen, remote) = identity.validate()?;

        let tls = if identity.tls() {
            Some(TlsClient::new(&remote, identity.insecure(), &options.extra_roots)?)
        } else {
            None
        };

        let listener = LocalListener::bind(&listen).await?;
        let status = listener.describe();
        let local_addr = listener.local_addr();

        // UDP shares the TCP port; TLS relays have no datagram transport.
        let udp_socket = match local_addr {
            Some(addr) if options.udp && tls.is_none() => {
                let socket = UdpSocket::bind(addr).await.map_err(|source| RelayError::Bind {
                    endpoint: format!("udp://{addr}"),
                    source,
                })?;
                Some(Arc::new(socket))
            }
            _ => None,
        };

        let (state, _) = watch::channel(RelayState::Starting);
        let context = Arc::new(RelayContext {
            identity: identity.clone(),
            remote,
            tls,
            options,
            connections: ConnectionTable::default(),
            stats: RelayStats::default(),
        });

        let span = tracing::info_span!(
            "relay",
            listen = %status,
            remote = identity.remote(),
            tls = identity.tls(),
        );

        let mut loops = Vec::with_capacity(2);
        loops.push(tokio::spawn(
            tcp::run(listener, context.clone(), state.subscribe()).instrument(span.clone()),
        ));
        if let Some(socket) = udp_socket {
            loops.push(tokio::spawn(
                udp::run(socket, context.clone(), state.subscribe()).instrument(span.clone()),
            ));
        }

        state.send_replace(RelayState::Running);
        span.in_scope(|| info!(udp = loops.len() > 1, "Relay started"));

        Ok(Arc::new(Self {
            context,
            status,
            local_addr,
            state,
            loops: Mutex::new(loops),
        }))
    }

    pub fn identity(&self) -> &RelayIdentity {
        &self.context.identity
    }

    /// Bound local endpoint, as returned from start.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Bound socket address, for inet endpoints.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.context.stats
    }

    /// Live connections and UDP sessions.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.context.connections.snapshot().await
    }

    /// Stop accepting, drain in-flight connections up to the grace period,
    /// then close everything. Idempotent.
    pub async fn stop(&self) {
        if !self.advance(RelayState::Stopping) {
            // Another caller is stopping; wait for it to finish.
            let mut state = self.subscribe();
            let _ = state.wait_for(|s| *s == RelayState::Stopped).await;
            return;
        }

        info!(relay = %self.context.identity, "Stopping relay");

        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Relay loop ended abnormally");
            }
        }

        self.advance(RelayState::Stopped);
        info!(relay = %self.context.identity, "Relay stopped");
    }

    /// Move the state forward. Returns false if it was already at or past
    /// `next`.
    fn advance(&self, next: RelayState) -> bool {
        self.state.send_if_modified(|current| {
            if *current < next {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

impl Drop for RelayInstance {
    fn drop(&mut self) {
        // Dropping without stop still signals the loops to wind down.
        self.advance(RelayState::Stopping);
    }
}
