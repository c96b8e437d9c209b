//! Active connection tracking.
//!
//! Every accepted TCP connection and every live UDP session owns one
//! `ConnectionHandle`, registered in its relay's `ConnectionTable` for as
//! long as the connection lives. The table is mutated only by the owning
//! acceptance loop and by connection teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::transport::PeerAddr;

/// Transport a connection was accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// One live forwarded connection or UDP session.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    kind: TransportKind,
    peer_addr: PeerAddr,
    local_addr: PeerAddr,
    remote_addr: OnceLock<std::net::SocketAddr>,
    tls_version: OnceLock<String>,
    created_at: Instant,
    /// Millis since `created_at` of the last forwarded datagram or chunk.
    last_activity: AtomicU64,
    /// Bytes forwarded client to remote.
    pub bytes_up: AtomicU64,
    /// Bytes forwarded remote to client.
    pub bytes_down: AtomicU64,
}

impl ConnectionHandle {
    fn new(id: u64, kind: TransportKind, peer_addr: PeerAddr, local_addr: PeerAddr) -> Self {
        Self {
            id,
            kind,
            peer_addr,
            local_addr,
            remote_addr: OnceLock::new(),
            tls_version: OnceLock::new(),
            created_at: Instant::now(),
            last_activity: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Client side of the connection.
    pub fn peer_addr(&self) -> PeerAddr {
        self.peer_addr
    }

    /// Address the client connected to.
    pub fn local_addr(&self) -> PeerAddr {
        self.local_addr
    }

    /// Resolved remote address, once connected.
    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.remote_addr.get().copied()
    }

    pub fn set_remote_addr(&self, addr: std::net::SocketAddr) {
        let _ = self.remote_addr.set(addr);
    }

    /// Negotiated TLS version, if the outbound leg is TLS.
    pub fn tls_version(&self) -> Option<&str> {
        self.tls_version.get().map(String::as_str)
    }

    pub fn set_tls_version(&self, version: String) {
        let _ = self.tls_version.set(version);
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark the connection as active now.
    pub fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Count forwarded bytes on one direction and mark activity.
    pub fn record(&self, counter: &AtomicU64, bytes: usize) {
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            kind: self.kind,
            peer_addr: self.peer_addr,
            remote_addr: self.remote_addr(),
            tls_version: self.tls_version().map(str::to_string),
            age: self.age(),
            idle: self.idle_for(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub kind: TransportKind,
    pub peer_addr: PeerAddr,
    pub remote_addr: Option<std::net::SocketAddr>,
    pub tls_version: Option<String>,
    pub age: Duration,
    pub idle: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Set of a relay's live connections.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    connections: RwLock<HashMap<u64, Arc<ConnectionHandle>>>,
}

impl ConnectionTable {
    /// Register a new connection and return its handle.
    pub async fn register(
        &self,
        kind: TransportKind,
        peer_addr: PeerAddr,
        local_addr: PeerAddr,
    ) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ConnectionHandle::new(id, kind, peer_addr, local_addr));
        self.connections.write().await.insert(id, handle.clone());
        handle
    }

    /// Remove a connection. Returns false if it was already gone.
    pub async fn remove(&self, id: u64) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Remove every connection of one transport, returning their handles.
    pub async fn remove_kind(&self, kind: TransportKind) -> Vec<Arc<ConnectionHandle>> {
        let mut connections = self.connections.write().await;
        let ids: Vec<u64> = connections
            .values()
            .filter(|handle| handle.kind == kind)
            .map(|handle| handle.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| connections.remove(&id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().await;
        let mut infos: Vec<_> = connections.values().map(|h| h.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
