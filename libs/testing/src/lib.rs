//! Test harness for relay integration tests.
//!
//! Spawns loopback backends that a relay can forward to:
//! - plain TCP echo
//! - TLS echo with a freshly generated self-signed certificate
//! - PROXY v2 capture (decodes the header, then echoes), plain or TLS
//! - a stalled backend that never reads
//! - UDP echo
//!
//! Every backend stops when dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use realm_proxy_protocol::{decode, ProxyHeader, FIXED_HEADER_LEN};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{oneshot, RwLock};
use tokio_rustls::TlsAcceptor;

/// Loopback address backends bind to.
pub const LOOPBACK: &str = "127.0.0.1:0";

async fn echo<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = stream.shutdown().await;
}

/// Plain TCP echo backend.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind(LOOPBACK).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(echo(stream));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS acceptor with a fresh self-signed certificate for `server_name`.
/// Returns the acceptor and the certificate as PEM.
fn self_signed_acceptor(server_name: &str) -> io::Result<(TlsAcceptor, String)> {
    let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
        .map_err(io::Error::other)?;

    let cert_pem = cert.cert.pem();
    let certs = vec![CertificateDer::from(cert.cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;

    Ok((TlsAcceptor::from(Arc::new(config)), cert_pem))
}

/// TLS echo backend with a self-signed certificate for `server_name`.
pub struct TlsEchoBackend {
    pub addr: SocketAddr,
    pub cert_pem: String,
    pub connections: Arc<AtomicU64>,
    pub handshakes: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsEchoBackend {
    pub async fn spawn(server_name: &str) -> io::Result<Self> {
        let (acceptor, cert_pem) = self_signed_acceptor(server_name)?;
        let listener = TcpListener::bind(LOOPBACK).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let handshakes = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let hs_clone = Arc::clone(&handshakes);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let handshakes = Arc::clone(&hs_clone);
                                tokio::spawn(async move {
                                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                                        handshakes.fetch_add(1, Ordering::Relaxed);
                                        echo(tls_stream).await;
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_pem,
            connections,
            handshakes,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }
}

impl Drop for TlsEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// One connection as seen by `ProxyV2Backend`.
#[derive(Debug, Clone)]
pub struct CapturedConnection {
    /// Decoded header, if the stream started with one.
    pub header: Option<ProxyHeader>,
    /// Raw bytes of the first read after the header.
    pub first_payload: Vec<u8>,
}

/// Backend that decodes a leading PROXY v2 header, then echoes.
///
/// The TLS variant looks for the header in the decrypted stream.
pub struct ProxyV2Backend {
    pub addr: SocketAddr,
    /// Certificate of the TLS variant.
    pub cert_pem: Option<String>,
    pub captured: Arc<RwLock<Vec<CapturedConnection>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyV2Backend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(None).await
    }

    /// Terminate TLS with a self-signed certificate for `server_name`
    /// before reading the header.
    pub async fn spawn_tls(server_name: &str) -> io::Result<Self> {
        let (acceptor, cert_pem) = self_signed_acceptor(server_name)?;
        let mut backend = Self::spawn_with(Some(acceptor)).await?;
        backend.cert_pem = Some(cert_pem);
        Ok(backend)
    }

    async fn spawn_with(acceptor: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = TcpListener::bind(LOOPBACK).await?;
        let addr = listener.local_addr()?;
        let captured = Arc::new(RwLock::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let captured_clone = Arc::clone(&captured);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let store = Arc::clone(&captured_clone);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    match acceptor {
                                        Some(acceptor) => {
                                            if let Ok(tls_stream) = acceptor.accept(stream).await {
                                                capture(tls_stream, store).await;
                                            }
                                        }
                                        None => capture(stream, store).await,
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_pem: None,
            captured,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub async fn captured(&self) -> Vec<CapturedConnection> {
        self.captured.read().await.clone()
    }

    /// Wait until at least `count` connections were captured.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<CapturedConnection> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let captured = self.captured().await;
            if captured.len() >= count || tokio::time::Instant::now() >= deadline {
                return captured;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Record the header and first payload of one connection, then echo.
async fn capture<S>(mut stream: S, store: Arc<RwLock<Vec<CapturedConnection>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = match read_proxy_header(&mut stream).await {
        Ok(header) => header,
        Err(_) => return,
    };

    let mut payload = vec![0u8; 8192];
    let n = match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut payload)).await {
        Ok(Ok(n)) => n,
        _ => 0,
    };
    payload.truncate(n);

    store.write().await.push(CapturedConnection {
        header,
        first_payload: payload.clone(),
    });

    if stream.write_all(&payload).await.is_ok() {
        echo(stream).await;
    }
}

impl Drop for ProxyV2Backend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Read a PROXY v2 header off the front of a stream.
///
/// Returns `None` when the stream does not start with the signature; those
/// bytes are lost, which is fine for a capture backend.
async fn read_proxy_header<S>(stream: &mut S) -> io::Result<Option<ProxyHeader>>
where
    S: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut fixed))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

    let addr_len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;
    let mut data = fixed.to_vec();
    data.resize(FIXED_HEADER_LEN + addr_len, 0);
    stream.read_exact(&mut data[FIXED_HEADER_LEN..]).await?;

    Ok(decode(&data).ok().map(|(header, _)| header))
}

/// TCP backend that accepts connections and never reads from them, so a
/// client that keeps writing eventually blocks.
pub struct StalledBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StalledBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind(LOOPBACK).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                held.push(stream);
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for StalledBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// UDP echo backend. Records every datagram it receives.
pub struct UdpEchoBackend {
    pub addr: SocketAddr,
    pub received: Arc<RwLock<Vec<(SocketAddr, Vec<u8>)>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UdpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let socket = UdpSocket::bind(LOOPBACK).await?;
        let addr = socket.local_addr()?;
        let received = Arc::new(RwLock::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    recv_result = socket.recv_from(&mut buf) => {
                        match recv_result {
                            Ok((n, from)) => {
                                received_clone.write().await.push((from, buf[..n].to_vec()));
                                let _ = socket.send_to(&buf[..n], from).await;
                            }
                            Err(_) => continue,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub async fn datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.received.read().await.clone()
    }

    /// Distinct source addresses seen, in first-seen order.
    pub async fn sources(&self) -> Vec<SocketAddr> {
        let mut sources: Vec<SocketAddr> = Vec::new();
        for (from, _) in self.received.read().await.iter() {
            if !sources.contains(from) {
                sources.push(*from);
            }
        }
        sources
    }
}

impl Drop for UdpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A free loopback TCP port (bound then released).
pub async fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(LOOPBACK).await?;
    Ok(listener.local_addr()?.port())
}
