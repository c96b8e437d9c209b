//! Transport layer.
//!
//! A closed set of stream variants behind one `AsyncRead + AsyncWrite`
//! surface, picked once at connection setup:
//! - `LocalStream`: what a client opened to us (TCP or unix socket)
//! - `RemoteStream`: what we opened to the remote (plain or TLS over TCP)
//!
//! Plus the bounded connect, keepalive setup, PROXY header write and the
//! bidirectional copy shared by every TCP connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::task::{Context, Poll};
use std::time::Duration;

use realm_proxy_protocol::ProxyHeader;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::connection::ConnectionHandle;
use super::{wait_stopping, RelayState};
use crate::error::{RelayError, Result};
use crate::identity::{ListenEndpoint, RemoteEndpoint};
use crate::policy::TimeoutPolicy;

/// Copy buffer size per direction.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Address of one end of a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Unix socket peer (usually unnamed).
    Unix,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Inet(addr) => Some(*addr),
            PeerAddr::Unix => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => write!(f, "unix"),
        }
    }
}

/// Listening socket owned by a relay instance.
pub enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl LocalListener {
    /// Bind the local endpoint, failing with `Bind`.
    pub async fn bind(endpoint: &ListenEndpoint) -> Result<Self> {
        let bind_error = |source| RelayError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            ListenEndpoint::Inet { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(bind_error)?;
                Ok(LocalListener::Tcp(listener))
            }
            #[cfg(unix)]
            ListenEndpoint::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                Ok(LocalListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Bound socket address, for inet listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            LocalListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            LocalListener::Unix { .. } => None,
        }
    }

    /// Human-readable bound address returned to the caller of start.
    pub fn describe(&self) -> String {
        match self {
            LocalListener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            #[cfg(unix)]
            LocalListener::Unix { path, .. } => path.display().to_string(),
        }
    }

    /// Accept one inbound stream.
    ///
    /// Returns the stream, the client address and the address the client
    /// connected to.
    pub async fn accept(&self) -> io::Result<(LocalStream, PeerAddr, PeerAddr)> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                let local_addr = stream.local_addr()?;
                Ok((
                    LocalStream::Tcp(stream),
                    PeerAddr::Inet(peer_addr),
                    PeerAddr::Inet(local_addr),
                ))
            }
            #[cfg(unix)]
            LocalListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((LocalStream::Unix(stream), PeerAddr::Unix, PeerAddr::Unix))
            }
        }
    }

    /// Close the listener and remove any socket file it created.
    pub fn close(self) {
        match self {
            LocalListener::Tcp(listener) => drop(listener),
            #[cfg(unix)]
            LocalListener::Unix { listener, path } => {
                drop(listener);
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }
}

/// Inbound stream accepted from a client.
pub enum LocalStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl LocalStream {
    /// Enable keepalive on TCP streams; no-op for unix sockets.
    pub fn set_keepalive(&self, policy: &TimeoutPolicy) -> io::Result<()> {
        match self {
            LocalStream::Tcp(stream) => set_keepalive(stream, policy),
            #[cfg(unix)]
            LocalStream::Unix(_) => Ok(()),
        }
    }
}

/// Outbound stream to the remote endpoint.
pub enum RemoteStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl RemoteStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, RemoteStream::Tls(_))
    }
}

macro_rules! delegate_async_io {
    ($ty:ty { $($variant:pat => $inner:ident),+ $(,)? }) => {
        impl AsyncRead for $ty {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($variant => Pin::new($inner).poll_read(cx, buf),)+
                }
            }
        }

        impl AsyncWrite for $ty {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                match self.get_mut() {
                    $($variant => Pin::new($inner).poll_write(cx, buf),)+
                }
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($variant => Pin::new($inner).poll_flush(cx),)+
                }
            }

            fn poll_shutdown(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($variant => Pin::new($inner).poll_shutdown(cx),)+
                }
            }
        }
    };
}

#[cfg(unix)]
delegate_async_io!(LocalStream {
    LocalStream::Tcp(s) => s,
    LocalStream::Unix(s) => s,
});

#[cfg(not(unix))]
delegate_async_io!(LocalStream {
    LocalStream::Tcp(s) => s,
});

delegate_async_io!(RemoteStream {
    RemoteStream::Plain(s) => s,
    RemoteStream::Tls(s) => s,
});

/// Connect to the remote within the policy's connect timeout.
pub async fn connect(remote: &RemoteEndpoint, policy: &TimeoutPolicy) -> Result<TcpStream> {
    connect_with_timeout(remote, policy.connect_timeout, TcpStream::connect(remote.target())).await
}

/// Bound an arbitrary connect future, mapping failures to relay errors.
pub async fn connect_with_timeout<F, S>(
    remote: &RemoteEndpoint,
    connect_timeout: Duration,
    connect: F,
) -> Result<S>
where
    F: std::future::Future<Output = io::Result<S>>,
{
    match timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RelayError::Connect {
            remote: remote.to_string(),
            source,
        }),
        Err(_) => Err(RelayError::ConnectTimeout {
            remote: remote.to_string(),
            timeout: connect_timeout,
        }),
    }
}

/// Enable TCP keepalive: first probe after one interval, then every
/// interval, dead after the configured probe count.
pub fn set_keepalive(stream: &TcpStream, policy: &TimeoutPolicy) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(policy.keepalive_interval);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
    ))]
    let keepalive = keepalive
        .with_interval(policy.keepalive_interval)
        .with_retries(policy.keepalive_probes);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Write a PROXY v2 header, fully, before any payload.
///
/// A timeout or short write is a `ProxyHeader` error; the caller must
/// abort the connection.
pub async fn write_proxy_header<W>(
    writer: &mut W,
    header: &ProxyHeader,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = header.encode();
    let write = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    };

    match timeout(write_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::ProxyHeader(format!("header write failed: {e}"))),
        Err(_) => Err(RelayError::ProxyHeader(format!(
            "header write timed out after {write_timeout:?}"
        ))),
    }
}

/// Relay bytes between the two legs until one side finishes.
///
/// When one direction reaches end-of-stream its peer's write side is shut
/// down and the other direction gets `linger` to finish before both legs
/// are closed. An error in either direction ends the copy immediately.
/// When the relay starts stopping, each direction writes out the chunk it
/// already read and then closes.
pub async fn copy_bidirectional<A, B>(
    inbound: A,
    outbound: B,
    handle: &ConnectionHandle,
    shutdown: watch::Receiver<RelayState>,
    linger: Duration,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);

    let upstream = pump(in_read, out_write, handle, &handle.bytes_up, shutdown.clone());
    let downstream = pump(out_read, in_write, handle, &handle.bytes_down, shutdown);
    tokio::pin!(upstream, downstream);

    let remaining = tokio::select! {
        result = &mut upstream => {
            result?;
            debug!("Client finished sending");
            timeout(linger, &mut downstream).await
        }
        result = &mut downstream => {
            result?;
            debug!("Remote finished sending");
            timeout(linger, &mut upstream).await
        }
    };

    match remaining {
        Ok(result) => result,
        Err(_) => {
            debug!(linger = ?linger, "Half-closed connection lingered too long");
            Ok(())
        }
    }
}

/// Copy one direction, then shut down the writer.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    handle: &ConnectionHandle,
    counter: &AtomicU64,
    mut shutdown: watch::Receiver<RelayState>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = wait_stopping(&mut shutdown) => break,
            read = reader.read(&mut buf) => read?,
        };

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        handle.record(counter, n);
    }

    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::ConnectionTable;
    use crate::relay::connection::TransportKind;
    use std::sync::atomic::Ordering;

    fn remote() -> RemoteEndpoint {
        RemoteEndpoint::parse("203.0.113.1:8443").unwrap()
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let err = connect_with_timeout(
            &remote(),
            Duration::from_millis(20),
            std::future::pending::<io::Result<TcpStream>>(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.reason_code(), "connect_timeout");
    }

    #[tokio::test]
    async fn test_connect_error() {
        let err = connect_with_timeout(&remote(), Duration::from_secs(1), async {
            Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await
        .unwrap_err();

        assert_eq!(err.reason_code(), "connect_error");
    }

    #[tokio::test]
    async fn test_write_proxy_header_writes_whole_header() {
        let header = ProxyHeader::stream(
            "192.0.2.7:5000".parse().unwrap(),
            "192.0.2.1:9443".parse().unwrap(),
        )
        .unwrap();

        let mut out = Vec::new();
        write_proxy_header(&mut out, &header, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, header.encode());
    }

    #[tokio::test]
    async fn test_write_proxy_header_write_error() {
        let header = ProxyHeader::stream(
            "192.0.2.7:5000".parse().unwrap(),
            "192.0.2.1:9443".parse().unwrap(),
        )
        .unwrap();

        let mut broken = tokio_test::io::Builder::new()
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let err = write_proxy_header(&mut broken, &header, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "proxy_header_error");
    }

    #[tokio::test]
    async fn test_write_proxy_header_times_out() {
        let header = ProxyHeader::stream(
            "192.0.2.7:5000".parse().unwrap(),
            "192.0.2.1:9443".parse().unwrap(),
        )
        .unwrap();

        // A 4-byte pipe with nobody reading cannot take a 28-byte header.
        let (mut writer, _reader) = tokio::io::duplex(4);
        let err = write_proxy_header(&mut writer, &header, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "proxy_header_error");
    }

    #[tokio::test]
    async fn test_copy_bidirectional_relays_both_ways() {
        let table = ConnectionTable::default();
        let handle = table
            .register(
                TransportKind::Tcp,
                PeerAddr::Inet("127.0.0.1:1".parse().unwrap()),
                PeerAddr::Inet("127.0.0.1:2".parse().unwrap()),
            )
            .await;
        let (_state_tx, state_rx) = watch::channel(RelayState::Running);

        let (relay_in, mut client) = tokio::io::duplex(1024);
        let (relay_out, mut server) = tokio::io::duplex(1024);

        let copy = tokio::spawn({
            let handle = handle.clone();
            async move {
                copy_bidirectional(relay_in, relay_out, &handle, state_rx, Duration::from_secs(1))
                    .await
            }
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        // Remote sees EOF once the client leg closes.
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);

        copy.await.unwrap().unwrap();
        assert_eq!(handle.bytes_up.load(Ordering::Relaxed), 4);
        assert_eq!(handle.bytes_down.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_copy_bidirectional_stops_on_shutdown() {
        let table = ConnectionTable::default();
        let handle = table
            .register(
                TransportKind::Tcp,
                PeerAddr::Unix,
                PeerAddr::Unix,
            )
            .await;
        let (state_tx, state_rx) = watch::channel(RelayState::Running);

        let (relay_in, _client) = tokio::io::duplex(1024);
        let (relay_out, _server) = tokio::io::duplex(1024);

        let copy = tokio::spawn({
            let handle = handle.clone();
            async move {
                copy_bidirectional(relay_in, relay_out, &handle, state_rx, Duration::from_secs(5))
                    .await
            }
        });

        state_tx.send_replace(RelayState::Stopping);
        tokio::time::timeout(Duration::from_secs(1), copy)
            .await
            .expect("copy should end promptly on shutdown")
            .unwrap()
            .unwrap();
    }
}
