use std::sync::atomic::Ordering;
use std::time::Duration;

use realm_proxy_protocol::{AddressFamily, Transport};
use realm_relay::{RelayIdentity, RelayInstance, RelayOptions, RelayRegistry, RelayState};
use realm_testing::{free_port, ProxyV2Backend, StalledBackend, TcpEchoBackend, TlsEchoBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn relay_to(remote: impl Into<String>, tls: bool, insecure: bool) -> RelayIdentity {
    RelayIdentity::new(remote, "127.0.0.1:0", "", tls, insecure)
}

async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    stream.flush().await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn plain_relay_preserves_byte_order() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let registry = RelayRegistry::default();
    let identity = relay_to(backend.addr.to_string(), false, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let mut client = TcpStream::connect(&status).await.unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, &payload))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
    assert_eq!(backend.connection_count(), 1);

    let instance = registry.get(&identity).await.unwrap();
    let connections = instance.connections().await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].remote_addr, Some(backend.addr));

    drop(client);
    registry.stop(&identity).await;
}

#[tokio::test]
async fn proxy_header_precedes_payload_exactly_once() {
    let backend = ProxyV2Backend::spawn().await.unwrap();
    let registry = RelayRegistry::new(RelayOptions {
        proxy_protocol: true,
        ..RelayOptions::default()
    });
    let identity = relay_to(backend.addr.to_string(), false, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let mut client = TcpStream::connect(&status).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"hello");

    // Anything after the first read is echoed raw; a second header would
    // come back here.
    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"again");

    let captured = backend.wait_for(1, TEST_TIMEOUT).await;
    assert_eq!(captured.len(), 1);
    let header = captured[0].header.clone().expect("PROXY v2 header");
    assert_eq!(header.transport(), Transport::Stream);
    assert_eq!(header.family(), AddressFamily::Inet);
    assert_eq!(header.src_addr(), client.local_addr().unwrap());
    assert_eq!(header.dst_addr(), client.peer_addr().unwrap());
    assert_eq!(captured[0].first_payload, b"hello");

    drop(client);
    registry.stop(&identity).await;
}

#[tokio::test]
async fn proxy_header_travels_inside_tls_session() {
    let backend = ProxyV2Backend::spawn_tls("localhost").await.unwrap();
    let mut options = RelayOptions {
        proxy_protocol: true,
        ..RelayOptions::default()
    };
    let cert_pem = backend.cert_pem.clone().unwrap();
    options.add_ca_pem(cert_pem.as_bytes()).unwrap();
    let registry = RelayRegistry::new(options);
    let identity = relay_to(format!("localhost:{}", backend.addr.port()), true, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let mut client = TcpStream::connect(&status).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"hello");

    // The backend only finds a header after its TLS accept succeeded.
    let captured = backend.wait_for(1, TEST_TIMEOUT).await;
    assert_eq!(captured.len(), 1);
    let header = captured[0].header.clone().expect("PROXY v2 header inside TLS");
    assert_eq!(header.transport(), Transport::Stream);
    assert_eq!(header.src_addr(), client.local_addr().unwrap());
    assert_eq!(header.dst_addr(), client.peer_addr().unwrap());
    assert_eq!(captured[0].first_payload, b"hello");

    drop(client);
    registry.stop(&identity).await;
}

#[tokio::test]
async fn tls_relay_trusts_configured_root() {
    let backend = TlsEchoBackend::spawn("localhost").await.unwrap();
    let mut options = RelayOptions::default();
    options.add_ca_pem(backend.cert_pem.as_bytes()).unwrap();
    let registry = RelayRegistry::new(options);
    let identity = relay_to(format!("localhost:{}", backend.addr.port()), true, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let mut client = TcpStream::connect(&status).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"over tls"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"over tls");
    assert_eq!(backend.handshake_count(), 1);

    let instance = registry.get(&identity).await.unwrap();
    let connections = instance.connections().await;
    assert!(connections[0].tls_version.is_some());

    drop(client);
    registry.stop(&identity).await;
}

#[tokio::test]
async fn untrusted_certificate_fails_connection_not_relay() {
    let backend = TlsEchoBackend::spawn("localhost").await.unwrap();
    let registry = RelayRegistry::default();
    let identity = relay_to(format!("localhost:{}", backend.addr.port()), true, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let instance = registry.get(&identity).await.unwrap();

    for _ in 0..2 {
        let mut client = TcpStream::connect(&status).await.unwrap();
        let _ = client.write_all(b"secret").await;
        let mut buf = [0u8; 16];
        let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "no payload may come back");
    }

    assert!(
        wait_until(TEST_TIMEOUT, || instance.stats().tls_failed.load(Ordering::Relaxed) == 2)
            .await
    );
    assert_eq!(instance.state(), RelayState::Running);
    assert_eq!(backend.handshake_count(), 0);

    registry.stop(&identity).await;
}

#[tokio::test]
async fn insecure_relay_accepts_self_signed_certificate() {
    let backend = TlsEchoBackend::spawn("localhost").await.unwrap();
    let registry = RelayRegistry::default();
    let identity = relay_to(format!("localhost:{}", backend.addr.port()), true, true);

    let status = registry.start(identity.clone()).await.unwrap();
    let mut client = TcpStream::connect(&status).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"insecure"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"insecure");

    drop(client);
    registry.stop(&identity).await;
}

#[tokio::test]
async fn refused_remote_closes_inbound_without_payload() {
    let dead_port = free_port().await.unwrap();
    let registry = RelayRegistry::default();
    let identity = relay_to(format!("127.0.0.1:{dead_port}"), false, false);

    let status = registry.start(identity.clone()).await.unwrap();
    let instance = registry.get(&identity).await.unwrap();

    let mut client = TcpStream::connect(&status).await.unwrap();
    let _ = client.write_all(b"anyone there").await;
    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(
        wait_until(TEST_TIMEOUT, || instance.stats().connect_failed.load(Ordering::Relaxed) == 1)
            .await
    );
    assert_eq!(instance.state(), RelayState::Running);

    registry.stop(&identity).await;
}

#[tokio::test]
async fn stop_closes_listener_and_live_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut options = RelayOptions::default();
    options.policy.drain_grace = Duration::from_millis(500);
    let instance = RelayInstance::start(relay_to(backend.addr.to_string(), false, false), options)
        .await
        .unwrap();
    let addr = instance.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let echoed = timeout(TEST_TIMEOUT, roundtrip(&mut client, b"before stop"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"before stop");

    timeout(TEST_TIMEOUT, instance.stop()).await.unwrap();
    assert_eq!(instance.state(), RelayState::Stopped);
    assert!(instance.connections().await.is_empty());

    let mut buf = [0u8; 8];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_force_closes_connections_past_drain_grace() {
    let backend = StalledBackend::spawn().await.unwrap();
    let mut options = RelayOptions::default();
    options.policy.drain_grace = Duration::from_millis(300);
    let instance = RelayInstance::start(relay_to(backend.addr.to_string(), false, false), options)
        .await
        .unwrap();

    let client = TcpStream::connect(instance.local_addr().unwrap()).await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5a_u8; 64 * 1024];
        while writer.write_all(&chunk).await.is_ok() {}
    });

    // Let the relay fill the backend's receive buffer and block writing.
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        let connections = instance.connections().await;
        if connections.first().is_some_and(|c| c.bytes_up > 0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.connection_count(), 1);

    let started = Instant::now();
    timeout(TEST_TIMEOUT, instance.stop()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(instance.state(), RelayState::Stopped);

    let stats = instance.stats();
    assert!(stats.connections_forced.load(Ordering::Relaxed) >= 1);
    assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    assert_eq!(stats.connections_closed.load(Ordering::Relaxed), 1);
    assert!(stats.bytes_to_remote.load(Ordering::Relaxed) > 0);
    assert!(instance.connections().await.is_empty());

    let mut buf = [0u8; 8];
    let read = timeout(TEST_TIMEOUT, reader.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    flood.abort();
}

/// A listener with a full accept queue. Linux drops further SYNs, so new
/// connects hang instead of being refused.
#[cfg(target_os = "linux")]
async fn saturated_listener() -> (tokio::net::TcpListener, Vec<TcpStream>) {
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) = timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
            queued.push(stream);
        }
    }
    (listener, queued)
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn connect_timeout_closes_inbound_without_payload() {
    let (remote, _queued) = saturated_listener().await;
    let mut options = RelayOptions::default();
    options.policy.connect_timeout = Duration::from_millis(200);
    let instance = RelayInstance::start(
        relay_to(remote.local_addr().unwrap().to_string(), false, false),
        options,
    )
    .await
    .unwrap();

    let started = Instant::now();
    let mut client = TcpStream::connect(instance.local_addr().unwrap()).await.unwrap();
    let _ = client.write_all(b"never forwarded").await;

    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)), "no payload may come back");
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert!(
        wait_until(TEST_TIMEOUT, || instance.stats().connect_failed.load(Ordering::Relaxed) == 1)
            .await
    );
    assert_eq!(instance.stats().bytes_to_remote.load(Ordering::Relaxed), 0);
    assert_eq!(instance.state(), RelayState::Running);

    instance.stop().await;
}

#[tokio::test]
async fn bind_conflict_is_reported_and_not_registered() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let registry = RelayRegistry::default();
    let identity = RelayIdentity::new("127.0.0.1:9", "127.0.0.1", port.to_string(), false, false);

    let err = registry.start(identity.clone()).await.unwrap_err();
    assert_eq!(err.reason_code(), "bind_error");
    assert!(!registry.contains(&identity));
    assert!(registry.is_empty());
}
