use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use realm_relay::{start_realm, stop_realm};

/// Blocking echo backend on its own thread.
fn spawn_echo() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn blocking_start_and_stop() {
    let backend = spawn_echo().to_string();

    let status = start_realm(&backend, "127.0.0.1:0", "", false, false).unwrap();
    let again = start_realm(&backend, "127.0.0.1:0", "", false, false).unwrap();
    assert_eq!(status, again);

    let mut client = TcpStream::connect(&status).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"sync").unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"sync");
    drop(client);

    stop_realm(&backend, "127.0.0.1:0", "", false, false).unwrap();
    assert!(TcpStream::connect(&status).is_err());

    // Stopping again, or something never started, is fine.
    stop_realm(&backend, "127.0.0.1:0", "", false, false).unwrap();
    stop_realm("127.0.0.1:1", "", "", false, false).unwrap();
}

#[test]
fn blocking_start_reports_invalid_identity() {
    let err = start_realm("missing-port", "", "", false, false).unwrap_err();
    assert_eq!(err.reason_code(), "invalid_identity");
}
