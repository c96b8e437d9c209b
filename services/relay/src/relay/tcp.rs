//! TCP acceptance loop and connection pipeline.
//!
//! Per connection: connect (bounded) -> TLS handshake (if enabled) ->
//! PROXY header (if enabled) -> bidirectional copy. A failure at any stage
//! closes that connection only.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use realm_proxy_protocol::{ProxyHeader, Transport};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{ConnectionHandle, TransportKind};
use super::transport::{self, LocalListener, LocalStream, PeerAddr, RemoteStream};
use super::{tls, wait_stopping, RelayContext, RelayState};
use crate::error::{RelayError, Result};

/// Run the acceptance loop until the relay starts stopping, then drain.
pub(crate) async fn run(
    listener: LocalListener,
    ctx: Arc<RelayContext>,
    mut state: watch::Receiver<RelayState>,
) {
    let semaphore = Arc::new(Semaphore::new(ctx.options.max_connections));
    let mut tasks = JoinSet::new();

    info!(listen = %listener.describe(), "Listener started");

    loop {
        tokio::select! {
            _ = wait_stopping(&mut state) => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr, local_addr)) => {
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            ctx.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    ctx.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let handle = ctx
                        .connections
                        .register(TransportKind::Tcp, peer_addr, local_addr)
                        .await;
                    let span = tracing::info_span!("connection", id = handle.id(), peer = %peer_addr);
                    let ctx = ctx.clone();
                    let shutdown = state.clone();

                    tasks.spawn(
                        async move {
                            handle_connection(&ctx, stream, &handle, shutdown).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    listener.close();
    debug!("Listener closed");

    ctx.drain(&mut tasks, TransportKind::Tcp).await;
}

/// Forward one connection and tear it down.
///
/// The handle leaves the connection table before either stream is
/// released.
async fn handle_connection(
    ctx: &RelayContext,
    mut inbound: LocalStream,
    handle: &ConnectionHandle,
    shutdown: watch::Receiver<RelayState>,
) {
    let mut outbound = None;

    match forward(ctx, &mut inbound, &mut outbound, handle, shutdown).await {
        Ok(()) => debug!(
            bytes_up = handle.bytes_up.load(Ordering::Relaxed),
            bytes_down = handle.bytes_down.load(Ordering::Relaxed),
            duration = ?handle.age(),
            "Connection closed"
        ),
        Err(e) => {
            ctx.stats.record_failure(&e);
            match &e {
                RelayError::Io(_) => debug!(reason = e.reason_code(), error = %e, "Connection error"),
                _ => warn!(reason = e.reason_code(), error = %e, "Connection failed"),
            }
        }
    }

    ctx.finish(handle).await;
    drop(outbound);
    drop(inbound);
}

async fn forward(
    ctx: &RelayContext,
    inbound: &mut LocalStream,
    outbound: &mut Option<RemoteStream>,
    handle: &ConnectionHandle,
    shutdown: watch::Receiver<RelayState>,
) -> Result<()> {
    let policy = &ctx.options.policy;

    // Encode first so an unrepresentable peer never costs an outbound connect.
    let header = if ctx.options.proxy_protocol {
        Some(proxy_header(handle, ctx)?)
    } else {
        None
    };

    if let Err(e) = inbound.set_keepalive(policy) {
        debug!(error = %e, "Failed to set keepalive on inbound stream");
    }

    let stream = transport::connect(&ctx.remote, policy).await?;
    if let Err(e) = transport::set_keepalive(&stream, policy) {
        debug!(error = %e, "Failed to set keepalive on outbound stream");
    }
    if let Ok(addr) = stream.peer_addr() {
        handle.set_remote_addr(addr);
    }

    let remote = match &ctx.tls {
        Some(client) => {
            let stream = client.handshake(stream, policy.connect_timeout).await?;
            if let Some(version) = tls::protocol_version(&stream) {
                handle.set_tls_version(version);
            }
            RemoteStream::Tls(Box::new(stream))
        }
        None => RemoteStream::Plain(stream),
    };

    debug!(
        remote = %ctx.remote,
        remote_addr = ?handle.remote_addr(),
        tls = remote.is_tls(),
        "Connected to remote"
    );

    let remote = outbound.insert(remote);

    if let Some(header) = header {
        transport::write_proxy_header(remote, &header, policy.proxy_header_timeout).await?;
        debug!(family = %header.family(), "Sent PROXY v2 header");
    }

    transport::copy_bidirectional(
        &mut *inbound,
        remote,
        handle,
        shutdown,
        policy.keepalive_budget(),
    )
    .await?;

    Ok(())
}

fn proxy_header(handle: &ConnectionHandle, ctx: &RelayContext) -> Result<ProxyHeader> {
    let (PeerAddr::Inet(src), PeerAddr::Inet(dst)) = (handle.peer_addr(), handle.local_addr())
    else {
        return Err(realm_proxy_protocol::EncodeError::UnsupportedFamily("unix".to_string()).into());
    };

    Ok(ProxyHeader::new(
        src,
        dst,
        Transport::Stream,
        ctx.options.proxy_family,
    )?)
}
