//! UDP forwarding.
//!
//! Each client address gets a session: an outbound socket connected to the
//! remote plus a task that shuttles datagrams both ways. Sessions expire
//! after the idle timeout; the next datagram from that client starts a new
//! one. The session map is owned by the receive loop alone.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use realm_proxy_protocol::{ProxyHeader, Transport};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, AbortHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use super::connection::{ConnectionHandle, TransportKind};
use super::transport::{connect_with_timeout, PeerAddr};
use super::{wait_stopping, RelayContext, RelayState};
use crate::error::{RelayError, Result};
use crate::identity::RemoteEndpoint;
use crate::policy::TimeoutPolicy;

/// Largest datagram we forward.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Datagrams queued per session before new ones are dropped.
const SESSION_QUEUE_DEPTH: usize = 64;

struct Session {
    tx: mpsc::Sender<Bytes>,
    handle: Arc<ConnectionHandle>,
    task: AbortHandle,
}

/// Run the UDP receive loop until the relay starts stopping.
pub(crate) async fn run(
    socket: Arc<UdpSocket>,
    ctx: Arc<RelayContext>,
    mut state: watch::Receiver<RelayState>,
) {
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "UDP socket has no local address, not forwarding UDP");
            return;
        }
    };

    let idle_timeout = ctx.options.policy.udp_idle_timeout;
    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut sweep = interval(ctx.options.policy.udp_sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    info!(listen = %local_addr, idle_timeout = ?idle_timeout, "UDP listener started");

    loop {
        tokio::select! {
            _ = wait_stopping(&mut state) => break,
            _ = sweep.tick() => {
                let idle: Vec<SocketAddr> = sessions
                    .iter()
                    .filter(|(_, s)| s.handle.idle_for() >= idle_timeout)
                    .map(|(client, _)| *client)
                    .collect();

                for client in idle {
                    if let Some(session) = sessions.remove(&client) {
                        close_session(&ctx, session).await;
                        ctx.stats.udp_sessions_expired.fetch_add(1, Ordering::Relaxed);
                        debug!(client = %client, "UDP session expired");
                    }
                }
            }
            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                let id = match joined {
                    Ok((id, ())) => id,
                    Err(e) => e.id(),
                };
                reap(&ctx, &mut sessions, id).await;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, client)) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    dispatch(&ctx, &socket, &mut sessions, &mut tasks, &state, client, local_addr, payload).await;
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms.
                    debug!(error = %e, "UDP receive error");
                }
            }
        }
    }

    for (_, session) in sessions.drain() {
        ctx.finish(&session.handle).await;
    }

    ctx.drain(&mut tasks, TransportKind::Udp).await;
    debug!("UDP listener closed");
}

/// Hand a datagram to its client's session, creating one if needed.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    ctx: &Arc<RelayContext>,
    socket: &Arc<UdpSocket>,
    sessions: &mut HashMap<SocketAddr, Session>,
    tasks: &mut JoinSet<()>,
    state: &watch::Receiver<RelayState>,
    client: SocketAddr,
    local_addr: SocketAddr,
    payload: Bytes,
) {
    if !sessions.contains_key(&client) {
        let session = open_session(ctx, socket, tasks, state, client, local_addr).await;
        sessions.insert(client, session);
    }

    let Some(session) = sessions.get(&client) else {
        return;
    };
    session.handle.touch();

    let payload = match session.tx.try_send(payload) {
        Ok(()) => return,
        Err(TrySendError::Full(_)) => {
            ctx.stats.udp_datagrams_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(client = %client, "UDP session queue full, dropping datagram");
            return;
        }
        Err(TrySendError::Closed(payload)) => payload,
    };

    // The session task ended before it was reaped; start over with this
    // datagram.
    if let Some(stale) = sessions.remove(&client) {
        close_session(ctx, stale).await;
    }
    let session = open_session(ctx, socket, tasks, state, client, local_addr).await;
    session.handle.touch();
    if session.tx.try_send(payload).is_err() {
        ctx.stats.udp_datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }
    sessions.insert(client, session);
}

async fn open_session(
    ctx: &Arc<RelayContext>,
    socket: &Arc<UdpSocket>,
    tasks: &mut JoinSet<()>,
    state: &watch::Receiver<RelayState>,
    client: SocketAddr,
    local_addr: SocketAddr,
) -> Session {
    let handle = ctx
        .connections
        .register(TransportKind::Udp, PeerAddr::Inet(client), PeerAddr::Inet(local_addr))
        .await;
    let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    ctx.stats.udp_sessions_created.fetch_add(1, Ordering::Relaxed);
    debug!(client = %client, id = handle.id(), "UDP session created");

    let span = tracing::info_span!("udp_session", id = handle.id(), client = %client);
    let task = tasks.spawn(
        run_session(
            ctx.clone(),
            socket.clone(),
            client,
            local_addr,
            rx,
            handle.clone(),
            state.clone(),
        )
        .instrument(span),
    );

    Session { tx, handle, task }
}

/// Remove a session from the connection table, then kill its task.
async fn close_session(ctx: &RelayContext, session: Session) {
    ctx.finish(&session.handle).await;
    session.task.abort();
}

/// Forget the session whose task just ended.
async fn reap(ctx: &RelayContext, sessions: &mut HashMap<SocketAddr, Session>, id: task::Id) {
    let client = sessions
        .iter()
        .find(|(_, s)| s.task.id() == id)
        .map(|(client, _)| *client);

    if let Some(session) = client.and_then(|client| sessions.remove(&client)) {
        ctx.finish(&session.handle).await;
    }
}

async fn run_session(
    ctx: Arc<RelayContext>,
    listen: Arc<UdpSocket>,
    client: SocketAddr,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    handle: Arc<ConnectionHandle>,
    state: watch::Receiver<RelayState>,
) {
    if let Err(e) = session_loop(&ctx, &listen, client, local_addr, rx, &handle, state).await {
        ctx.stats.record_failure(&e);
        debug!(reason = e.reason_code(), error = %e, "UDP session failed");
    }
}

async fn session_loop(
    ctx: &RelayContext,
    listen: &UdpSocket,
    client: SocketAddr,
    local_addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    handle: &ConnectionHandle,
    mut state: watch::Receiver<RelayState>,
) -> Result<()> {
    let header = if ctx.options.proxy_protocol && ctx.options.proxy_protocol_udp {
        Some(
            ProxyHeader::new(client, local_addr, Transport::Datagram, ctx.options.proxy_family)?
                .encode(),
        )
    } else {
        None
    };

    let outbound = connect_udp(&ctx.remote, &ctx.options.policy).await?;
    if let Ok(addr) = outbound.peer_addr() {
        handle.set_remote_addr(addr);
    }

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut packet = Vec::new();

    loop {
        tokio::select! {
            _ = wait_stopping(&mut state) => break,
            datagram = rx.recv() => {
                let Some(payload) = datagram else { break };
                match &header {
                    Some(header) => {
                        packet.clear();
                        packet.extend_from_slice(header);
                        packet.extend_from_slice(&payload);
                        outbound.send(&packet).await?;
                    }
                    None => {
                        outbound.send(&payload).await?;
                    }
                }
                handle.record(&handle.bytes_up, payload.len());
            }
            received = outbound.recv(&mut buf) => {
                let n = received?;
                listen.send_to(&buf[..n], client).await?;
                handle.record(&handle.bytes_down, n);
            }
        }
    }

    Ok(())
}

/// Resolve the remote and open a connected socket of the matching family.
async fn connect_udp(remote: &RemoteEndpoint, policy: &TimeoutPolicy) -> Result<UdpSocket> {
    let connect_error = |source: std::io::Error| RelayError::Connect {
        remote: remote.to_string(),
        source,
    };

    let mut addrs = connect_with_timeout(remote, policy.connect_timeout, lookup_host(remote.target()))
        .await?;
    let addr = addrs.next().ok_or_else(|| {
        connect_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "remote resolved to no addresses",
        ))
    })?;

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await.map_err(connect_error)?;
    socket.connect(addr).await.map_err(connect_error)?;
    Ok(socket)
}
