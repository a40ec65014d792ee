//! UDP stream relays
//!
//! Datagrams are grouped into sessions keyed by client address. Each
//! session owns a connected upstream socket, so backend replies are routed
//! back without a reverse lookup. Sessions end after the rule's idle
//! timeout or when the listener stops.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balancer::EndpointGuard;
use crate::relay::{idle_expired, Activity};
use super::{StreamContext, StreamRecord, StreamState};

const MAX_DATAGRAM: usize = 65_535;

/// Datagrams held for a client while its session is being set up
const MAX_QUEUED: usize = 16;

enum Slot {
    /// Upstream still resolving or connecting; early datagrams wait here
    Opening(Vec<Vec<u8>>),
    Open(Arc<UdpSession>),
}

type Sessions = Arc<RwLock<HashMap<SocketAddr, Slot>>>;

struct UdpSession {
    upstream: UdpSocket,
    activity: Activity,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    guard: EndpointGuard,
}

impl UdpSession {
    async fn send(&self, datagram: &[u8], rule: &str, client: SocketAddr) {
        match self.upstream.send(datagram).await {
            Ok(sent) => {
                self.bytes_up.fetch_add(sent as u64, Ordering::Relaxed);
                self.activity.touch();
            }
            Err(e) => debug!(rule, client = %client, error = %e, "UDP send to backend failed"),
        }
    }
}

pub(crate) async fn serve(
    socket: Arc<UdpSocket>,
    state: Arc<StreamState>,
    ctx: Arc<StreamContext>,
    cancel: CancellationToken,
) {
    let sessions: Sessions = Arc::new(RwLock::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = cancel.cancelled() => break,
        };
        let (len, client) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!(rule = %state.rule.name, error = %e, "UDP receive failed");
                continue;
            }
        };

        let open = match sessions.read().await.get(&client) {
            Some(Slot::Open(session)) => Some(session.clone()),
            _ => None,
        };
        match open {
            Some(session) => session.send(&buf[..len], &state.rule.name, client).await,
            None => admit(client, &buf[..len], &socket, &sessions, &state, &ctx, &cancel).await,
        }
    }

    debug!(rule = %state.rule.name, "UDP stream listener stopped");
}

/// Handle a datagram from a client without an open session. The first one
/// claims a slot and starts the setup in its own task, so resolving the
/// backend never stalls the receive loop.
async fn admit(
    client: SocketAddr,
    datagram: &[u8],
    socket: &Arc<UdpSocket>,
    sessions: &Sessions,
    state: &Arc<StreamState>,
    ctx: &Arc<StreamContext>,
    cancel: &CancellationToken,
) {
    let rule = state.rule.name.as_str();
    let mut slots = sessions.write().await;
    let opened = match slots.get_mut(&client) {
        Some(Slot::Opening(queued)) => {
            if queued.len() < MAX_QUEUED {
                queued.push(datagram.to_vec());
            }
            return;
        }
        Some(Slot::Open(session)) => Some(session.clone()),
        None => None,
    };
    // Opened between the read and the write lock.
    if let Some(session) = opened {
        drop(slots);
        session.send(datagram, rule, client).await;
        return;
    }

    if slots.len() >= ctx.max_udp_sessions {
        debug!(rule, client = %client, sessions = slots.len(), "UDP session limit reached, datagram dropped");
        return;
    }
    if !ctx.snapshots.current().access.check(client.ip()).is_allowed() {
        debug!(rule, client = %client, "UDP datagram denied");
        return;
    }

    slots.insert(client, Slot::Opening(vec![datagram.to_vec()]));
    drop(slots);
    tokio::spawn(open_session(
        client,
        socket.clone(),
        sessions.clone(),
        state.clone(),
        ctx.clone(),
        cancel.clone(),
    ));
}

async fn open_session(
    client: SocketAddr,
    socket: Arc<UdpSocket>,
    sessions: Sessions,
    state: Arc<StreamState>,
    ctx: Arc<StreamContext>,
    cancel: CancellationToken,
) {
    let rule = state.rule.name.as_str();
    let Some(session) = connect_session(&state, &ctx).await else {
        sessions.write().await.remove(&client);
        return;
    };
    let session = Arc::new(session);

    let queued = match sessions.write().await.insert(client, Slot::Open(session.clone())) {
        Some(Slot::Opening(queued)) => queued,
        _ => Vec::new(),
    };
    debug!(rule, client = %client, backend = %session.guard.address(), queued = queued.len(), "UDP session opened");
    for datagram in &queued {
        session.send(datagram, rule, client).await;
    }

    reply_loop(client, session, socket, sessions, state, ctx, cancel).await;
}

async fn connect_session(state: &StreamState, ctx: &StreamContext) -> Option<UdpSession> {
    let rule = state.rule.name.as_str();
    let guard = match state.balancer.select(&ctx.health.view()) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(rule, error = %e, "No backend for UDP session");
            return None;
        }
    };

    let upstream = match tokio::time::timeout(ctx.connect_timeout, connect_upstream(guard.address())).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            warn!(rule, backend = %guard.address(), error = %e, "UDP backend unreachable");
            return None;
        }
        Err(_) => {
            warn!(rule, backend = %guard.address(), "UDP backend setup timed out");
            return None;
        }
    };

    Some(UdpSession {
        upstream,
        activity: Activity::new(),
        bytes_up: AtomicU64::new(0),
        bytes_down: AtomicU64::new(0),
        guard,
    })
}

async fn connect_upstream(address: &str) -> std::io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "backend did not resolve"))?;
    let local = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(target).await?;
    Ok(upstream)
}

async fn reply_loop(
    client: SocketAddr,
    session: Arc<UdpSession>,
    socket: Arc<UdpSocket>,
    sessions: Sessions,
    state: Arc<StreamState>,
    ctx: Arc<StreamContext>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let idle = state.idle_timeout();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    let outcome = loop {
        tokio::select! {
            received = session.upstream.recv(&mut buf) => match received {
                Ok(len) => {
                    if let Err(e) = socket.send_to(&buf[..len], client).await {
                        debug!(client = %client, error = %e, "UDP send to client failed");
                        continue;
                    }
                    session.bytes_down.fetch_add(len as u64, Ordering::Relaxed);
                    session.activity.touch();
                }
                // ICMP unreachable surfaces here on connected sockets.
                Err(e) => break e.to_string(),
            },
            _ = idle_expired(&session.activity, idle) => break "idle_timeout".to_string(),
            _ = cancel.cancelled() => break "cancelled".to_string(),
        }
    };

    sessions.write().await.remove(&client);
    let backend = session.guard.address().to_string();
    let bytes_up = session.bytes_up.load(Ordering::Relaxed);
    let bytes_down = session.bytes_down.load(Ordering::Relaxed);
    // Releases the endpoint before the event goes out.
    drop(session);

    ctx.emit(
        &state.rule.name,
        StreamRecord {
            client,
            protocol: "udp",
            backend: Some(&backend),
            bytes_up,
            bytes_down,
            outcome: &outcome,
            duration: started.elapsed(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::super::tests::context;
    use super::super::StreamProxyManager;
    use crate::events::GatewayEvent;
    use crate::rules::{BackendEndpoint, Protocol, StreamProxyRule};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn echo_server() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_session_round_trip_and_idle() {
        let backend = echo_server().await;
        let ctx = context();
        let mut events = ctx.events.subscribe();
        let manager = StreamProxyManager::new(ctx);
        manager
            .apply(&[StreamProxyRule {
                name: "dns".to_string(),
                listen: "127.0.0.1:0".to_string(),
                tcp: false,
                udp: true,
                backends: vec![BackendEndpoint::new(backend, Protocol::Udp, 1)],
                algorithm: Default::default(),
                idle_timeout_secs: 1,
            }])
            .await
            .unwrap();
        let addr = manager.udp_addr("dns").await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        for payload in [&b"query-1"[..], &b"query-22"[..]] {
            client.send(payload).await.unwrap();
            let mut buf = [0u8; 64];
            let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], payload);
        }
        assert_eq!(manager.active_connections("dns").await, 1);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            GatewayEvent::Stream(event) => {
                assert_eq!(event.protocol, "udp");
                assert_eq!(event.bytes_up, 15);
                assert_eq!(event.bytes_down, 15);
                assert_eq!(event.outcome, "idle_timeout");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.active_connections("dns").await, 0);
    }

    #[tokio::test]
    async fn test_session_limit_turns_away_new_clients() {
        let backend = echo_server().await;
        let mut ctx = context();
        ctx.max_udp_sessions = 1;
        let mut events = ctx.events.subscribe();
        let manager = StreamProxyManager::new(ctx);
        manager
            .apply(&[StreamProxyRule {
                name: "syslog".to_string(),
                listen: "127.0.0.1:0".to_string(),
                tcp: false,
                udp: true,
                backends: vec![BackendEndpoint::new(backend, Protocol::Udp, 1)],
                algorithm: Default::default(),
                idle_timeout_secs: 1,
            }])
            .await
            .unwrap();
        let addr = manager.udp_addr("syslog").await.unwrap();

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first.connect(addr).await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second.connect(addr).await.unwrap();
        let mut buf = [0u8; 64];

        first.send(b"one").await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(2), first.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"one");

        second.send(b"two").await.unwrap();
        let turned_away = tokio::time::timeout(Duration::from_millis(300), second.recv(&mut buf)).await;
        assert!(turned_away.is_err());
        assert_eq!(manager.active_connections("syslog").await, 1);

        // once the first session idles out the slot is free again
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        second.send(b"two").await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(2), second.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"two");
    }
}
