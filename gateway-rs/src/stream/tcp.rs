//! TCP stream relays

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::relay::relay;
use super::{StreamContext, StreamRecord, StreamState};

pub(crate) async fn serve(
    listener: TcpListener,
    state: Arc<StreamState>,
    ctx: Arc<StreamContext>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };
        match accepted {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, state.clone(), ctx.clone()));
            }
            Err(e) => warn!(rule = %state.rule.name, error = %e, "Failed to accept stream connection"),
        }
    }
    debug!(rule = %state.rule.name, "TCP stream listener stopped");
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    state: Arc<StreamState>,
    ctx: Arc<StreamContext>,
) {
    let started = Instant::now();
    let _tracked = ctx.shutdown.connections().track();
    let rule = state.rule.name.as_str();
    let mut record = StreamRecord {
        client: peer,
        protocol: "tcp",
        backend: None,
        bytes_up: 0,
        bytes_down: 0,
        outcome: "",
        duration: Default::default(),
    };

    let snapshot = ctx.snapshots.current();
    if !snapshot.access.check(peer.ip()).is_allowed() {
        debug!(rule, client = %peer, "Stream connection denied");
        record.outcome = "access_denied";
        ctx.emit(rule, record);
        return;
    }
    drop(snapshot);

    let selected = match state.balancer.select(&ctx.health.view()) {
        Ok(selected) => selected,
        Err(e) => {
            warn!(rule, error = %e, "No backend for stream connection");
            record.outcome = "no_healthy_backend";
            record.duration = started.elapsed();
            ctx.emit(rule, record);
            return;
        }
    };
    let backend_addr = selected.address().to_string();
    record.backend = Some(&backend_addr);

    let backend = match tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(backend_addr.as_str())).await {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => {
            warn!(rule, backend = %backend_addr, error = %e, "Stream backend unreachable");
            record.outcome = "backend_unreachable";
            record.duration = started.elapsed();
            ctx.emit(rule, record);
            return;
        }
        Err(_) => {
            warn!(rule, backend = %backend_addr, "Stream backend connect timed out");
            record.outcome = "backend_timeout";
            record.duration = started.elapsed();
            ctx.emit(rule, record);
            return;
        }
    };
    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    let stats = relay(client, backend, state.idle_timeout(), ctx.shutdown.force_token()).await;
    drop(selected);

    record.bytes_up = stats.client_to_backend;
    record.bytes_down = stats.backend_to_client;
    record.outcome = stats.outcome.as_str();
    record.duration = started.elapsed();
    ctx.emit(rule, record);
}

#[cfg(test)]
mod tests {
    use super::super::tests::context;
    use super::super::StreamProxyManager;
    use crate::events::GatewayEvent;
    use crate::rules::{BackendEndpoint, Protocol, StreamProxyRule};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_relay_round_trip() {
        let backend = echo_server().await;
        let ctx = context();
        let mut events = ctx.events.subscribe();
        let manager = StreamProxyManager::new(ctx);
        manager
            .apply(&[StreamProxyRule {
                name: "echo".to_string(),
                listen: "127.0.0.1:0".to_string(),
                tcp: true,
                udp: false,
                backends: vec![BackendEndpoint::new(backend.clone(), Protocol::Tcp, 1)],
                algorithm: Default::default(),
                idle_timeout_secs: 5,
            }])
            .await
            .unwrap();
        let addr = manager.tcp_addr("echo").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(manager.active_connections("echo").await, 1);

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        match events.recv().await.unwrap() {
            GatewayEvent::Stream(event) => {
                assert_eq!(event.rule, "echo");
                assert_eq!(event.protocol, "tcp");
                assert_eq!(event.backend.as_deref(), Some(backend.as_str()));
                assert_eq!(event.bytes_up, 4);
                assert_eq!(event.bytes_down, 4);
                assert_eq!(event.outcome, "completed");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.active_connections("echo").await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_closes_client() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap().to_string();
        drop(unused);

        let ctx = context();
        let mut events = ctx.events.subscribe();
        let manager = StreamProxyManager::new(ctx);
        manager
            .apply(&[StreamProxyRule {
                name: "dead".to_string(),
                listen: "127.0.0.1:0".to_string(),
                tcp: true,
                udp: false,
                backends: vec![BackendEndpoint::new(dead, Protocol::Tcp, 1)],
                algorithm: Default::default(),
                idle_timeout_secs: 5,
            }])
            .await
            .unwrap();
        let addr = manager.tcp_addr("dead").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let read = client.read_to_end(&mut buf).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));

        match events.recv().await.unwrap() {
            GatewayEvent::Stream(event) => assert_eq!(event.outcome, "backend_unreachable"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
