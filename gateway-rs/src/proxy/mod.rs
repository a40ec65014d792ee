//! HTTP(S) reverse proxy
//!
//! Every listener runs the same axum [`Router`] whose only handler is the
//! dispatch pipeline. Connections are served by hyper-util's auto builder
//! (HTTP/1.1 and HTTP/2, upgrades enabled for WebSocket) and closed
//! gracefully when the gateway drains.

mod dispatch;
mod forward;
mod websocket;

pub use forward::BackendClients;

use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::acme::AcmeChallengeStore;
use crate::config::TimeoutConfig;
use crate::events::EventSink;
use crate::health::HealthRegistry;
use crate::lifecycle::Shutdown;
use crate::snapshot::SnapshotHandle;

/// Shared proxy state
pub struct ProxyState {
    pub snapshots: Arc<SnapshotHandle>,
    pub health: Arc<HealthRegistry>,
    /// HTTP-01 responses served ahead of routing
    pub challenges: AcmeChallengeStore,
    pub clients: BackendClients,
    pub events: EventSink,
    pub timeouts: TimeoutConfig,
    pub shutdown: Shutdown,
}

/// How a listener treats its connections
#[derive(Clone)]
pub enum ListenerMode {
    /// Plain HTTP; with a port set, everything except ACME challenges is
    /// redirected to HTTPS on that port
    Http { https_redirect_port: Option<u16> },
    /// TLS terminated with certificates from the store
    Https(TlsAcceptor),
}

impl ListenerMode {
    fn is_tls(&self) -> bool {
        matches!(self, ListenerMode::Https(_))
    }
}

/// Facts about the client connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionInfo {
    pub(crate) peer: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) https_redirect_port: Option<u16>,
}

/// Proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(state: ProxyState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch::handle)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Accept on `listener` until the gateway starts draining
    pub fn serve(&self, listener: TcpListener, mode: ListenerMode) -> JoinHandle<()> {
        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        let handshake_timeout = self.state.timeouts.connect();

        tokio::spawn(async move {
            let local = listener.local_addr().ok();
            info!(address = ?local, tls = mode.is_tls(), "HTTP listener started");
            let stop = shutdown.token();

            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = stop.cancelled() => break,
                };
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);

                tokio::spawn(accept_connection(
                    stream,
                    peer,
                    mode.clone(),
                    router.clone(),
                    shutdown.clone(),
                    handshake_timeout,
                ));
            }
            info!(address = ?local, "HTTP listener stopped");
        })
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mode: ListenerMode,
    router: Router,
    shutdown: Shutdown,
    handshake_timeout: Duration,
) {
    let _tracked = shutdown.connections().track();
    match mode {
        ListenerMode::Http { https_redirect_port } => {
            let info = ConnectionInfo {
                peer,
                tls: false,
                https_redirect_port,
            };
            serve_connection(stream, info, router, &shutdown, handshake_timeout).await;
        }
        ListenerMode::Https(acceptor) => {
            let info = ConnectionInfo {
                peer,
                tls: true,
                https_redirect_port: None,
            };
            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    serve_connection(tls_stream, info, router, &shutdown, handshake_timeout).await
                }
                Ok(Err(e)) => debug!(client = %peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(client = %peer, "TLS handshake timed out"),
            }
        }
    }
}

/// Serve HTTP on one accepted connection. Request heads must arrive within
/// `header_timeout`.
async fn serve_connection<S>(
    stream: S,
    info: ConnectionInfo,
    router: Router,
    shutdown: &Shutdown,
    header_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    // Create a service from the router
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(info);
        let router = router.clone();
        async move { router.oneshot(req).await }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout);
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let graceful = shutdown.token();
    let force = shutdown.force_token();
    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = force.cancelled() => Ok(()),
            }
        }
    };
    if let Err(e) = result {
        debug!(client = %info.peer, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::access::NoGeoIp;
    use crate::rules::RuleSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) fn state(rules: &str) -> ProxyState {
        let snapshots = Arc::new(SnapshotHandle::new(Arc::new(NoGeoIp)));
        snapshots.reload(&RuleSet::from_toml(rules).unwrap()).unwrap();
        let timeouts = TimeoutConfig {
            connect_secs: 1,
            response_secs: 2,
            idle_secs: 5,
        };
        ProxyState {
            snapshots,
            health: Arc::new(HealthRegistry::new()),
            challenges: AcmeChallengeStore::new(),
            clients: BackendClients::new(&timeouts).unwrap(),
            events: EventSink::default(),
            timeouts,
            shutdown: Shutdown::new(Duration::from_secs(1)),
        }
    }

    #[tokio::test]
    async fn test_slow_request_head_is_dropped() {
        let server = ProxyServer::new(state(""));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _task = server.serve(listener, ListenerMode::Http { https_redirect_port: None });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: app.exa").await.unwrap();

        // connect timeout of the test state is 1s
        let mut buf = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("connection must be closed once the header timeout passes");
        assert!(closed.is_err() || !String::from_utf8_lossy(&buf).contains("200 OK"));
    }

    #[tokio::test]
    async fn test_listener_stops_on_drain() {
        let server = ProxyServer::new(state(""));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = server.serve(listener, ListenerMode::Http { https_redirect_port: None });

        server.state().shutdown.drain().await;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
