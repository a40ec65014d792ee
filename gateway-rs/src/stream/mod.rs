//! TCP/UDP stream proxy
//!
//! Each [`StreamProxyRule`] binds its own listen address and relays raw
//! bytes (TCP) or datagrams (UDP) to a backend chosen by the rule's load
//! balancer. [`StreamProxyManager::apply`] reconciles the running listeners
//! against a new rule list: unchanged rules keep their sockets and
//! counters, removed or changed rules stop accepting while their open TCP
//! relays drain on their own.

mod tcp;
mod udp;

use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::balancer::LoadBalancer;
use crate::error::{GatewayError, Result};
use crate::events::{millis, EventSink, GatewayEvent, StreamEvent};
use crate::health::HealthRegistry;
use crate::lifecycle::Shutdown;
use crate::rules::StreamProxyRule;
use crate::snapshot::SnapshotHandle;

/// Default bound on live UDP sessions per rule
pub const MAX_UDP_SESSIONS: usize = 4096;

/// Shared state every stream listener reads from
pub struct StreamContext {
    pub snapshots: Arc<SnapshotHandle>,
    pub health: Arc<HealthRegistry>,
    pub events: EventSink,
    pub shutdown: Shutdown,
    pub connect_timeout: Duration,
    /// Live UDP sessions a rule keeps before turning new clients away
    pub max_udp_sessions: usize,
}

/// One running stream rule
pub(crate) struct StreamState {
    pub(crate) rule: StreamProxyRule,
    pub(crate) balancer: LoadBalancer,
}

impl StreamState {
    fn new(rule: StreamProxyRule) -> Self {
        let balancer = LoadBalancer::new(&rule.name, &rule.backends, rule.algorithm);
        Self { rule, balancer }
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.rule.idle_timeout_secs)
    }
}

/// Fields of a finished relay, turned into a [`StreamEvent`]
pub(crate) struct StreamRecord<'a> {
    pub(crate) client: SocketAddr,
    pub(crate) protocol: &'static str,
    pub(crate) backend: Option<&'a str>,
    pub(crate) bytes_up: u64,
    pub(crate) bytes_down: u64,
    pub(crate) outcome: &'a str,
    pub(crate) duration: Duration,
}

impl StreamContext {
    pub(crate) fn emit(&self, rule: &str, record: StreamRecord<'_>) {
        self.events.emit(GatewayEvent::Stream(StreamEvent {
            timestamp: Utc::now(),
            client: record.client.to_string(),
            rule: rule.to_string(),
            protocol: record.protocol,
            backend: record.backend.map(str::to_string),
            bytes_up: record.bytes_up,
            bytes_down: record.bytes_down,
            outcome: record.outcome.to_string(),
            duration_ms: millis(record.duration),
        }));
    }
}

struct RunningStream {
    state: Arc<StreamState>,
    cancel: CancellationToken,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningStream {
    /// Stop accepting and wait until the sockets are released
    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Owner of every stream listener
pub struct StreamProxyManager {
    ctx: Arc<StreamContext>,
    running: Mutex<HashMap<String, RunningStream>>,
}

impl StreamProxyManager {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile running listeners with `rules`.
    ///
    /// Rules that fail to bind are reported together; the others are
    /// started regardless.
    pub async fn apply(&self, rules: &[StreamProxyRule]) -> Result<()> {
        let mut running = self.running.lock().await;

        let stale: Vec<String> = running
            .iter()
            .filter(|(name, current)| {
                !rules
                    .iter()
                    .any(|rule| &rule.name == *name && *rule == current.state.rule)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(current) = running.remove(&name) {
                info!(rule = %name, "Stopping stream listener");
                current.stop().await;
            }
        }

        let mut failures = Vec::new();
        for rule in rules {
            if running.contains_key(&rule.name) {
                continue;
            }
            match self.start(rule.clone()).await {
                Ok(started) => {
                    running.insert(rule.name.clone(), started);
                }
                Err(e) => {
                    error!(rule = %rule.name, listen = %rule.listen, error = %e, "Failed to start stream listener");
                    failures.push(format!("{}: {}", rule.name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(format!(
                "Failed to start stream listeners: {}",
                failures.join("; ")
            )))
        }
    }

    async fn start(&self, rule: StreamProxyRule) -> Result<RunningStream> {
        let listen: SocketAddr = rule
            .listen
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid listen address '{}': {}", rule.listen, e)))?;
        let state = Arc::new(StreamState::new(rule));
        let cancel = self.ctx.shutdown.token().child_token();
        let mut tasks = Vec::new();
        let mut tcp_addr = None;
        let mut udp_addr = None;

        if state.rule.tcp {
            let listener = TcpListener::bind(listen).await?;
            let addr = listener.local_addr()?;
            info!(rule = %state.rule.name, address = %addr, "TCP stream listener started");
            tcp_addr = Some(addr);
            tasks.push(tokio::spawn(tcp::serve(
                listener,
                state.clone(),
                self.ctx.clone(),
                cancel.clone(),
            )));
        }

        if state.rule.udp {
            // With both protocols on port 0, share the TCP port.
            let udp_listen = match tcp_addr {
                Some(addr) if listen.port() == 0 => addr,
                _ => listen,
            };
            let bound = UdpSocket::bind(udp_listen).await;
            let socket = match bound {
                Ok(socket) => socket,
                Err(e) => {
                    cancel.cancel();
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(e.into());
                }
            };
            let addr = socket.local_addr()?;
            info!(rule = %state.rule.name, address = %addr, "UDP stream listener started");
            udp_addr = Some(addr);
            tasks.push(tokio::spawn(udp::serve(
                Arc::new(socket),
                state.clone(),
                self.ctx.clone(),
                cancel.clone(),
            )));
        }

        Ok(RunningStream {
            state,
            cancel,
            tcp_addr,
            udp_addr,
            tasks,
        })
    }

    /// Bound TCP address of a rule
    pub async fn tcp_addr(&self, name: &str) -> Option<SocketAddr> {
        self.running.lock().await.get(name).and_then(|r| r.tcp_addr)
    }

    /// Bound UDP address of a rule
    pub async fn udp_addr(&self, name: &str) -> Option<SocketAddr> {
        self.running.lock().await.get(name).and_then(|r| r.udp_addr)
    }

    /// Open TCP relays plus live UDP sessions of a rule
    pub async fn active_connections(&self, name: &str) -> usize {
        self.running
            .lock()
            .await
            .get(name)
            .map(|r| {
                r.state
                    .balancer
                    .endpoints()
                    .iter()
                    .map(|e| e.active_connections())
                    .sum()
            })
            .unwrap_or(0)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every listener
    pub async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        for (_, current) in running.drain() {
            current.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::NoGeoIp;
    use crate::rules::{BackendEndpoint, Protocol};

    pub(crate) fn context() -> StreamContext {
        StreamContext {
            snapshots: Arc::new(SnapshotHandle::new(Arc::new(NoGeoIp))),
            health: Arc::new(HealthRegistry::new()),
            events: EventSink::default(),
            shutdown: Shutdown::new(Duration::from_secs(1)),
            connect_timeout: Duration::from_secs(1),
            max_udp_sessions: MAX_UDP_SESSIONS,
        }
    }

    fn rule(name: &str, backend: &str) -> StreamProxyRule {
        StreamProxyRule {
            name: name.to_string(),
            listen: "127.0.0.1:0".to_string(),
            tcp: true,
            udp: false,
            backends: vec![BackendEndpoint::new(backend, Protocol::Tcp, 1)],
            algorithm: Default::default(),
            idle_timeout_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_apply_reconciles_listeners() {
        let manager = StreamProxyManager::new(context());
        manager
            .apply(&[rule("a", "127.0.0.1:9001"), rule("b", "127.0.0.1:9002")])
            .await
            .unwrap();
        assert_eq!(manager.names().await, ["a", "b"]);
        let a_addr = manager.tcp_addr("a").await.unwrap();

        // unchanged rule keeps its socket; changed rule is restarted
        manager
            .apply(&[rule("a", "127.0.0.1:9001"), rule("b", "127.0.0.1:9003")])
            .await
            .unwrap();
        assert_eq!(manager.tcp_addr("a").await, Some(a_addr));

        manager.apply(&[rule("b", "127.0.0.1:9003")]).await.unwrap();
        assert_eq!(manager.names().await, ["b"]);
        assert!(manager.tcp_addr("a").await.is_none());

        manager.stop_all().await;
        assert!(manager.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut conflicting = rule("c", "127.0.0.1:9001");
        conflicting.listen = taken.local_addr().unwrap().to_string();

        let manager = StreamProxyManager::new(context());
        let err = manager
            .apply(&[conflicting, rule("d", "127.0.0.1:9002")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("c:"));
        // the healthy rule still started
        assert_eq!(manager.names().await, ["d"]);
    }
}
