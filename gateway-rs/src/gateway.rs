//! Gateway context
//!
//! [`Gateway`] is built once at startup and owns every shared component:
//! the rule snapshot, health registry, certificate store, ACME manager,
//! stream listeners and the HTTP(S) proxy. Listeners are bound by
//! [`Gateway::start`] and released by [`Gateway::stop`].

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::access::{GeoIpLookup, NoGeoIp};
use crate::acme::{AcmeChallengeStore, AcmeManager};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::events::EventSink;
use crate::health::{HealthRegistry, UptimeMonitor};
use crate::lifecycle::Shutdown;
use crate::proxy::{BackendClients, ListenerMode, ProxyServer, ProxyState};
use crate::rules::RuleSet;
use crate::snapshot::SnapshotHandle;
use crate::stream::{StreamContext, StreamProxyManager, MAX_UDP_SESSIONS};
use crate::tls::{install_crypto_provider, Certificate, CertificateStore};
use crate::watcher::RulesWatcher;

/// Name on the generated default certificate
const FALLBACK_DOMAIN: &str = "localhost";

/// Bound listeners and background tasks of a started gateway
#[derive(Debug)]
pub struct Running {
    pub http_addrs: Vec<SocketAddr>,
    pub https_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Gateway {
    config: GatewayConfig,
    snapshots: Arc<SnapshotHandle>,
    health: Arc<HealthRegistry>,
    certs: Arc<CertificateStore>,
    acme: Option<Arc<AcmeManager>>,
    events: EventSink,
    shutdown: Shutdown,
    proxy: ProxyServer,
    streams: Arc<StreamProxyManager>,
    monitor: Option<Arc<UptimeMonitor>>,
    /// Stream rules are only bound between `start` and `stop`
    listening: AtomicBool,
}

impl Gateway {
    pub fn new(config: GatewayConfig, rules: &RuleSet) -> Result<Self> {
        Self::with_geoip(config, rules, Arc::new(NoGeoIp))
    }

    /// Build every component and activate the first snapshot
    pub fn with_geoip(config: GatewayConfig, rules: &RuleSet, geoip: Arc<dyn GeoIpLookup>) -> Result<Self> {
        config.validate()?;
        install_crypto_provider();

        let snapshots = Arc::new(SnapshotHandle::new(geoip));
        snapshots.reload(rules)?;

        let health = Arc::new(HealthRegistry::new());
        let events = EventSink::default();
        let shutdown = Shutdown::new(Duration::from_secs(config.server.shutdown_grace_secs));
        let certs = Arc::new(load_certificates(&config)?);

        let acme = if config.acme.enabled {
            let manager = AcmeManager::from_config(
                certs.clone(),
                events.clone(),
                &config.acme,
                config.tls.cert_dir.clone(),
            );
            info!(domains = config.acme.domains.len(), directory = %config.acme.directory, "ACME enabled");
            Some(Arc::new(manager))
        } else {
            None
        };
        let challenges = acme
            .as_ref()
            .map(|manager| manager.challenges())
            .unwrap_or_else(AcmeChallengeStore::new);

        let monitor = if config.health.enabled {
            Some(Arc::new(UptimeMonitor::new(health.clone(), &config.health)?))
        } else {
            None
        };

        let streams = Arc::new(StreamProxyManager::new(StreamContext {
            snapshots: snapshots.clone(),
            health: health.clone(),
            events: events.clone(),
            shutdown: shutdown.clone(),
            connect_timeout: config.timeouts.connect(),
            max_udp_sessions: MAX_UDP_SESSIONS,
        }));

        let proxy = ProxyServer::new(ProxyState {
            snapshots: snapshots.clone(),
            health: health.clone(),
            challenges,
            clients: BackendClients::new(&config.timeouts)?,
            events: events.clone(),
            timeouts: config.timeouts.clone(),
            shutdown: shutdown.clone(),
        });

        Ok(Self {
            config,
            snapshots,
            health,
            certs,
            acme,
            events,
            shutdown,
            proxy,
            streams,
            monitor,
            listening: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &Arc<SnapshotHandle> {
        &self.snapshots
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    pub fn acme(&self) -> Option<&Arc<AcmeManager>> {
        self.acme.as_ref()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn streams(&self) -> &Arc<StreamProxyManager> {
        &self.streams
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn proxy(&self) -> &ProxyServer {
        &self.proxy
    }

    /// Hot-swap the rule set and return the new generation.
    ///
    /// A rejected rule set leaves everything untouched. Once the snapshot is
    /// active, stream listeners are reconciled; a listener that fails to bind
    /// is reported but the new HTTP rules stay in effect.
    pub async fn reload(&self, rules: &RuleSet) -> Result<u64> {
        let snapshot = self.snapshots.reload(rules)?;

        let endpoints: HashSet<String> = snapshot.endpoints().into_iter().map(|e| e.address).collect();
        self.health.retain(&endpoints);

        if self.listening.load(Ordering::Acquire) {
            self.streams.apply(&snapshot.streams).await?;
        }
        Ok(snapshot.generation())
    }

    /// Record a health result for a backend address
    pub fn report_health(&self, endpoint: &str, healthy: bool) {
        self.health.report(endpoint, healthy);
    }

    /// Bind every listener and start the background tasks
    pub async fn start(&self) -> Result<Running> {
        let mut tasks = Vec::new();

        let mut https_addrs = Vec::new();
        if !self.config.server.https_addrs.is_empty() {
            let acceptor = self.certs.acceptor()?;
            for addr in &self.config.server.https_addrs {
                let listener = bind(addr).await?;
                https_addrs.push(listener.local_addr()?);
                tasks.push(self.proxy.serve(listener, ListenerMode::Https(acceptor.clone())));
            }
        }

        let https_redirect_port = if self.config.server.redirect_http_to_https {
            https_addrs.first().map(|addr| addr.port())
        } else {
            None
        };
        let mut http_addrs = Vec::new();
        for addr in &self.config.server.http_addrs {
            let listener = bind(addr).await?;
            http_addrs.push(listener.local_addr()?);
            tasks.push(self.proxy.serve(listener, ListenerMode::Http { https_redirect_port }));
        }

        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.streams.apply(&self.snapshots.current().streams).await {
            error!(error = %e, "Some stream listeners failed to start");
        }

        if let Some(acme) = &self.acme {
            tasks.push(acme.clone().start_renewal_task(self.shutdown.token()));
        }
        if let Some(monitor) = &self.monitor {
            tasks.push(monitor.clone().start(self.snapshots.clone(), self.shutdown.token()));
        }

        info!(http = ?http_addrs, https = ?https_addrs, "Gateway started");
        Ok(Running {
            http_addrs,
            https_addrs,
            tasks,
        })
    }

    /// Reload whenever `path` changes until the gateway drains
    pub fn watch_rules(self: &Arc<Self>, path: &Path) -> Result<JoinHandle<()>> {
        let (watcher, mut updates) = RulesWatcher::new(path);
        let watcher = watcher.run()?;
        let gateway = Arc::clone(self);
        let stop = self.shutdown.token();

        Ok(tokio::spawn(async move {
            // Dropping the watcher unregisters it.
            let _watcher = watcher;
            loop {
                let rules = tokio::select! {
                    Some(rules) = updates.recv() => rules,
                    _ = stop.cancelled() => break,
                    else => break,
                };
                match gateway.reload(&rules).await {
                    Ok(generation) => info!(generation, "Rules reloaded from file"),
                    Err(e) => error!(error = %e, "Rules reload failed"),
                }
            }
        }))
    }

    /// Drain connections, stop the stream listeners and join every task
    pub async fn stop(&self, running: Running) {
        self.listening.store(false, Ordering::Release);
        self.shutdown.drain().await;
        self.streams.stop_all().await;
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }

    /// Start, serve until SIGINT or SIGTERM, then stop
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut running = self.start().await?;
        if self.config.watch_rules {
            if let Some(path) = &self.config.rules_path {
                running.tasks.push(self.watch_rules(path)?);
            }
        }

        shutdown_signal().await;
        self.stop(running).await;
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("snapshots", &self.snapshots)
            .field("certs", &self.certs)
            .field("acme", &self.acme.is_some())
            .finish()
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Config(format!("Failed to bind {}: {}", addr, e)))
}

/// Certificates from `cert_dir`, plus the configured or generated default
fn load_certificates(config: &GatewayConfig) -> Result<CertificateStore> {
    let store = CertificateStore::new();
    store.load_dir(&config.tls.cert_dir)?;

    if let (Some(cert_path), Some(key_path)) = (&config.tls.default_cert, &config.tls.default_key) {
        let chain_pem = fs::read_to_string(cert_path)
            .map_err(|e| GatewayError::Tls(format!("Failed to read {}: {}", cert_path.display(), e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| GatewayError::Tls(format!("Failed to read {}: {}", key_path.display(), e)))?;
        let certificate = Certificate::from_pem(FALLBACK_DOMAIN, &chain_pem, &key_pem)?;
        store.set_default(&certificate)?;
        info!(path = ?cert_path, "Default certificate loaded");
    } else if config.tls.self_signed_fallback {
        let certificate = Certificate::self_signed(&[FALLBACK_DOMAIN.to_string()])?;
        store.set_default(&certificate)?;
        warn!("No default certificate configured, using a self-signed one");
    }
    Ok(store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
