//! Health state for backend endpoints
//!
//! [`HealthRegistry`] is the single writer of endpoint health. Reports are
//! idempotent and last-write-wins per endpoint; readers take a
//! point-in-time [`HealthView`] so one selection never sees a half-applied
//! update. [`UptimeMonitor`] is the built-in prober feeding the registry.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{GatewayError, Result};
use crate::rules::{BackendEndpoint, Protocol};
use crate::snapshot::SnapshotHandle;

/// Health status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is healthy and accepting requests
    Healthy,
    /// Backend is unhealthy and should not receive requests
    Unhealthy,
    /// Health status is unknown (never reported)
    Unknown,
}

/// Point-in-time copy of every endpoint's health
#[derive(Debug, Clone)]
pub struct HealthView(Arc<HashMap<String, HealthStatus>>);

impl HealthView {
    pub fn status(&self, endpoint: &str) -> HealthStatus {
        self.0.get(endpoint).copied().unwrap_or(HealthStatus::Unknown)
    }
}

/// Copy-on-write endpoint health map
#[derive(Debug, Default)]
pub struct HealthRegistry {
    states: ArcSwap<HashMap<String, HealthStatus>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest health of `endpoint`
    pub fn report(&self, endpoint: &str, healthy: bool) {
        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        let previous = self.states.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(endpoint.to_string(), status);
            next
        });

        match (previous.get(endpoint).copied(), status) {
            (Some(before), after) if before == after => {}
            (_, HealthStatus::Healthy) => info!(endpoint, "Backend is now healthy"),
            (_, _) => warn!(endpoint, "Backend is now unhealthy"),
        }
    }

    pub fn view(&self) -> HealthView {
        HealthView(self.states.load_full())
    }

    pub fn status(&self, endpoint: &str) -> HealthStatus {
        self.view().status(endpoint)
    }

    /// Drop entries for endpoints that are no longer configured
    pub fn retain(&self, endpoints: &HashSet<String>) {
        self.states.rcu(|current| {
            current
                .iter()
                .filter(|(k, _)| endpoints.contains(*k))
                .map(|(k, v)| (k.clone(), *v))
                .collect::<HashMap<_, _>>()
        });
    }

    pub fn all_statuses(&self) -> HashMap<String, HealthStatus> {
        HashMap::clone(&self.states.load())
    }
}

#[derive(Debug, Default)]
struct ProbeCounters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_response_time: Option<Duration>,
}

/// Active prober reporting into a [`HealthRegistry`]
pub struct UptimeMonitor {
    registry: Arc<HealthRegistry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    /// Number of failures before marking unhealthy
    failure_threshold: u32,
    /// Number of successes before marking healthy again
    success_threshold: u32,
    counters: Mutex<HashMap<String, ProbeCounters>>,
}

impl UptimeMonitor {
    pub fn new(registry: Arc<HealthRegistry>, config: &HealthConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        // Liveness only: backend certificates are not judged here.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Http(format!("Failed to create probe client: {}", e)))?;

        Ok(Self {
            registry,
            client,
            interval: Duration::from_secs(config.interval_secs),
            timeout,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Probe once; `None` when the protocol has no probe.
    async fn probe(&self, endpoint: &BackendEndpoint) -> Option<bool> {
        match endpoint.protocol {
            Protocol::Http | Protocol::Https => {
                let url = format!("{}://{}/", endpoint.protocol.as_str(), endpoint.address);
                match self.client.get(&url).send().await {
                    Ok(response) if !response.status().is_server_error() => Some(true),
                    Ok(response) => {
                        debug!(endpoint = %endpoint.address, status = %response.status(), "Probe failed");
                        Some(false)
                    }
                    Err(e) => {
                        debug!(endpoint = %endpoint.address, error = %e, "Probe error");
                        Some(false)
                    }
                }
            }
            Protocol::Tcp => {
                let connect = TcpStream::connect(endpoint.address.as_str());
                Some(matches!(
                    tokio::time::timeout(self.timeout, connect).await,
                    Ok(Ok(_))
                ))
            }
            Protocol::Udp => None,
        }
    }

    /// Probe one endpoint and report when a threshold is crossed
    pub async fn check_endpoint(&self, endpoint: &BackendEndpoint) {
        let start = Instant::now();
        let Some(up) = self.probe(endpoint).await else {
            return;
        };
        let elapsed = start.elapsed();

        let report = {
            let mut counters = match self.counters.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = counters.entry(endpoint.address.clone()).or_default();
            if up {
                entry.consecutive_failures = 0;
                entry.consecutive_successes += 1;
                entry.last_response_time = Some(elapsed);
                (entry.consecutive_successes >= self.success_threshold).then_some(true)
            } else {
                entry.consecutive_successes = 0;
                entry.consecutive_failures += 1;
                warn!(
                    endpoint = %endpoint.address,
                    failures = entry.consecutive_failures,
                    "Backend probe failed"
                );
                (entry.consecutive_failures >= self.failure_threshold).then_some(false)
            }
        };

        if let Some(healthy) = report {
            self.registry.report(&endpoint.address, healthy);
        }
    }

    /// Last successful probe latency
    pub fn response_time(&self, endpoint: &str) -> Option<Duration> {
        let counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.get(endpoint).and_then(|c| c.last_response_time)
    }

    /// Probe every endpoint of the current snapshot on each tick
    pub fn start(self: Arc<Self>, snapshots: Arc<SnapshotHandle>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "Starting uptime monitor");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let snapshot = snapshots.current();
                let endpoints = snapshot.endpoints();
                let live: HashSet<String> = endpoints.iter().map(|e| e.address.clone()).collect();
                {
                    let mut counters = match self.counters.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    counters.retain(|addr, _| live.contains(addr));
                }

                let checks = endpoints.iter().map(|e| self.check_endpoint(e));
                futures_util::future::join_all(checks).await;
            }
            info!("Uptime monitor stopped");
        })
    }
}
