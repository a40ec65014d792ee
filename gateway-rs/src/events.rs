//! Observability output
//!
//! Every dispatched request, finished stream relay and certificate outcome
//! becomes a [`GatewayEvent`]. Events are logged under the
//! `gateway_rs::access_log` target and broadcast to in-process subscribers
//! (statistics collectors, tests). A slow subscriber lags and loses events;
//! it never blocks the data path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const ACCESS_LOG: &str = "gateway_rs::access_log";

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// Response status sent to the client (backend or gateway generated)
    Status { code: u16 },
    /// Gateway-level failure and the status it mapped to
    Failure { kind: String, code: u16 },
}

impl Outcome {
    pub fn code(&self) -> u16 {
        match self {
            Outcome::Status { code } | Outcome::Failure { code, .. } => *code,
        }
    }
}

/// One HTTP request through the gateway
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub method: String,
    pub host: String,
    pub path: String,
    /// Matched rule identity
    pub rule: Option<String>,
    /// Selected backend
    pub backend: Option<String>,
    pub outcome: Outcome,
    pub latency_ms: u64,
}

/// One finished stream relay
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub rule: String,
    pub protocol: &'static str,
    pub backend: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub outcome: String,
    pub duration_ms: u64,
}

/// Certificate lifecycle outcome
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CertificateEvent {
    Issued {
        domain: String,
        not_after: DateTime<Utc>,
        renewal: bool,
    },
    Failed {
        domain: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    Request(RequestEvent),
    Stream(StreamEvent),
    Certificate(CertificateEvent),
}

/// Fan-out of gateway events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::Request(e) => info!(
                target: ACCESS_LOG,
                client = %e.client_ip,
                method = %e.method,
                host = %e.host,
                path = %e.path,
                rule = e.rule.as_deref().unwrap_or("-"),
                backend = e.backend.as_deref().unwrap_or("-"),
                status = e.outcome.code(),
                latency_ms = e.latency_ms,
                "request"
            ),
            GatewayEvent::Stream(e) => info!(
                target: ACCESS_LOG,
                client = %e.client,
                rule = %e.rule,
                protocol = e.protocol,
                backend = e.backend.as_deref().unwrap_or("-"),
                bytes_up = e.bytes_up,
                bytes_down = e.bytes_down,
                outcome = %e.outcome,
                duration_ms = e.duration_ms,
                "stream"
            ),
            GatewayEvent::Certificate(CertificateEvent::Issued { domain, not_after, renewal }) => info!(
                target: ACCESS_LOG,
                domain = %domain,
                not_after = %not_after,
                renewal,
                "certificate issued"
            ),
            GatewayEvent::Certificate(CertificateEvent::Failed { domain, attempts, reason }) => warn!(
                target: ACCESS_LOG,
                domain = %domain,
                attempts,
                reason = %reason,
                "certificate lifecycle failed"
            ),
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
