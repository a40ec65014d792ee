//! gateway-rs: self-hosted HTTP(S) and stream gateway
//!
//! Routes HTTP traffic by host and path to backend pools, relays raw TCP
//! and UDP streams, and keeps TLS certificates issued through ACME.
//!
//! # Features
//!
//! - HTTP/HTTPS reverse proxy with WebSocket tunnels
//! - Host/path rules, redirects, path blocks and a fallback site
//! - CIDR and country access control
//! - Weighted round-robin and least-connections load balancing
//! - TCP/UDP stream proxy
//! - SNI certificate selection with automatic Let's Encrypt renewal
//! - Hot-reloadable rule snapshots
//!
//! # Example Rules
//!
//! ```toml
//! [[proxy]]
//! id = "mail-api"
//! host = "mail.example.com"
//! path = "/api"
//! backends = [{ address = "127.0.0.1:8080" }, { address = "127.0.0.1:8081", weight = 2 }]
//!
//! [[redirect]]
//! host = "www.example.com"
//! target = "https://example.com"
//! forward_child_path = true
//!
//! [access]
//! default = "allow"
//!
//! [[access.rules]]
//! priority = 10
//! policy = "deny"
//! cidr = "203.0.113.0/24"
//!
//! [[stream]]
//! name = "postgres"
//! listen = "0.0.0.0:5432"
//! backends = [{ address = "10.0.0.5:5432", protocol = "tcp" }]
//! ```

pub mod access;
pub mod acme;
pub mod balancer;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod proxy;
pub mod redirect;
pub mod relay;
pub mod router;
pub mod rules;
pub mod snapshot;
pub mod stream;
pub mod tls;
pub mod watcher;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use rules::RuleSet;
