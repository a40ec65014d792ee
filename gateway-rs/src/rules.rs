//! Rule set consumed by the dispatch path
//!
//! A [`RuleSet`] is the whole routing configuration handed over by the
//! administrative layer. It is validated as a unit: one bad rule rejects the
//! entire set and the previously active snapshot keeps serving.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::error::{GatewayError, Result, ValidationError};
use crate::router::HostPattern;

/// All rules the gateway routes with
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleSet {
    /// Host/path proxy rules
    pub proxy: Vec<ProxyRule>,
    /// Static redirects, evaluated before proxy rules
    pub redirect: Vec<RedirectionRule>,
    /// Request-level path blocks
    pub block: Vec<BlockRule>,
    /// Connection-level allow/deny policy
    pub access: AccessPolicy,
    /// Raw TCP/UDP relays
    pub stream: Vec<StreamProxyRule>,
    /// Site served when no proxy rule matches
    pub fallback: Option<FallbackRule>,
}

/// A routable host + path unit
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyRule {
    /// Stable identity used in logs and events
    pub id: String,
    /// Exact host or single-level wildcard (`*.example.com`)
    pub host: String,
    /// Path prefix
    #[serde(default = "default_path")]
    pub path: String,
    /// Backends in declaration order
    pub backends: Vec<BackendEndpoint>,
    /// Selection policy
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub options: RuleOptions,
}

/// Per-rule forwarding options
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleOptions {
    /// Forward the client's Host header instead of the backend address
    pub preserve_host: bool,
    /// Allow WebSocket upgrades
    pub websocket: bool,
    /// Skip certificate verification towards https backends
    pub tls_skip_verify: bool,
    /// Remove the matched path prefix before forwarding
    pub strip_prefix: bool,
    /// Headers set on the upstream request
    pub request_headers: BTreeMap<String, String>,
    /// Headers removed from the upstream request
    pub strip_request_headers: Vec<String>,
    /// Headers set on the downstream response
    pub response_headers: BTreeMap<String, String>,
    /// Headers removed from the downstream response
    pub strip_response_headers: Vec<String>,
    /// Response timeout override
    pub response_timeout_secs: Option<u64>,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            preserve_host: true,
            websocket: true,
            tls_skip_verify: false,
            strip_prefix: false,
            request_headers: BTreeMap::new(),
            strip_request_headers: Vec::new(),
            response_headers: BTreeMap::new(),
            strip_response_headers: Vec::new(),
            response_timeout_secs: None,
        }
    }
}

/// Backend selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    WeightedRoundRobin,
    LeastConnections,
}

/// Wire protocol spoken by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One backend address with its relative weight
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendEndpoint {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendEndpoint {
    pub fn new(address: impl Into<String>, protocol: Protocol, weight: u32) -> Self {
        Self {
            address: address.into(),
            protocol,
            weight,
        }
    }

    pub fn http(address: impl Into<String>) -> Self {
        Self::new(address, Protocol::Http, 1)
    }
}

/// Static redirect
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedirectionRule {
    pub host: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Absolute target URL
    pub target: String,
    /// 301, 302, 307 or 308
    #[serde(default = "default_redirect_status")]
    pub status: u16,
    /// Append the unmatched remainder of the path and the query to `target`
    #[serde(default)]
    pub forward_child_path: bool,
}

/// Path block answered directly by the gateway
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockRule {
    pub host: String,
    pub path: String,
    #[serde(default = "default_block_status")]
    pub status: u16,
}

/// Allow or deny
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Allow,
    Deny,
}

/// Connection-level access policy
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Applied when no rule matches
    pub default: Policy,
    /// Applied when a country rule could not be evaluated because the lookup failed
    pub unknown_country: Option<Policy>,
    pub rules: Vec<AccessRule>,
}

/// One allow/deny entry, keyed by CIDR or by country code
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccessRule {
    /// Lower values are evaluated first
    #[serde(default)]
    pub priority: i32,
    pub policy: Policy,
    pub cidr: Option<String>,
    pub country: Option<String>,
}

/// Raw TCP/UDP relay bound to one listen address
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamProxyRule {
    pub name: String,
    /// `ip:port` to listen on
    pub listen: String,
    #[serde(default = "default_true")]
    pub tcp: bool,
    #[serde(default)]
    pub udp: bool,
    pub backends: Vec<BackendEndpoint>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default = "default_stream_idle")]
    pub idle_timeout_secs: u64,
}

/// Backends used when nothing else matches
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FallbackRule {
    pub backends: Vec<BackendEndpoint>,
    #[serde(default)]
    pub options: RuleOptions,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_redirect_status() -> u16 {
    301
}

fn default_block_status() -> u16 {
    403
}

fn default_true() -> bool {
    true
}

fn default_stream_idle() -> u64 {
    60
}

/// Parse `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_authority(address: &str) -> std::result::Result<(&str, u16), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is missing a port", address))?;
    if host.is_empty() {
        return Err(format!("'{}' is missing a host", address));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(format!("'{}' must bracket its IPv6 host", address));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("'{}' has an invalid port", address))?;
    if port == 0 {
        return Err(format!("'{}' has port 0", address));
    }
    Ok((host, port))
}

/// Parse a CIDR; a bare address is taken as a single-host network.
pub fn parse_cidr(value: &str) -> std::result::Result<IpNet, String> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| format!("'{}' is not a CIDR or IP address", value))
}

impl RuleSet {
    /// Load a rule set from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read rules file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse rules: {}", e)))
    }

    /// Check every rule, reporting all problems at once
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut errors = ValidationError::new();

        let mut ids = HashSet::new();
        for rule in &self.proxy {
            let ctx = format!("proxy[{}]", rule.id);
            if rule.id.trim().is_empty() {
                errors.push(&ctx, "id must not be empty");
            } else if !ids.insert(rule.id.as_str()) {
                errors.push(&ctx, "duplicate id");
            }
            check_host(&mut errors, &ctx, &rule.host);
            check_path(&mut errors, &ctx, &rule.path);
            check_http_backends(&mut errors, &ctx, &rule.backends);
        }

        if let Some(fallback) = &self.fallback {
            check_http_backends(&mut errors, "fallback", &fallback.backends);
        }

        for (i, rule) in self.redirect.iter().enumerate() {
            let ctx = format!("redirect[{}]", i);
            check_host(&mut errors, &ctx, &rule.host);
            check_path(&mut errors, &ctx, &rule.path);
            if !matches!(rule.status, 301 | 302 | 307 | 308) {
                errors.push(&ctx, format!("status {} is not a redirect code", rule.status));
            }
            match url::Url::parse(&rule.target) {
                Ok(url) if url.has_host() => {}
                Ok(_) => errors.push(&ctx, format!("target '{}' has no host", rule.target)),
                Err(e) => errors.push(&ctx, format!("target '{}': {}", rule.target, e)),
            }
        }

        for (i, rule) in self.block.iter().enumerate() {
            let ctx = format!("block[{}]", i);
            check_host(&mut errors, &ctx, &rule.host);
            check_path(&mut errors, &ctx, &rule.path);
            if !(400..600).contains(&rule.status) {
                errors.push(&ctx, format!("status {} is not an error code", rule.status));
            }
        }

        for (i, rule) in self.access.rules.iter().enumerate() {
            let ctx = format!("access[{}]", i);
            match (&rule.cidr, &rule.country) {
                (Some(cidr), None) => {
                    if let Err(e) = parse_cidr(cidr) {
                        errors.push(&ctx, e);
                    }
                }
                (None, Some(country)) => {
                    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                        errors.push(&ctx, format!("'{}' is not a two-letter country code", country));
                    }
                }
                _ => errors.push(&ctx, "exactly one of cidr or country is required"),
            }
        }

        let mut names = HashSet::new();
        let mut listeners = HashSet::new();
        for rule in &self.stream {
            let ctx = format!("stream[{}]", rule.name);
            if rule.name.trim().is_empty() {
                errors.push(&ctx, "name must not be empty");
            } else if !names.insert(rule.name.as_str()) {
                errors.push(&ctx, "duplicate name");
            }
            if !rule.tcp && !rule.udp {
                errors.push(&ctx, "enable tcp, udp or both");
            }
            match rule.listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    // Port 0 binds an ephemeral port and never conflicts.
                    if addr.port() != 0 {
                        if rule.tcp && !listeners.insert(("tcp", addr)) {
                            errors.push(&ctx, format!("tcp listener {} already in use", addr));
                        }
                        if rule.udp && !listeners.insert(("udp", addr)) {
                            errors.push(&ctx, format!("udp listener {} already in use", addr));
                        }
                    }
                }
                Err(_) => errors.push(&ctx, format!("listen '{}' is not ip:port", rule.listen)),
            }
            if rule.idle_timeout_secs == 0 {
                errors.push(&ctx, "idle_timeout_secs must be positive");
            }
            check_backends(&mut errors, &ctx, &rule.backends);
        }

        errors.into_result()
    }
}

fn check_host(errors: &mut ValidationError, ctx: &str, host: &str) {
    if let Err(e) = HostPattern::parse(host) {
        errors.push(ctx, e);
    }
}

fn check_path(errors: &mut ValidationError, ctx: &str, path: &str) {
    if !path.starts_with('/') {
        errors.push(ctx, format!("path '{}' must start with '/'", path));
    }
}

fn check_backends(errors: &mut ValidationError, ctx: &str, backends: &[BackendEndpoint]) {
    if backends.is_empty() {
        errors.push(ctx, "at least one backend is required");
    }
    for backend in backends {
        if let Err(e) = parse_authority(&backend.address) {
            errors.push(ctx, e);
        }
        if backend.weight == 0 {
            errors.push(ctx, format!("backend {} has weight 0", backend.address));
        }
    }
}

fn check_http_backends(errors: &mut ValidationError, ctx: &str, backends: &[BackendEndpoint]) {
    check_backends(errors, ctx, backends);
    for backend in backends {
        if !matches!(backend.protocol, Protocol::Http | Protocol::Https) {
            errors.push(
                ctx,
                format!("backend {} must speak http or https", backend.address),
            );
        }
    }
}
