//! Request router for gateway-rs
//!
//! Handles routing of incoming requests to proxy rules based on host and
//! path matching. Host patterns are tiered: an exact host beats a
//! single-level wildcard, which beats the catch-all `*`. Within a tier the
//! longest matching path prefix wins and equal prefixes keep declaration
//! order, so a lookup is deterministic for a given table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::error::{GatewayError, Result};
use crate::rules::{FallbackRule, ProxyRule};

/// Identity of the route built from a fallback rule
pub const FALLBACK_RULE_ID: &str = "fallback";

/// Compiled host pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostPattern {
    /// `a.example.com`
    Exact(String),
    /// `*.example.com`, holding the parent domain `example.com`
    Wildcard(String),
    /// `*`
    Any,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> std::result::Result<Self, String> {
        let normalized = normalize_host(pattern);
        if normalized.is_empty() {
            return Err("host pattern must not be empty".to_string());
        }
        if normalized == "*" {
            if pattern.trim() != "*" {
                return Err(format!("'{}' is not a single-level wildcard", pattern));
            }
            return Ok(HostPattern::Any);
        }
        if let Some(parent) = normalized.strip_prefix("*.") {
            if parent.is_empty() || parent.contains('*') {
                return Err(format!("'{}' is not a single-level wildcard", pattern));
            }
            return Ok(HostPattern::Wildcard(parent.to_string()));
        }
        if normalized.contains('*') {
            return Err(format!(
                "'{}': wildcards are only allowed as the leftmost label",
                pattern
            ));
        }
        Ok(HostPattern::Exact(normalized))
    }

    /// `host` must already be normalized
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(exact) => exact == host,
            HostPattern::Wildcard(parent) => parent_domain(host) == Some(parent.as_str()),
            HostPattern::Any => true,
        }
    }
}

/// Lowercase, drop any port and a trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let without_port = if raw.starts_with('[') {
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port))
                if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                host
            }
            _ => raw,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Domain one label up: `a.example.com` -> `example.com`
fn parent_domain(host: &str) -> Option<&str> {
    match host.split_once('.') {
        Some((label, rest)) if !label.is_empty() && !rest.is_empty() => Some(rest),
        _ => None,
    }
}

/// Segment-aware prefix match: `/api` covers `/api` and `/api/x`, not `/apix`.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix == path {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug)]
struct Entry<T> {
    prefix: String,
    value: Arc<T>,
}

/// Host/path lookup table shared by proxy rules, redirects and blocks
#[derive(Debug)]
pub struct HostPathTable<T> {
    exact: HashMap<String, Vec<Entry<T>>>,
    wildcard: HashMap<String, Vec<Entry<T>>>,
    any: Vec<Entry<T>>,
    len: usize,
}

impl<T> Default for HostPathTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            any: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HostPathTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping each bucket ordered by prefix length, longest first.
    /// Equal lengths keep insertion order.
    pub fn insert(&mut self, pattern: HostPattern, prefix: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let bucket = match pattern {
            HostPattern::Exact(host) => self.exact.entry(host).or_default(),
            HostPattern::Wildcard(parent) => self.wildcard.entry(parent).or_default(),
            HostPattern::Any => &mut self.any,
        };
        let position = bucket
            .iter()
            .position(|e| e.prefix.len() < prefix.len())
            .unwrap_or(bucket.len());
        bucket.insert(
            position,
            Entry {
                prefix: prefix.to_string(),
                value: value.clone(),
            },
        );
        self.len += 1;
        value
    }

    /// Best entry for `host` (normalized) and `path`, with the prefix it matched.
    pub fn lookup(&self, host: &str, path: &str) -> Option<(&Arc<T>, &str)> {
        let tiers = [
            self.exact.get(host),
            parent_domain(host).and_then(|parent| self.wildcard.get(parent)),
            Some(&self.any),
        ];
        tiers
            .into_iter()
            .flatten()
            .find_map(|bucket| {
                bucket
                    .iter()
                    .find(|e| path_matches(&e.prefix, path))
            })
            .map(|e| (&e.value, e.prefix.as_str()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A proxy rule compiled for dispatch
#[derive(Debug)]
pub struct Route {
    pub rule: ProxyRule,
    pub balancer: LoadBalancer,
}

impl Route {
    pub fn new(rule: ProxyRule) -> Self {
        let balancer = LoadBalancer::new(&rule.id, &rule.backends, rule.algorithm);
        Self { rule, balancer }
    }

    fn fallback(rule: &FallbackRule) -> Self {
        Self::new(ProxyRule {
            id: FALLBACK_RULE_ID.to_string(),
            host: "*".to_string(),
            path: "/".to_string(),
            backends: rule.backends.clone(),
            algorithm: Default::default(),
            options: rule.options.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.rule.id
    }

    /// Path to forward, after stripping the rule prefix if configured
    pub fn forward_path(&self, path: &str) -> String {
        if !self.rule.options.strip_prefix || self.rule.path == "/" {
            return path.to_string();
        }
        let stripped = path.strip_prefix(self.rule.path.as_str()).unwrap_or(path);
        if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{}", stripped)
        }
    }
}

/// Path/Host rule table
#[derive(Debug, Default)]
pub struct RuleTable {
    table: HostPathTable<Route>,
    routes: Vec<Arc<Route>>,
    fallback: Option<Arc<Route>>,
}

impl RuleTable {
    /// Build from rules that have already passed validation.
    pub fn build(rules: &[ProxyRule], fallback: Option<&FallbackRule>) -> Result<Self> {
        let mut table = HostPathTable::new();
        let mut routes = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = HostPattern::parse(&rule.host).map_err(GatewayError::Config)?;
            let route = table.insert(pattern, &rule.path, Route::new(rule.clone()));
            routes.push(route);
        }
        Ok(Self {
            table,
            routes,
            fallback: fallback.map(|f| Arc::new(Route::fallback(f))),
        })
    }

    /// Find the winning rule for a request
    pub fn match_route(&self, host: &str, path: &str) -> Result<Arc<Route>> {
        let host = normalize_host(host);
        if let Some((route, _)) = self.table.lookup(&host, path) {
            return Ok(route.clone());
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        Err(GatewayError::NotFound {
            host,
            path: path.to_string(),
        })
    }

    /// Routes in declaration order, fallback last
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter().chain(self.fallback.iter())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
