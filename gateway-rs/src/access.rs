//! Access control
//!
//! The [`AccessController`] decides per client IP, at accept time, before any
//! TLS or routing work. Rules are evaluated by ascending priority (stable on
//! declaration order) and the first match wins. Country rules go through a
//! [`GeoIpLookup`]; a failed lookup never errors the connection, it falls
//! back to the `unknown_country` policy.
//!
//! [`BlockTable`] is the request-level deny stage: path blocks evaluated
//! after redirects and before proxy rules.

use axum::http::StatusCode;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{GatewayError, Result};
use crate::router::{normalize_host, HostPathTable, HostPattern};
use crate::rules::{parse_cidr, AccessPolicy, BlockRule, Policy};

/// Why a GeoIP lookup produced no answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no GeoIP database configured")]
    Unavailable,
    #[error("address {0} not found")]
    NotFound(IpAddr),
}

/// External `ip -> country code` resolver
pub trait GeoIpLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> std::result::Result<String, LookupError>;
}

/// Lookup used when no GeoIP provider is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
    fn lookup(&self, _ip: IpAddr) -> std::result::Result<String, LookupError> {
        Err(LookupError::Unavailable)
    }
}

/// In-memory network -> country table
#[derive(Debug, Default, Clone)]
pub struct StaticGeoIp {
    entries: Vec<(IpNet, String)>,
}

impl StaticGeoIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, cidr: &str, country: &str) -> Result<Self> {
        let net = parse_cidr(cidr).map_err(GatewayError::Config)?;
        self.entries.push((net, country.to_ascii_uppercase()));
        Ok(self)
    }
}

impl GeoIpLookup for StaticGeoIp {
    fn lookup(&self, ip: IpAddr) -> std::result::Result<String, LookupError> {
        self.entries
            .iter()
            .filter(|(net, _)| net.contains(&ip))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, country)| country.clone())
            .ok_or(LookupError::NotFound(ip))
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Cidr(IpNet),
    Country(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    priority: i32,
    policy: Policy,
    matcher: Matcher,
}

/// Outcome of an access check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub policy: Policy,
    /// What decided: a CIDR, `country:XX`, `unknown-country` or `default`
    pub matched: String,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        self.policy == Policy::Allow
    }
}

/// Connection-level allow/deny evaluation
pub struct AccessController {
    rules: Vec<CompiledRule>,
    default: Policy,
    unknown_country: Policy,
    geoip: Arc<dyn GeoIpLookup>,
}

impl AccessController {
    pub fn build(policy: &AccessPolicy, geoip: Arc<dyn GeoIpLookup>) -> Result<Self> {
        let mut rules = policy
            .rules
            .iter()
            .map(|rule| -> Result<CompiledRule> {
                let matcher = match (&rule.cidr, &rule.country) {
                    (Some(cidr), None) => Matcher::Cidr(parse_cidr(cidr).map_err(GatewayError::Config)?),
                    (None, Some(country)) => Matcher::Country(country.to_ascii_uppercase()),
                    _ => {
                        return Err(GatewayError::Config(
                            "access rule needs exactly one of cidr or country".to_string(),
                        ))
                    }
                };
                Ok(CompiledRule {
                    priority: rule.priority,
                    policy: rule.policy,
                    matcher,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rules.sort_by_key(|r| r.priority);

        Ok(Self {
            rules,
            default: policy.default,
            unknown_country: policy.unknown_country.unwrap_or(policy.default),
            geoip,
        })
    }

    /// Allow everything
    pub fn permissive() -> Self {
        Self {
            rules: Vec::new(),
            default: Policy::Allow,
            unknown_country: Policy::Allow,
            geoip: Arc::new(NoGeoIp),
        }
    }

    pub fn check(&self, ip: IpAddr) -> AccessDecision {
        let ip = ip.to_canonical();
        let mut country: Option<Option<String>> = None;
        let mut unresolved = false;

        for rule in &self.rules {
            match &rule.matcher {
                Matcher::Cidr(net) => {
                    if net.contains(&ip) {
                        return AccessDecision {
                            policy: rule.policy,
                            matched: net.to_string(),
                        };
                    }
                }
                Matcher::Country(code) => {
                    let resolved = country.get_or_insert_with(|| self.geoip.lookup(ip).ok());
                    match resolved {
                        Some(found) if found.eq_ignore_ascii_case(code) => {
                            return AccessDecision {
                                policy: rule.policy,
                                matched: format!("country:{}", code),
                            };
                        }
                        Some(_) => {}
                        None => unresolved = true,
                    }
                }
            }
        }

        if unresolved {
            return AccessDecision {
                policy: self.unknown_country,
                matched: "unknown-country".to_string(),
            };
        }

        AccessDecision {
            policy: self.default,
            matched: "default".to_string(),
        }
    }

    /// `Err(AccessDenied)` when the client is rejected
    pub fn authorize(&self, ip: IpAddr) -> Result<AccessDecision> {
        let decision = self.check(ip);
        if decision.is_allowed() {
            Ok(decision)
        } else {
            Err(GatewayError::AccessDenied {
                client: ip.to_string(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Debug for AccessController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessController")
            .field("rules", &self.rules)
            .field("default", &self.default)
            .field("unknown_country", &self.unknown_country)
            .finish()
    }
}

/// Request-level path blocks
#[derive(Debug, Default)]
pub struct BlockTable {
    table: HostPathTable<BlockRule>,
}

impl BlockTable {
    pub fn build(rules: &[BlockRule]) -> Result<Self> {
        let mut table = HostPathTable::new();
        for rule in rules {
            let pattern = HostPattern::parse(&rule.host).map_err(GatewayError::Config)?;
            table.insert(pattern, &rule.path, rule.clone());
        }
        Ok(Self { table })
    }

    /// Status to answer with when the request is blocked
    pub fn check(&self, host: &str, path: &str) -> Option<StatusCode> {
        self.table
            .lookup(&normalize_host(host), path)
            .and_then(|(rule, _)| StatusCode::from_u16(rule.status).ok())
    }
}
