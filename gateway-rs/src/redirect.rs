//! Redirection table
//!
//! Static redirects matched with the same host/path precedence as proxy
//! rules. A match short-circuits dispatch: the gateway answers with the
//! configured status and `Location` and never contacts a backend.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};

use crate::error::{GatewayError, Result};
use crate::router::{normalize_host, HostPathTable, HostPattern};
use crate::rules::RedirectionRule;

/// Resolved redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub location: String,
    pub status: StatusCode,
}

impl RedirectTarget {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = self.status;
        if let Ok(value) = self.location.parse() {
            response.headers_mut().insert(header::LOCATION, value);
        }
        response
    }
}

/// Redirect rules indexed by host and path
#[derive(Debug, Default)]
pub struct RedirectTable {
    table: HostPathTable<RedirectionRule>,
}

impl RedirectTable {
    pub fn build(rules: &[RedirectionRule]) -> Result<Self> {
        let mut table = HostPathTable::new();
        for rule in rules {
            let pattern = HostPattern::parse(&rule.host).map_err(GatewayError::Config)?;
            table.insert(pattern, &rule.path, rule.clone());
        }
        Ok(Self { table })
    }

    /// Most specific redirect for the request, if any
    pub fn resolve(&self, host: &str, path: &str, query: Option<&str>) -> Option<RedirectTarget> {
        let (rule, prefix) = self.table.lookup(&normalize_host(host), path)?;
        let status = StatusCode::from_u16(rule.status).ok()?;

        let location = if rule.forward_child_path {
            let rest = if prefix == "/" {
                path
            } else {
                path.strip_prefix(prefix).unwrap_or(path)
            };
            let mut location = rule.target.trim_end_matches('/').to_string();
            if !rest.starts_with('/') {
                location.push('/');
            }
            location.push_str(rest);
            if let Some(query) = query.filter(|q| !q.is_empty()) {
                location.push('?');
                location.push_str(query);
            }
            location
        } else {
            rule.target.clone()
        };

        Some(RedirectTarget { location, status })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
