//! Per-request dispatch
//!
//! Stages run in a fixed order and the first one that answers wins:
//!
//! 1. access controller (client IP / country)
//! 2. ACME HTTP-01 challenge responses
//! 3. listener-wide HTTP to HTTPS redirect
//! 4. redirection rules
//! 5. path block rules
//! 6. proxy rule (or fallback site), forwarded to one backend
//!
//! Anything left unanswered is a 404. Every request ends in exactly one
//! [`RequestEvent`].

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use chrono::Utc;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::acme::challenge_token;
use crate::error::{GatewayError, Result};
use crate::events::{millis, GatewayEvent, Outcome, RequestEvent};
use crate::router::normalize_host;
use super::{forward, websocket, ConnectionInfo, ProxyState};

/// Rule and backend picked along the way, for the request event
#[derive(Debug, Default)]
pub(crate) struct Trace {
    pub(crate) rule: Option<String>,
    pub(crate) backend: Option<String>,
}

pub(crate) async fn handle(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response<Body> {
    let started = Instant::now();
    let conn = req
        .extensions()
        .get::<ConnectionInfo>()
        .copied()
        .unwrap_or(ConnectionInfo {
            peer: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            tls: false,
            https_redirect_port: None,
        });
    let host = request_host(req.headers(), req.uri());
    let path = req.uri().path().to_string();
    let method = req.method().to_string();

    let mut trace = Trace::default();
    let (response, outcome) = match route_request(&state, &conn, &host, req, &mut trace).await {
        Ok(response) => {
            let code = response.status().as_u16();
            (response, Outcome::Status { code })
        }
        Err(e) => {
            match &e {
                GatewayError::NotFound { .. } | GatewayError::AccessDenied { .. } => {
                    debug!(client = %conn.peer, host = %host, path = %path, error = %e, "Request rejected")
                }
                _ => warn!(client = %conn.peer, host = %host, path = %path, error = %e, "Request failed"),
            }
            let outcome = Outcome::Failure {
                kind: e.kind().to_string(),
                code: e.status_code().as_u16(),
            };
            (e.into_response(), outcome)
        }
    };

    state.events.emit(GatewayEvent::Request(RequestEvent {
        timestamp: Utc::now(),
        client_ip: conn.peer.ip(),
        method,
        host,
        path,
        rule: trace.rule,
        backend: trace.backend,
        outcome,
        latency_ms: millis(started.elapsed()),
    }));
    response
}

async fn route_request(
    state: &ProxyState,
    conn: &ConnectionInfo,
    host: &str,
    req: Request<Body>,
    trace: &mut Trace,
) -> Result<Response<Body>> {
    let snapshot = state.snapshots.current();
    let path = req.uri().path();

    snapshot.access.authorize(conn.peer.ip())?;

    if let Some(token) = challenge_token(path) {
        if let Some(key_authorization) = state.challenges.get_challenge(token).await {
            debug!(token, "Serving ACME challenge");
            return Ok(([(header::CONTENT_TYPE, "text/plain")], key_authorization).into_response());
        }
    }

    if let Some(port) = conn.https_redirect_port {
        if !conn.tls {
            return Ok(https_redirect(host, port, req.uri()));
        }
    }

    if let Some(target) = snapshot.redirects.resolve(host, path, req.uri().query()) {
        debug!(host, path, location = %target.location, "Redirecting");
        return Ok(target.into_response());
    }

    if let Some(status) = snapshot.blocks.check(host, path) {
        debug!(host, path, status = status.as_u16(), "Request blocked");
        return Ok(status_response(status));
    }

    let route = snapshot.routes.match_route(host, path)?;
    trace.rule = Some(route.id().to_string());
    // Routing is decided; the rest runs against this route only.
    drop(snapshot);

    if route.rule.options.websocket && websocket::is_upgrade_request(req.headers()) {
        websocket::tunnel(state, &route, conn, host, req, trace).await
    } else {
        forward::forward(state, &route, conn, host, req, trace).await
    }
}

/// Host the client asked for: `Host` header, else the URI authority (HTTP/2)
fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .map(normalize_host)
        .unwrap_or_default()
}

fn https_redirect(host: &str, port: u16, uri: &Uri) -> Response<Body> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let location = if port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, port, path)
    };

    let mut response = status_response(StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

fn status_response(status: StatusCode) -> Response<Body> {
    (status, status.canonical_reason().unwrap_or("Error")).into_response()
}
