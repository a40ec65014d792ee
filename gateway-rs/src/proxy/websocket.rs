//! WebSocket tunnels
//!
//! The upgrade request is forwarded as-is (Upgrade and Connection kept).
//! When the backend answers `101 Switching Protocols`, both upgraded
//! connections are joined by the byte relay and the 101 goes back to the
//! client. Any other backend answer is returned like a normal response.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::error::Result;
use crate::relay::relay;
use crate::router::Route;
use super::dispatch::Trace;
use super::forward::{
    apply_response_headers, backend_uri, prepare_request_headers, relay_body, send, strip_hop_by_hop,
};
use super::{ConnectionInfo, ProxyState};

/// `Connection: upgrade` together with `Upgrade: websocket`
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

pub(crate) async fn tunnel(
    state: &ProxyState,
    route: &Route,
    conn: &ConnectionInfo,
    host: &str,
    mut req: Request<Body>,
    trace: &mut Trace,
) -> Result<Response<Body>> {
    let selected = route.balancer.select(&state.health.view())?;
    trace.backend = Some(selected.address().to_string());

    let client_upgrade = hyper::upgrade::on(&mut req);
    let (mut parts, body) = req.into_parts();
    parts.uri = backend_uri(route, &selected, &parts.uri)?;
    parts.version = Version::HTTP_11;
    let upgrade = parts.headers.get(header::UPGRADE).cloned();
    strip_hop_by_hop(&mut parts.headers);
    prepare_request_headers(route, conn, host, selected.address(), &mut parts.headers);
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    if let Some(upgrade) = upgrade {
        parts.headers.insert(header::UPGRADE, upgrade);
    }

    debug!(rule = %route.id(), backend = %selected.address(), "Forwarding WebSocket upgrade");
    let mut response = send(state, route, &selected, Request::from_parts(parts, body)).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        apply_response_headers(route, &mut parts.headers);
        let body = relay_body(body, selected, state.timeouts.idle());
        return Ok(Response::from_parts(parts, body));
    }

    let backend_upgrade = hyper::upgrade::on(&mut response);
    let idle = state.timeouts.idle();
    let cancel = state.shutdown.force_token();
    let rule = route.id().to_string();
    let client = conn.peer;
    let tracked = state.shutdown.connections().track();

    tokio::spawn(async move {
        let _tracked = tracked;
        let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(rule = %rule, client = %client, error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let stats = relay(TokioIo::new(client_io), TokioIo::new(backend_io), idle, cancel).await;
        debug!(
            rule = %rule,
            client = %client,
            backend = %selected.address(),
            bytes_up = stats.client_to_backend,
            bytes_down = stats.backend_to_client,
            outcome = stats.outcome.as_str(),
            "WebSocket tunnel closed"
        );
    });

    let (mut parts, _) = response.into_parts();
    apply_response_headers(route, &mut parts.headers);
    Ok(Response::from_parts(parts, Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));
    }
}
