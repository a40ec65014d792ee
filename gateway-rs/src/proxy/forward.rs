//! Forwarding to HTTP(S) backends

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, Uri, Version};
use axum::BoxError;
use futures_util::{stream, StreamExt};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::balancer::EndpointGuard;
use crate::config::TimeoutConfig;
use crate::error::{GatewayError, Result};
use crate::router::Route;
use crate::rules::Protocol;
use super::dispatch::Trace;
use super::{ConnectionInfo, ProxyState};

/// HTTP client type for forwarding requests
pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Pooled clients for backend traffic
#[derive(Clone)]
pub struct BackendClients {
    verified: HttpClient,
    /// For rules with `tls_skip_verify`
    insecure: HttpClient,
}

impl BackendClients {
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verified = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let insecure = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        Ok(Self {
            verified: build_client(verified, timeouts),
            insecure: build_client(insecure, timeouts),
        })
    }

    pub(crate) fn for_route(&self, route: &Route) -> &HttpClient {
        if route.rule.options.tls_skip_verify {
            &self.insecure
        } else {
            &self.verified
        }
    }
}

fn build_client(tls: ClientConfig, timeouts: &TimeoutConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(timeouts.connect()));

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(timeouts.idle())
        .build(connector)
}

/// Certificate verifier that accepts all certificates without validation.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Forward one request to a backend of `route`
pub(crate) async fn forward(
    state: &ProxyState,
    route: &Route,
    conn: &ConnectionInfo,
    host: &str,
    req: Request<Body>,
    trace: &mut Trace,
) -> Result<Response<Body>> {
    let selected = route.balancer.select(&state.health.view())?;
    trace.backend = Some(selected.address().to_string());

    let (mut parts, body) = req.into_parts();
    parts.uri = backend_uri(route, &selected, &parts.uri)?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    prepare_request_headers(route, conn, host, selected.address(), &mut parts.headers);

    debug!(rule = %route.id(), backend = %selected.address(), uri = %parts.uri, "Forwarding request");
    let response = send(state, route, &selected, Request::from_parts(parts, body)).await?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    apply_response_headers(route, &mut parts.headers);

    let body = relay_body(body, selected, state.timeouts.idle());
    Ok(Response::from_parts(parts, body))
}

/// Stream the backend body to the client.
///
/// The endpoint counts as busy until the body ends. A backend that sends
/// nothing for `idle` ends the body with an error, which releases the
/// endpoint and aborts the client response.
pub(crate) fn relay_body(body: hyper::body::Incoming, guard: EndpointGuard, idle: Duration) -> Body {
    let frames = Body::new(body).into_data_stream();
    let relayed = stream::unfold(Some((frames, guard)), move |state| async move {
        let (mut frames, guard) = state?;
        match tokio::time::timeout(idle, frames.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some((frames, guard)))),
            Ok(Some(Err(e))) => Some((Err(BoxError::from(e)), None)),
            Ok(None) => None,
            Err(_) => {
                warn!(backend = %guard.address(), idle_secs = idle.as_secs(), "Backend body stalled");
                let stalled = GatewayError::BackendTimeout {
                    backend: guard.address().to_string(),
                    timeout_secs: idle.as_secs(),
                };
                Some((Err(BoxError::from(stalled)), None))
            }
        }
    });
    Body::from_stream(relayed)
}

/// Send `req` with the route's response timeout
pub(crate) async fn send(
    state: &ProxyState,
    route: &Route,
    selected: &EndpointGuard,
    req: Request<Body>,
) -> Result<Response<hyper::body::Incoming>> {
    let timeout = route
        .rule
        .options
        .response_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.timeouts.response());

    match tokio::time::timeout(timeout, state.clients.for_route(route).request(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(GatewayError::BackendUnreachable {
            backend: selected.address().to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(GatewayError::BackendTimeout {
            backend: selected.address().to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

pub(crate) fn backend_uri(route: &Route, selected: &EndpointGuard, original: &Uri) -> Result<Uri> {
    let scheme = match selected.endpoint().spec().protocol {
        Protocol::Https => "https",
        _ => "http",
    };
    let query = original.query().map(|q| format!("?{}", q)).unwrap_or_default();
    let forward = format!(
        "{}://{}{}{}",
        scheme,
        selected.address(),
        route.forward_path(original.path()),
        query
    );
    forward
        .parse()
        .map_err(|e| GatewayError::Http(format!("Invalid forward URI '{}': {}", forward, e)))
}

/// Remove hop-by-hop headers, including any the `Connection` header lists
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in &listed {
        headers.remove(name.as_str());
    }
}

/// Host, X-Forwarded-* and the rule's own request header edits
pub(crate) fn prepare_request_headers(
    route: &Route,
    conn: &ConnectionInfo,
    host: &str,
    backend: &str,
    headers: &mut HeaderMap,
) {
    let options = &route.rule.options;
    let upstream_host = if options.preserve_host { host } else { backend };
    set(headers, header::HOST, upstream_host);

    let client_ip = conn.peer.ip().to_string();
    append(headers, HeaderName::from_static("x-forwarded-for"), &client_ip);
    if !headers.contains_key("x-real-ip") {
        set(headers, HeaderName::from_static("x-real-ip"), &client_ip);
    }
    append(
        headers,
        HeaderName::from_static("x-forwarded-proto"),
        if conn.tls { "https" } else { "http" },
    );
    append(headers, HeaderName::from_static("x-forwarded-host"), host);

    for name in &options.strip_request_headers {
        headers.remove(name.as_str());
    }
    for (name, value) in &options.request_headers {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            set(headers, name, value);
        }
    }
}

pub(crate) fn apply_response_headers(route: &Route, headers: &mut HeaderMap) {
    let options = &route.rule.options;
    for name in &options.strip_response_headers {
        headers.remove(name.as_str());
    }
    for (name, value) in &options.response_headers {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            set(headers, name, value);
        }
    }
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Extend a comma-separated forwarding chain with this hop
fn append(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let chained = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, value),
        _ => value.to_string(),
    };
    set(headers, name, &chained);
}
