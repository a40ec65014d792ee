//! Error types for gateway-rs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Rule set rejected at load or reload
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No rule matches the request
    #[error("No rule found for {host}{path}")]
    NotFound { host: String, path: String },

    /// Every endpoint of the rule is unhealthy
    #[error("No healthy backend for rule {rule}")]
    NoHealthyBackend { rule: String },

    /// Backend connect or handshake failed
    #[error("Backend {backend} unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    /// Backend did not answer within the response timeout
    #[error("Backend {backend} timed out after {timeout_secs}s")]
    BackendTimeout { backend: String, timeout_secs: u64 },

    /// Rejected by the access controller
    #[error("Access denied for {client}")]
    AccessDenied { client: String },

    /// No certificate resolves for the requested server name
    #[error("No certificate available for {host}")]
    CertificateUnavailable { host: String },

    /// ACME issuance or renewal gave up after its retry budget
    #[error("ACME challenge failed for {domain} after {attempts} attempts: {reason}")]
    AcmeChallengeFailed {
        domain: String,
        attempts: u32,
        reason: String,
    },
}

impl GatewayError {
    /// HTTP status returned to the client for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoHealthyBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind used in request events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Io(_) => "io",
            GatewayError::Http(_) => "http",
            GatewayError::Tls(_) => "tls",
            GatewayError::Validation(_) => "validation",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::NoHealthyBackend { .. } => "no_healthy_backend",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::AccessDenied { .. } => "access_denied",
            GatewayError::CertificateUnavailable { .. } => "certificate_unavailable",
            GatewayError::AcmeChallengeFailed { .. } => "acme_challenge_failed",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let text = status.canonical_reason().unwrap_or("Error");
        (status, text).into_response()
    }
}

/// Every problem found while validating a rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    issues: Vec<String>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one problem, prefixed with the rule it belongs to.
    pub fn push(&mut self, context: impl fmt::Display, message: impl fmt::Display) {
        self.issues.push(format!("{}: {}", context, message));
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> std::result::Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid rule set ({} issues): {}", self.issues.len(), self.issues.join("; "))
    }
}

impl std::error::Error for ValidationError {}
