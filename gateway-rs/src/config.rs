//! Configuration for gateway-rs
//!
//! Process-level settings only. Routing rules live in their own file (see
//! [`crate::rules::RuleSet`]) so they can be reloaded without a restart.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Prefix for environment overrides, e.g. `GATEWAY__ACME__EMAIL`
pub const ENV_PREFIX: &str = "GATEWAY";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub tls: TlsConfig,
    pub acme: AcmeConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
    /// Rule set file
    pub rules_path: Option<PathBuf>,
    /// Reload rules when the file changes
    pub watch_rules: bool,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP bind addresses
    pub http_addrs: Vec<String>,
    /// HTTPS bind addresses
    pub https_addrs: Vec<String>,
    /// Answer plain HTTP with a redirect to HTTPS (ACME challenges excepted)
    pub redirect_http_to_https: bool,
    /// Time in-flight connections get to finish on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addrs: vec!["0.0.0.0:80".to_string()],
            https_addrs: Vec::new(),
            redirect_http_to_https: false,
            shutdown_grace_secs: 10,
        }
    }
}

/// Backend timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend TCP connect and TLS handshake
    pub connect_secs: u64,
    /// Waiting for backend response headers
    pub response_secs: u64,
    /// Idle keep-alive connections, client and backend side
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            response_secs: 60,
            idle_secs: 90,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn response(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Certificate store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding `<domain>.pem` / `<domain>.key` pairs
    pub cert_dir: PathBuf,
    /// Certificate presented when no SNI entry matches
    pub default_cert: Option<PathBuf>,
    pub default_key: Option<PathBuf>,
    /// Generate a self-signed default when none is configured
    pub self_signed_fallback: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("./conf/certs"),
            default_cert: None,
            default_key: None,
            self_signed_fallback: true,
        }
    }
}

/// ACME configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcmeConfig {
    pub enabled: bool,
    /// Contact email for the ACME account
    pub email: Option<String>,
    /// ACME directory URL
    pub directory: String,
    /// Domains kept issued and renewed
    pub domains: Vec<String>,
    /// Renewal scan interval
    pub check_interval_secs: u64,
    /// Renew when fewer days than this remain
    pub early_renew_days: i64,
    /// Attempts per lifecycle before giving up until the next scan
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory: default_acme_directory(),
            domains: Vec::new(),
            check_interval_secs: 86400,
            early_renew_days: 30,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
        }
    }
}

/// Active health probing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Number of failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of successes before marking healthy again
    pub success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

/// Log output
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "gateway_rs=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load a TOML file layered with `GATEWAY__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.http_addrs")
                    .with_list_parse_key("server.https_addrs")
                    .with_list_parse_key("acme.domains")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<GatewayConfig>())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                http_addrs: vec!["127.0.0.1:8080".to_string()],
                https_addrs: vec!["127.0.0.1:8443".to_string()],
                redirect_http_to_https: false,
                shutdown_grace_secs: 5,
            },
            tls: TlsConfig {
                cert_dir: PathBuf::from("./conf/certs"),
                ..TlsConfig::default()
            },
            rules_path: Some(PathBuf::from("./conf/rules.toml")),
            watch_rules: true,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.http_addrs.is_empty() && self.server.https_addrs.is_empty() {
            return Err(GatewayError::Config("No listener configured".to_string()));
        }

        for addr in self.server.http_addrs.iter().chain(&self.server.https_addrs) {
            addr.parse::<SocketAddr>().map_err(|e| {
                GatewayError::Config(format!("Invalid listen address '{}': {}", addr, e))
            })?;
        }

        if self.timeouts.connect_secs == 0 || self.timeouts.response_secs == 0 || self.timeouts.idle_secs == 0 {
            return Err(GatewayError::Config("Timeouts must be positive".to_string()));
        }

        if self.tls.default_cert.is_some() != self.tls.default_key.is_some() {
            return Err(GatewayError::Config(
                "default_cert and default_key must be set together".to_string(),
            ));
        }

        if self.acme.enabled {
            url::Url::parse(&self.acme.directory).map_err(|e| {
                GatewayError::Config(format!("Invalid ACME directory '{}': {}", self.acme.directory, e))
            })?;
            if self.acme.check_interval_secs == 0 || self.acme.max_attempts == 0 {
                return Err(GatewayError::Config(
                    "ACME check interval and attempts must be positive".to_string(),
                ));
            }
        }

        if self.health.enabled && self.health.interval_secs == 0 {
            return Err(GatewayError::Config("Health interval must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.http_addrs, vec!["0.0.0.0:80"]);
        assert_eq!(config.acme.check_interval_secs, 86400);
        assert_eq!(config.acme.early_renew_days, 30);
        assert!(config.validate().is_ok());
        assert!(GatewayConfig::development().validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
http_addrs = ["0.0.0.0:80"]
https_addrs = ["0.0.0.0:443"]
redirect_http_to_https = true

[timeouts]
response_secs = 15

[acme]
enabled = true
email = "admin@example.com"
domains = ["a.example.com"]

[logging]
format = "json"
"#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.https_addrs, vec!["0.0.0.0:443"]);
        assert!(config.server.redirect_http_to_https);
        assert_eq!(config.timeouts.response_secs, 15);
        assert_eq!(config.timeouts.connect_secs, 5);
        assert_eq!(config.acme.max_attempts, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = GatewayConfig::default();
        config.server.http_addrs = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.tls.default_cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.timeouts.idle_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[server]\nhttp_addrs = [\"127.0.0.1:8081\"]\n\n[health]\nenabled = false").unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.http_addrs, vec!["127.0.0.1:8081"]);
        assert!(!config.health.enabled);
        assert_eq!(config.timeouts.response_secs, 60);

        let direct = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(direct.server.http_addrs, config.server.http_addrs);
    }
}
