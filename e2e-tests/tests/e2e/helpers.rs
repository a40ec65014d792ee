use gateway_rs::access::GeoIpLookup;
use gateway_rs::gateway::Running;
use gateway_rs::{Gateway, GatewayConfig, RuleSet};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Knobs a scenario may turn before the gateway boots
#[derive(Default)]
pub struct EnvOptions {
    pub redirect_http_to_https: bool,
    pub geoip: Option<Arc<dyn GeoIpLookup>>,
}

/// A gateway running on ephemeral loopback ports
pub struct TestEnv {
    pub gateway: Arc<Gateway>,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    running: Option<Running>,
    _cert_dir: TempDir,
}

impl TestEnv {
    /// Boot a gateway with `rules` and default options
    pub async fn start(rules: &str) -> Result<Self, String> {
        Self::start_with(rules, EnvOptions::default()).await
    }

    pub async fn start_with(rules: &str, options: EnvOptions) -> Result<Self, String> {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "gateway_rs=debug".into()),
                )
                .with_test_writer()
                .try_init();
        });

        let cert_dir = tempfile::tempdir().map_err(|e| format!("Failed to create cert dir: {}", e))?;
        let mut config = GatewayConfig::development();
        config.server.http_addrs = vec!["127.0.0.1:0".to_string()];
        config.server.https_addrs = vec!["127.0.0.1:0".to_string()];
        config.server.redirect_http_to_https = options.redirect_http_to_https;
        config.server.shutdown_grace_secs = 1;
        config.timeouts.response_secs = 5;
        config.tls.cert_dir = cert_dir.path().to_path_buf();
        config.health.enabled = false;
        config.watch_rules = false;
        config.rules_path = None;

        let rules = RuleSet::from_toml(rules).map_err(|e| format!("Invalid rules: {}", e))?;
        let gateway = match options.geoip {
            Some(geoip) => Gateway::with_geoip(config, &rules, geoip),
            None => Gateway::new(config, &rules),
        }
        .map_err(|e| format!("Failed to build gateway: {}", e))?;
        let gateway = Arc::new(gateway);

        let running = gateway
            .start()
            .await
            .map_err(|e| format!("Failed to start gateway: {}", e))?;
        let http_addr = running.http_addrs[0];
        let https_addr = running.https_addrs[0];
        println!("🚀 Gateway listening on http://{} and https://{}", http_addr, https_addr);

        Ok(Self {
            gateway,
            http_addr,
            https_addr,
            running: Some(running),
            _cert_dir: cert_dir,
        })
    }

    /// Client that never follows redirects and trusts the self-signed default
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client")
    }

    /// Plain HTTP request for `host` + `path`
    pub async fn get(&self, host: &str, path: &str) -> Result<reqwest::Response, String> {
        self.client()
            .get(format!("http://{}{}", self.http_addr, path))
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .map_err(|e| format!("Request to {}{} failed: {}", host, path, e))
    }

    /// HTTPS request with SNI set to `host`
    pub async fn get_tls(&self, host: &str, path: &str) -> Result<reqwest::Response, String> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .resolve(host, self.https_addr)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("Failed to build TLS client: {}", e))?
            .get(format!("https://{}:{}{}", host, self.https_addr.port(), path))
            .send()
            .await
            .map_err(|e| format!("TLS request to {}{} failed: {}", host, path, e))
    }

    /// Swap in a new rule set
    pub async fn reload(&self, rules: &str) -> Result<u64, String> {
        let rules = RuleSet::from_toml(rules).map_err(|e| format!("Invalid rules: {}", e))?;
        self.gateway
            .reload(&rules)
            .await
            .map_err(|e| format!("Reload rejected: {}", e))
    }

    /// Drain and stop the gateway
    pub async fn stop(mut self) {
        if let Some(running) = self.running.take() {
            self.gateway.stop(running).await;
        }
    }
}

/// Test result helper
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub duration: Duration,
}

impl TestResult {
    pub fn success(name: String, duration: Duration) -> Self {
        Self {
            name,
            passed: true,
            message: "✅ Test passed".to_string(),
            duration,
        }
    }

    pub fn failure(name: String, message: String, duration: Duration) -> Self {
        Self {
            name,
            passed: false,
            message: format!("❌ Test failed: {}", message),
            duration,
        }
    }

    pub fn print(&self) {
        println!("\n{}", "=".repeat(80));
        println!("📝 Test: {}", self.name);
        println!("⏱️  Duration: {:?}", self.duration);
        println!("{}", self.message);
        println!("{}", "=".repeat(80));
    }
}

/// Unwrap a step result, printing a failure report before panicking
pub fn step<T>(name: &str, started: Instant, result: Result<T, String>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            TestResult::failure(name.to_string(), e.clone(), started.elapsed()).print();
            panic!("{}", e);
        }
    }
}

/// JSON body describing the request a mock backend saw
pub async fn backend_view(response: reqwest::Response) -> Result<serde_json::Value, String> {
    response
        .json()
        .await
        .map_err(|e| format!("Backend answered with invalid JSON: {}", e))
}
