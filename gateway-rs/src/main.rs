//! gateway-rs: HTTP(S) and stream gateway
//!
//! Loads the process configuration and the rule set, then serves until
//! SIGINT or SIGTERM.

use clap::Parser;
use gateway_rs::config::LogFormat;
use gateway_rs::{Gateway, GatewayConfig, RuleSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gateway-rs", version, about = "Self-hosted HTTP(S) and TCP/UDP gateway")]
struct Args {
    /// Gateway configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule set file, overrides `rules_path` from the configuration
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Validate configuration and rules, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    init_logging(&config);

    info!("Starting gateway-rs v{}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!(path = ?path, "Configuration loaded"),
        None => info!("No config file specified, using defaults and environment"),
    }

    if let Some(rules) = args.rules {
        config.rules_path = Some(rules);
    }
    let rules = match &config.rules_path {
        Some(path) if path.exists() => RuleSet::from_file(path)?,
        Some(path) => {
            info!(path = ?path, "Rules file not found, starting with no rules");
            RuleSet::default()
        }
        None => RuleSet::default(),
    };

    if args.check {
        config.validate()?;
        rules.validate()?;
        info!(
            proxy = rules.proxy.len(),
            redirect = rules.redirect.len(),
            stream = rules.stream.len(),
            "Configuration and rules are valid"
        );
        return Ok(());
    }

    let gateway = Arc::new(Gateway::new(config, &rules)?);
    gateway.run().await?;

    Ok(())
}

fn init_logging(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}
