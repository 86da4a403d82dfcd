//! Sandbox bridge server
//!
//! Speaks the line protocol over stdin/stdout. Logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sandbox_bridge::config::{load_config, validate_config, LogFormat};
use sandbox_bridge::engine::QuickJsFactory;
use sandbox_bridge::logging::init_logging;
use sandbox_bridge::{server, VERSION};

#[derive(Parser)]
#[command(
    name = "sandbox-bridge",
    author = "Sandbox Bridge Contributors",
    version = VERSION,
    about = "Drive JavaScript sandboxes over line-delimited JSON on stdin/stdout",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "SANDBOX_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `sandbox_bridge=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Fail remote calls whose reply takes longer than this, e.g. `30s`
    #[arg(long, value_parser = parse_duration)]
    remote_call_timeout: Option<Duration>,

    /// Nesting limit for values crossing the boundary
    #[arg(long)]
    max_depth: Option<usize>,
}

fn parse_log_format(s: &str) -> std::result::Result<LogFormat, String> {
    s.parse().map_err(|e: sandbox_bridge::Error| e.to_string())
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(timeout) = cli.remote_call_timeout {
        config.bridge.remote_call_timeout = Some(timeout);
    }
    if let Some(depth) = cli.max_depth {
        config.bridge.max_depth = depth;
    }

    let validation = validate_config(&config);
    if !validation.valid {
        for issue in &validation.errors {
            eprintln!("config error: {}", issue);
        }
        bail!("Invalid configuration");
    }

    init_logging(&config.logging)?;
    for issue in &validation.warnings {
        warn!("{}", issue);
    }

    info!(
        "Starting sandbox bridge v{} (remote call timeout: {})",
        VERSION,
        config
            .bridge
            .remote_call_timeout
            .map(|t| humantime_serde::re::humantime::format_duration(t).to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    let factory = QuickJsFactory::new(config.bridge.max_depth);
    server::run(factory, &config, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Bridge stopped with an error")?;

    info!("Sandbox bridge stopped");
    // Stdin's blocking reader thread keeps the runtime alive until the peer
    // closes its end
    std::process::exit(0)
}
