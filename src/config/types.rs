//! Configuration types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote call bridge and value codec
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Line transport
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long a remote call waits for its reply; `None` waits forever
    #[serde(default, with = "humantime_serde")]
    pub remote_call_timeout: Option<Duration>,
    /// Nesting limit for values crossing the boundary
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            remote_call_timeout: None,
            max_depth: default_max_depth(),
        }
    }
}

fn default_max_depth() -> usize {
    crate::codec::DEFAULT_MAX_DEPTH
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Inbound lines longer than this are dropped
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// How long unfinished responses may keep the bridge alive after
    /// `close` or end of input
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_line_bytes: default_max_line_bytes(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!(
                "Unknown log format: {} (expected pretty or json)",
                other
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}
