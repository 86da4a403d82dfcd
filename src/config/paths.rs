//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SANDBOX_BRIDGE_CONFIG";

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("sandbox-bridge"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("sandbox-bridge"))
                .unwrap_or_else(|| PathBuf::from(".sandbox-bridge"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    config_dir().join("config.toml")
}
