//! Configuration I/O - Loading configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use config::Environment;
use tracing::debug;

use super::paths::{config_path, CONFIG_PATH_ENV};
use super::types::Config;
use crate::error::Result;

/// Prefix of environment overrides, e.g. `SANDBOX_BRIDGE__BRIDGE__MAX_DEPTH`
pub const ENV_PREFIX: &str = "SANDBOX_BRIDGE";

/// Load configuration with layered precedence:
/// 1. Defaults
/// 2. Config file: `path`, else `$SANDBOX_BRIDGE_CONFIG`, else the default
///    location when it exists
/// 3. Environment variable overrides (includes .env)
///
/// An explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let (file, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (config_path(), std::env::var_os(CONFIG_PATH_ENV).is_some()),
    };
    let file = (explicit || file.exists()).then_some(file);

    load_layered(file.as_deref(), env_overrides())
}

/// Environment source for overrides; `__` separates sections from keys
pub fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Layer an optional file and an environment source over the defaults
pub fn load_layered(file: Option<&Path>, env: Environment) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
        debug!(path = %file.display(), "Loading config file");
        builder = builder.add_source(config::File::from(file).required(true));
    }
    let settings = builder.add_source(env).build()?;
    Ok(settings.try_deserialize()?)
}
