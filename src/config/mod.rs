//! Configuration module
//!
//! - types.rs: configuration types (Config, BridgeConfig, etc.)
//! - io.rs: layered loading from defaults, file and environment
//! - validation.rs: configuration validation
//! - paths.rs: configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{BridgeConfig, Config, LogFormat, LoggingConfig, ServerConfig};

pub use io::{env_overrides, load_config, load_layered, ENV_PREFIX};
pub use paths::{config_dir, config_path, CONFIG_PATH_ENV};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
