//! Configuration validation
//!
//! Validates configuration and reports issues.

use std::fmt;

use tracing_subscriber::EnvFilter;

use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_bridge_config(config, result);
    result = validate_server_config(config, result);
    result = validate_logging_config(config, result);

    result
}

fn validate_bridge_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.bridge.max_depth == 0 {
        result = result.with_error(
            ValidationIssue::new("bridge.max_depth", "Depth limit of 0 rejects every value")
                .with_suggestion("Use the default of 128"),
        );
    }

    if config.bridge.remote_call_timeout.is_some_and(|t| t.is_zero()) {
        result = result.with_warning(
            ValidationIssue::new(
                "bridge.remote_call_timeout",
                "A zero timeout fails every remote call before its reply can arrive",
            )
            .with_suggestion("Remove the setting to wait forever, or use something like \"30s\""),
        );
    }

    result
}

fn validate_server_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.server.max_line_bytes == 0 {
        result = result.with_error(ValidationIssue::new(
            "server.max_line_bytes",
            "Line limit of 0 drops every message",
        ));
    }

    if config.server.drain_timeout.is_zero() {
        result = result.with_warning(
            ValidationIssue::new(
                "server.drain_timeout",
                "Responses still pending at close or end of input will be dropped",
            )
            .with_suggestion("Use something like \"30s\""),
        );
    }

    result
}

fn validate_logging_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if let Err(e) = EnvFilter::try_new(&config.logging.level) {
        result = result.with_error(
            ValidationIssue::new(
                "logging.level",
                format!("Invalid filter directive {:?}: {}", config.logging.level, e),
            )
            .with_suggestion("Use a level such as info or a directive such as sandbox_bridge=debug"),
        );
    }

    result
}
