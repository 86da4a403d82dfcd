//! Error types for the sandbox bridge

use thiserror::Error;

/// Result type alias using the bridge's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound line is not a structured message
    #[error("Decode error: {0}")]
    Decode(String),

    /// Handle, module, session or function reference not registered
    #[error("Index doesn't exist: {0}")]
    NotFound(String),

    /// Action name not recognized in the current routing context
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Session flavor not recognized by `create`
    #[error("Unknown VM type: {0}")]
    UnknownFlavor(String),

    /// Message is structurally valid but a field has the wrong shape
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The execution engine raised while running code
    #[error("{0}")]
    Engine(String),

    /// A remote call was rejected, timed out or lost its bridge
    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    /// A value has no wire projection
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if error is a client error (the request's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::UnknownAction(_)
                | Error::UnknownFlavor(_)
                | Error::InvalidInput(_)
                | Error::Decode(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::NotFound("7".into()).to_string(), "Index doesn't exist: 7");
        assert_eq!(Error::UnknownAction("fly".into()).to_string(), "Unknown action: fly");
        assert_eq!(Error::Engine("boom".into()).to_string(), "boom");
        assert_eq!(Error::UnknownFlavor("X".into()).to_string(), "Unknown VM type: X");
    }

    #[test]
    fn test_client_errors() {
        assert!(Error::NotFound("1".into()).is_client_error());
        assert!(!Error::Engine("x".into()).is_client_error());
        assert!(!Error::RemoteCall("x".into()).is_client_error());
    }
}
