//! Error types for the failsafe primitives

use thiserror::Error;

/// Result type alias for failsafe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failsafe errors
#[derive(Error, Debug)]
pub enum Error {
    /// An endpoint selector was given no endpoints
    #[error("Endpoint list cannot be empty")]
    EmptyEndpointList,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A timer or background task was requested outside a tokio runtime
    #[error("No tokio runtime available to schedule background work")]
    NoRuntime,

    /// The rate limiter store has been closed
    #[error("Rate limiter is closed")]
    Closed,

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::EmptyEndpointList.to_string(),
            "Endpoint list cannot be empty"
        );
        assert_eq!(
            Error::Config("tokens must be > 0".to_string()).to_string(),
            "Configuration error: tokens must be > 0"
        );
        assert_eq!(Error::Closed.to_string(), "Rate limiter is closed");
    }
}
