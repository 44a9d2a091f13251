//! Framework error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Agent '{0}' is not running")]
    NotRunning(String),

    #[error("Retry key already in flight: {0}")]
    RetryKeyInFlight(String),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Unknown {kind} value: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            WardenError::NotRunning("scorer".into()).to_string(),
            "Agent 'scorer' is not running"
        );
        let err = WardenError::InvalidTransition {
            from: "stopped".into(),
            to: "running".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from stopped to running"
        );
    }
}
