//! Error types for runtime handlers

use thiserror::Error;

/// Errors a handler can raise while processing a snapshot
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Build an `InvalidInput` error for a snapshot field
    pub fn invalid_field(key: &str, reason: impl std::fmt::Display) -> Self {
        HandlerError::InvalidInput(format!("{}: {}", key, reason))
    }
}
