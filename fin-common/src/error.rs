//! Error types for the Fin alerts stack.

use thiserror::Error;

/// Result type alias using the common error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for configuration and shared plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error; fatal, a run must not start with broken config
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if this is a configuration error.
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
