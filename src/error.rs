//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counting store could not be reached, or did not answer in time
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A token-identified request has no registered personalized limit
    #[error("Token not found: {0}")]
    TokenNotFound(String),

    /// A stored token limit record could not be parsed
    #[error("Malformed limit record for token {token}: {source}")]
    MalformedRecord {
        token: String,
        #[source]
        source: serde_json::Error,
    },

    /// An identity value was empty
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TollgateError {
    fn from(err: ::config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
