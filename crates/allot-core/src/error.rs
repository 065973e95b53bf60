//! Unified error handling for allot-core

use thiserror::Error;

/// Core error type for allot-core
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid service definition, raised when a service is built
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The caller is the guest identity and the limit type excludes guests
    #[error("Guests cannot use {0}, please sign in")]
    GuestNotAllowed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The allowance for the current period is used up
    #[error("{limit_type} quota exhausted ({used}/{total})")]
    QuotaExceeded {
        limit_type: String,
        used: u32,
        total: u32,
    },

    /// Daily cap on ad grants reached
    #[error("Daily ad limit reached ({0} per day)")]
    AdLimitReached(u32),

    /// Ad grants are rate limited; retry after the given number of seconds
    #[error("Ad cooldown active, retry in {0}s")]
    AdCooldown(i64),

    /// Optimistic write lost against a concurrent commit
    #[error("Write conflict on document {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for allot-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Errors caused by the request itself (4xx-style)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::GuestNotAllowed(_)
                | Error::Validation(_)
                | Error::QuotaExceeded { .. }
                | Error::AdLimitReached(_)
                | Error::AdCooldown(_)
        )
    }

    /// Whether repeating the whole call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded { .. }
                | Error::AdCooldown(_)
                | Error::Conflict(_)
                | Error::Persistence(_)
                | Error::Database(_)
        )
    }
}

// Convert to String for callers that only surface messages
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
