//! Error types for the Ratekeeper service.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected input (non-positive rate/burst/cost, empty or reserved key).
    /// Raised before the store is touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store could not be reached or refused the command
    #[error("Store unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store handle was used after shutdown
    #[error("Store unavailable: connection closed")]
    StoreClosed,

    /// The round trip did not finish in time. The mutation may or may not
    /// have been applied, so the decision is unknown.
    #[error("Store operation timed out after {0:?}; outcome unknown")]
    Timeout(std::time::Duration),

    /// The atomic bucket step returned something other than `(allowed, remaining)`
    #[error("Malformed result from store: {0}")]
    MalformedResult(String),

    /// A stored rule record could not be decoded
    #[error("Corrupt rule for key {key}: {reason}")]
    CorruptRule { key: String, reason: String },

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    /// Whether the error means the store could not be consulted at all.
    ///
    /// This is the class of failure a fail-open or fail-closed policy
    /// applies to. Timeouts are included because the caller cannot know
    /// the outcome either way.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            RatekeeperError::Redis(_) | RatekeeperError::StoreClosed | RatekeeperError::Timeout(_)
        )
    }
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

impl From<RatekeeperError> for tonic::Status {
    fn from(err: RatekeeperError) -> Self {
        match &err {
            RatekeeperError::Validation(msg) => tonic::Status::invalid_argument(msg.clone()),
            RatekeeperError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            RatekeeperError::Redis(_) | RatekeeperError::StoreClosed => {
                tonic::Status::unavailable(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
