//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior, and the
//! reporter that receives errors once their retry budget is exhausted.

use thiserror::Error;
use tracing::error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A cache key that cannot be split into namespace and name
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// Caches did not complete their initial list
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    /// Selection criteria could not be evaluated
    #[error("Selection error: {0}")]
    Selection(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_) | Error::InvalidKey(_) => true,
            Error::CacheSync(_) | Error::Selection(_) | Error::Validation(_) => false,
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Receives errors for queue items that ran out of retries or cannot be retried.
///
/// The process keeps running after a report.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: &str, error: &Error);
}

/// Reporter that logs the dropped item.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, key: &str, error: &Error) {
        error!(key = %key, error = %error, "Dropping item out of the queue after retries");
    }
}
