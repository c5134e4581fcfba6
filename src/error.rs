//! Error types for the docgate governor

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the governor
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Quota / Admission Errors
    // =========================================================================
    /// Admission denied for the current window or day
    #[error("Quota exceeded for {scope}: {reason}")]
    QuotaExceeded { scope: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Network or server failure talking to the document store
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend call abandoned after its timeout elapsed
    #[error("Backend call '{operation}' timed out after {timeout:?}")]
    BackendTimeout {
        operation: String,
        timeout: Duration,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Attempted to cache an undefined/sentinel value
    #[error("Refusing to cache undefined value for key {key}")]
    InvalidCacheValue { key: String },

    // =========================================================================
    // Batcher Errors
    // =========================================================================
    /// Queued writes failed after all retries
    #[error("Batch commit failed for {collection}/{id} after {attempts} attempts: {reason}")]
    BatchCommitFailed {
        collection: String,
        id: String,
        attempts: u32,
        reason: String,
    },

    /// Governor is shutting down and no longer accepts work
    #[error("Governor is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Listener Errors
    // =========================================================================
    /// Subscribe rejected because the listener cap is reached
    #[error("Listener limit reached: {active} active, maximum {max}")]
    ListenerLimitReached { active: usize, max: usize },

    // =========================================================================
    // Configuration / Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a quota error for a scope.
    pub fn quota(scope: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::QuotaExceeded {
            scope: scope.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BackendUnavailable(_) | Error::BackendTimeout { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
