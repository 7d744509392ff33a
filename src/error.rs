//! Error types for throttling operations.
//!
//! Only genuine failures live here. A request that is over its rate limit or
//! quota is not an error: it is reported through [`RateLimits::is_limited`]
//! and [`QuotaInfo::is_exceeded`] so the hot path never builds an error value.
//!
//! [`RateLimits::is_limited`]: crate::engine::RateLimits::is_limited
//! [`QuotaInfo::is_exceeded`]: crate::quota::QuotaInfo::is_exceeded

use std::time::Duration;
use thiserror::Error;

/// Result type for throttling operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Main error type for throttling operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Key extraction error.
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    /// Connection error (e.g., Redis connection failed).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimitError {
    /// Whether this error means the backing store could not be reached.
    ///
    /// These are the failures the engine's failure policy applies to.
    pub fn is_storage_unavailable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_unavailable(),
            Self::Connection(_) => true,
            _ => false,
        }
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or timed out.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Generic storage operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Create a new unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::Unavailable(_) | Self::PoolExhausted => true,
            Self::Serialization(_) => false,
        }
    }

    /// Check if the backend is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::PoolExhausted)
    }
}

/// Configuration-related errors.
///
/// All of these are raised while loading configuration or building the
/// engine, never while evaluating a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown limiter strategy name.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A plan definition could not be understood.
    #[error("Invalid plan configuration for '{plan}': {reason}")]
    InvalidPlan {
        /// Plan name.
        plan: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A plan name that is not in the plan table.
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    /// Invalid storage configuration.
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    /// A value is out of its allowed range.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Create an invalid plan error.
    pub fn invalid_plan(plan: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            plan: plan.into(),
            reason: reason.into(),
        }
    }
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
}
