//! Decision types for a single strategy attempt.
//!
//! A strategy answers one question for one counter: may this request pass,
//! and how much capacity is left. The engine merges one `Decision` per plan
//! window into [`RateLimits`](crate::engine::RateLimits).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The result of a single strategy attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request is allowed.
    allowed: bool,
    /// Rate limit information.
    info: RateLimitInfo,
}

impl Decision {
    /// Create a new "allowed" decision.
    pub fn allowed(info: RateLimitInfo) -> Self {
        Self {
            allowed: true,
            info,
        }
    }

    /// Create a new "denied" decision.
    pub fn denied(info: RateLimitInfo) -> Self {
        Self {
            allowed: false,
            info,
        }
    }

    /// Build an allowed or denied decision from a flag.
    pub fn from_allowed(allowed: bool, info: RateLimitInfo) -> Self {
        Self { allowed, info }
    }

    /// Check if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Check if the request is denied.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Get the rate limit info.
    pub fn info(&self) -> &RateLimitInfo {
        &self.info
    }

    /// Consume the decision and return the info.
    pub fn into_info(self) -> RateLimitInfo {
        self.info
    }
}

/// Capacity left on one counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    /// Maximum requests allowed.
    pub limit: u64,
    /// Remaining requests, never negative.
    pub remaining: u64,
    /// Unix seconds at which the counter resets.
    pub reset_at: u64,
    /// How long to wait before retrying (only set when denied).
    pub retry_after: Option<Duration>,
    /// Name of the strategy that made this decision.
    pub algorithm: Option<&'static str>,
    /// Strategy specific details.
    pub metadata: Option<DecisionMetadata>,
}

impl RateLimitInfo {
    /// Create a new rate limit info.
    pub fn new(limit: u64, remaining: u64, reset_at: u64) -> Self {
        Self {
            limit,
            remaining,
            reset_at,
            retry_after: None,
            algorithm: None,
            metadata: None,
        }
    }

    /// Set the retry-after duration.
    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    /// Set the algorithm name.
    pub fn with_algorithm(mut self, name: &'static str) -> Self {
        self.algorithm = Some(name);
        self
    }

    /// Set additional metadata.
    pub fn with_metadata(mut self, metadata: DecisionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Seconds from `now` until the counter resets.
    pub fn reset_after(&self, now: u64) -> u64 {
        self.reset_at.saturating_sub(now)
    }
}

/// Additional metadata about a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    /// Storage key the decision was made against.
    pub key: Option<String>,
    /// Raw count after the increment (fixed and sliding window).
    pub count: Option<u64>,
    /// Count carried over from the previous window (sliding window).
    pub previous_count: Option<u64>,
    /// Fractional tokens left (token bucket).
    pub tokens_available: Option<f64>,
}

impl DecisionMetadata {
    /// Create new empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the raw count.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Set the previous window count.
    pub fn with_previous_count(mut self, count: u64) -> Self {
        self.previous_count = Some(count);
        self
    }

    /// Set tokens available.
    pub fn with_tokens_available(mut self, tokens: f64) -> Self {
        self.tokens_available = Some(tokens);
        self
    }
}
