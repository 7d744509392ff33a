//! Token Bucket rate limiting algorithm.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithm::{Algorithm, retry_after};
use crate::clock::{Clock, SharedClock, system_clock};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::storage::{BucketSpec, Storage, bucket_key};

/// Token bucket shape.
///
/// Unset values are derived from the window being enforced: capacity falls
/// back to the window limit and the refill rate to `limit / window`, so the
/// long-run average matches the nominal limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Bucket capacity in tokens.
    pub burst_size: Option<u64>,
    /// Tokens added per second.
    pub refill_rate: Option<f64>,
    /// Tokens in a bucket seen for the first time. Full when unset.
    pub initial_tokens: Option<u64>,
}

impl TokenBucketConfig {
    /// Set the bucket capacity.
    pub fn with_burst_size(mut self, burst_size: u64) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    /// Set the refill rate in tokens per second.
    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = Some(refill_rate);
        self
    }

    /// Start new buckets with `tokens` instead of full.
    pub fn with_initial_tokens(mut self, tokens: u64) -> Self {
        self.initial_tokens = Some(tokens);
        self
    }

    /// The bucket enforced for `limit` requests per `window`.
    pub fn spec(&self, limit: u64, window: Duration) -> BucketSpec {
        let capacity = self.burst_size.unwrap_or(limit);
        let refill_rate = self
            .refill_rate
            .unwrap_or_else(|| limit as f64 / window.as_secs_f64().max(1.0));

        let spec = BucketSpec::new(capacity, refill_rate);
        match self.initial_tokens {
            Some(tokens) => spec.with_initial_tokens(tokens),
            None => spec,
        }
    }
}

/// Token Bucket rate limiting algorithm.
///
/// Allows controlled bursts while enforcing an average rate limit.
/// Tokens are refilled at a constant rate up to maximum capacity. The
/// refill-and-take step runs atomically inside the storage backend.
#[derive(Clone)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBucket {
    /// Create a token bucket whose shape follows each window's limit.
    pub fn new() -> Self {
        Self::with_config(TokenBucketConfig::default())
    }

    /// Create a token bucket with an explicit shape.
    pub fn with_config(config: TokenBucketConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the bucket configuration.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// A copy with the capacity and refill rate replaced where given.
    pub fn with_overrides(&self, burst_size: Option<u64>, refill_rate: Option<f64>) -> Self {
        let mut config = self.config;
        if burst_size.is_some() {
            config.burst_size = burst_size;
        }
        if refill_rate.is_some() {
            config.refill_rate = refill_rate;
        }
        Self {
            config,
            clock: self.clock.clone(),
        }
    }
}

impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn attempt<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        let spec = self.config.spec(limit, window);
        let result = storage.acquire_token(key, &spec).await?;

        let mut info = RateLimitInfo::new(spec.capacity, result.remaining(), result.reset_at)
            .with_algorithm(self.name())
            .with_metadata(
                DecisionMetadata::new()
                    .with_key(bucket_key(key))
                    .with_tokens_available(result.tokens),
            );

        if !result.allowed {
            info = info.with_retry_after(retry_after(result.reset_at, self.clock.now_secs()));
        }

        Ok(Decision::from_allowed(result.allowed, info))
    }

    async fn remaining<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        let spec = self.config.spec(limit, window);
        Ok(storage.peek_token(key, &spec).await?.remaining())
    }

    async fn reset<S: Storage>(&self, storage: &S, key: &str, _window: Duration) -> Result<bool> {
        storage.reset(&bucket_key(key)).await
    }
}
