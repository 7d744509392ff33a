//! Strategy selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::{Algorithm, FixedWindow, SlidingWindow, TokenBucket, TokenBucketConfig};
use crate::clock::{SharedClock, system_clock};
use crate::decision::Decision;
use crate::error::{ConfigError, Result};
use crate::plan::Plan;
use crate::storage::Storage;

/// Sliding window switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingWindowConfig {
    /// Prefer the sliding window over every other strategy.
    pub enabled: bool,
}

/// Token bucket switch and shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketSettings {
    /// Prefer the token bucket over the fixed window.
    pub enabled: bool,
    /// Bucket shape.
    #[serde(flatten)]
    pub bucket: TokenBucketConfig,
}

/// Strategy part of the throttle configuration.
///
/// An explicit `algorithm` name wins. Otherwise the sliding window is used
/// when enabled, then the token bucket, then the fixed window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Explicit strategy name.
    pub algorithm: Option<String>,
    /// Sliding window settings.
    pub sliding_window: SlidingWindowConfig,
    /// Token bucket settings.
    pub token_bucket: TokenBucketSettings,
}

/// The strategy enforcing every window.
#[derive(Debug, Clone)]
pub enum Limiter {
    /// Fixed window counters.
    Fixed(FixedWindow),
    /// Weighted sliding window counters.
    Sliding(SlidingWindow),
    /// Token buckets.
    Token(TokenBucket),
}

impl Default for Limiter {
    fn default() -> Self {
        Self::Fixed(FixedWindow::new())
    }
}

impl Limiter {
    /// The limiter to use for `plan`.
    ///
    /// A token bucket takes the plan's `burst_size` and `burst_refill_rate`
    /// when they are set. Other strategies are returned unchanged.
    pub fn for_plan(&self, plan: &Plan) -> Self {
        match self {
            Self::Token(bucket) => {
                Self::Token(bucket.with_overrides(plan.burst_size, plan.burst_refill_rate))
            }
            other => other.clone(),
        }
    }
}

impl Algorithm for Limiter {
    fn name(&self) -> &'static str {
        match self {
            Self::Fixed(a) => a.name(),
            Self::Sliding(a) => a.name(),
            Self::Token(a) => a.name(),
        }
    }

    async fn attempt<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        match self {
            Self::Fixed(a) => a.attempt(storage, key, limit, window).await,
            Self::Sliding(a) => a.attempt(storage, key, limit, window).await,
            Self::Token(a) => a.attempt(storage, key, limit, window).await,
        }
    }

    async fn remaining<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        match self {
            Self::Fixed(a) => a.remaining(storage, key, limit, window).await,
            Self::Sliding(a) => a.remaining(storage, key, limit, window).await,
            Self::Token(a) => a.remaining(storage, key, limit, window).await,
        }
    }

    async fn reset<S: Storage>(&self, storage: &S, key: &str, window: Duration) -> Result<bool> {
        match self {
            Self::Fixed(a) => a.reset(storage, key, window).await,
            Self::Sliding(a) => a.reset(storage, key, window).await,
            Self::Token(a) => a.reset(storage, key, window).await,
        }
    }
}

/// Builds the configured [`Limiter`].
#[derive(Clone)]
pub struct LimiterFactory {
    config: LimiterConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for LimiterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterFactory")
            .field("config", &self.config)
            .finish()
    }
}

impl LimiterFactory {
    /// Create a factory for `config`.
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
        }
    }

    /// Give built limiters `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Name of the strategy the configuration selects.
    pub fn resolve_algorithm(&self) -> &str {
        if let Some(name) = &self.config.algorithm {
            name.as_str()
        } else if self.config.sliding_window.enabled {
            "sliding_window"
        } else if self.config.token_bucket.enabled {
            "token_bucket"
        } else {
            "fixed_window"
        }
    }

    /// Build the configured limiter.
    pub fn build(&self) -> Result<Limiter> {
        self.make(self.resolve_algorithm())
    }

    /// Build a limiter by name.
    ///
    /// Accepts `fixed_window`/`fixed`, `sliding_window`/`sliding` and
    /// `token_bucket`/`bucket`.
    pub fn make(&self, name: &str) -> Result<Limiter> {
        let limiter = match name {
            "fixed_window" | "fixed" => Limiter::Fixed(FixedWindow::with_clock(self.clock.clone())),
            "sliding_window" | "sliding" => {
                Limiter::Sliding(SlidingWindow::with_clock(self.clock.clone()))
            }
            "token_bucket" | "bucket" => {
                let bucket = self.config.token_bucket.bucket;
                if let Some(rate) = bucket.refill_rate {
                    if !(rate > 0.0 && rate.is_finite()) {
                        return Err(ConfigError::InvalidValue(format!(
                            "token_bucket.refill_rate must be positive, got {rate}"
                        ))
                        .into());
                    }
                }
                Limiter::Token(TokenBucket::with_config(bucket).with_clock(self.clock.clone()))
            }
            other => return Err(ConfigError::UnsupportedAlgorithm(other.to_string()).into()),
        };

        debug!(algorithm = limiter.name(), "Limiter selected");
        Ok(limiter)
    }

    /// Every strategy name with a one-line description.
    pub fn available_algorithms() -> &'static [(&'static str, &'static str)] {
        &[
            (
                "fixed_window",
                "Fixed Window - Simple counter with discrete time windows",
            ),
            (
                "sliding_window",
                "Sliding Window - Weighted average across windows for smoother limiting",
            ),
            (
                "token_bucket",
                "Token Bucket - Allows bursts while maintaining average rate",
            ),
        ]
    }
}
