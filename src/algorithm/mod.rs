//! Rate limiting strategy trait and implementations.
//!
//! This module defines the `Algorithm` trait and provides the three
//! strategies a plan can be enforced with.
//!
//! # Available Algorithms
//!
//! - **Fixed Window** (default): Simple counter per time window
//! - **Sliding Window**: Weighted blend of the current and previous window
//! - **Token Bucket**: Controlled bursts with refilling tokens
//!
//! One strategy is chosen globally by [`LimiterFactory`] and used for every
//! window of every plan.

mod factory;
mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use factory::{Limiter, LimiterConfig, LimiterFactory, SlidingWindowConfig};
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::{TokenBucket, TokenBucketConfig};

use std::future::Future;
use std::time::Duration;

use crate::decision::Decision;
use crate::error::Result;
use crate::storage::Storage;

/// Rate limiting algorithm trait.
///
/// Each algorithm provides different trade-offs between accuracy, storage
/// and burst handling. Strategies hold no request state; everything lives in
/// the storage backend.
///
/// # Algorithm Comparison
///
/// | Algorithm | Accuracy | Storage per key | Burst |
/// |-----------|----------|-----------------|-------|
/// | Fixed Window | Low | 1 counter | Up to 2x at boundaries |
/// | Sliding Window | Medium | 2 counters | Smoothed |
/// | Token Bucket | High | 1 bucket | Up to capacity |
pub trait Algorithm: Send + Sync + 'static {
    /// Get the algorithm name (for logging and headers).
    fn name(&self) -> &'static str;

    /// Count one request against `key` and decide whether it may pass.
    ///
    /// The request is counted even when it is denied.
    fn attempt<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Capacity left on `key` without counting anything.
    fn remaining<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Forget all state for `key`.
    fn reset<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        window: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        let _ = window;
        async move { storage.reset(key).await }
    }
}

/// Time until `reset_at`, as a retry hint.
pub(crate) fn retry_after(reset_at: u64, now: u64) -> Duration {
    Duration::from_secs(reset_at.saturating_sub(now))
}
