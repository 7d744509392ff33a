//! Storage driver trait and implementations.
//!
//! The [`Storage`] trait is the only way the rest of the crate touches
//! counters, buckets and quotas. Backends own the physical layout.
//!
//! # Atomicity
//!
//! [`Storage::increment`] and [`Storage::acquire_token`] must behave as if
//! serialized per key: two concurrent callers never both see the first count
//! or take the same token. Operations on different keys are unordered.
//!
//! Counting is fail-forward. If a caller is cancelled after an increment has
//! landed in the store, the increment stays.
//!
//! # Backends
//!
//! | Backend | Feature | Atomicity |
//! |---------|---------|-----------|
//! | [`MemoryStorage`] | `memory` | per-key shard lock |
//! | [`RedisStorage`] | `redis` | Lua scripts |
//! | [`DatabaseStorage`] | `database` | upserts and immediate transactions |

mod any;
#[cfg(feature = "database")]
mod database;
#[cfg(feature = "memory")]
mod memory_gc;
#[cfg(feature = "redis")]
mod redis_cluster;
mod types;

pub use any::{
    AnyStorage, DatabaseSettings, RedisSettings, StorageConfig, StorageDriver, TableSettings,
};
pub use types::{
    AnalyticsPeriod, AnalyticsRecord, BucketSpec, BucketState, QuotaPeriod, Retention,
    TokenResult, WindowResult, hour_start,
};

#[cfg(feature = "database")]
pub use database::{DatabaseConfig, DatabaseStorage, DatabaseTables};

#[cfg(feature = "memory")]
pub use memory_gc::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use redis_cluster::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Namespace prefix for token bucket state.
const BUCKET_NAMESPACE: &str = "bucket:";

/// The storage key under which the bucket for `key` lives.
///
/// Passing this to [`Storage::reset`] discards the bucket.
pub fn bucket_key(key: &str) -> String {
    format!("{BUCKET_NAMESPACE}{key}")
}

/// Storage driver for rate limiting and quota state.
///
/// All operations are async so local and networked backends share one
/// contract. Implementations must be safe to share between tasks without
/// external locking.
pub trait Storage: Send + Sync + 'static {
    /// Atomically increment a window counter.
    ///
    /// A missing or expired key restarts at 1 with a reset time of
    /// `now + window`.
    fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> impl Future<Output = Result<WindowResult>> + Send;

    /// Read a counter without changing it. `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Seconds until the key expires, 0 if absent or unknown.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Forget a key. Returns whether it existed.
    fn reset(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically refill the bucket for `key` and take one token.
    fn acquire_token(
        &self,
        key: &str,
        spec: &BucketSpec,
    ) -> impl Future<Output = Result<TokenResult>> + Send;

    /// Read the bucket for `key` as it would be refilled now, without
    /// taking a token or writing anything.
    fn peek_token(
        &self,
        key: &str,
        spec: &BucketSpec,
    ) -> impl Future<Output = Result<TokenResult>> + Send;

    /// Add `cost` to the quota counter for `key` in `period`.
    ///
    /// Returns the new total for the period.
    fn increment_quota(
        &self,
        key: &str,
        cost: u64,
        period: &QuotaPeriod,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Quota used by `key` in `period`, 0 if nothing was recorded.
    fn get_quota(
        &self,
        key: &str,
        period: &QuotaPeriod,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Drop every quota record for `key`. Returns whether any existed.
    fn reset_quota(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Overwrite the quota used by `key` in `period`.
    ///
    /// The record expires with the period.
    fn set_quota(
        &self,
        key: &str,
        value: u64,
        period: &QuotaPeriod,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically lower the quota used by `key` in `period` by `amount`,
    /// clamped at zero. Returns the new usage; 0 when nothing was recorded.
    fn release_quota(
        &self,
        key: &str,
        amount: u64,
        period: &QuotaPeriod,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Record one request for usage analytics. Best effort.
    fn record_analytics(
        &self,
        key: &str,
        plan: &str,
        endpoint: &str,
        limited: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Most recent analytics rollups, newest first.
    fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<AnalyticsRecord>>> + Send;

    /// Purge state older than `retention` allows. Returns how many records
    /// were removed.
    fn cleanup(&self, retention: &Retention) -> impl Future<Output = Result<u64>> + Send;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowResult> {
        (**self).increment(key, window).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        (**self).get(key).await
    }

    async fn ttl(&self, key: &str) -> Result<u64> {
        (**self).ttl(key).await
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        (**self).reset(key).await
    }

    async fn acquire_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        (**self).acquire_token(key, spec).await
    }

    async fn peek_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        (**self).peek_token(key, spec).await
    }

    async fn increment_quota(&self, key: &str, cost: u64, period: &QuotaPeriod) -> Result<u64> {
        (**self).increment_quota(key, cost, period).await
    }

    async fn get_quota(&self, key: &str, period: &QuotaPeriod) -> Result<u64> {
        (**self).get_quota(key, period).await
    }

    async fn reset_quota(&self, key: &str) -> Result<bool> {
        (**self).reset_quota(key).await
    }

    async fn set_quota(&self, key: &str, value: u64, period: &QuotaPeriod) -> Result<bool> {
        (**self).set_quota(key, value, period).await
    }

    async fn release_quota(&self, key: &str, amount: u64, period: &QuotaPeriod) -> Result<u64> {
        (**self).release_quota(key, amount, period).await
    }

    async fn record_analytics(
        &self,
        key: &str,
        plan: &str,
        endpoint: &str,
        limited: bool,
    ) -> Result<()> {
        (**self).record_analytics(key, plan, endpoint, limited).await
    }

    async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> Result<Vec<AnalyticsRecord>> {
        (**self).get_analytics(period, limit).await
    }

    async fn cleanup(&self, retention: &Retention) -> Result<u64> {
        (**self).cleanup(retention).await
    }
}
