//! In-memory storage with automatic garbage collection.
//!
//! This storage backend uses `DashMap` for thread-safe concurrent access
//! and includes configurable garbage collection to prevent memory growth.
//! Every read-modify-write runs under the shard lock of its key, which makes
//! increments and bucket steps atomic per key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::clock::{Clock, SharedClock, system_clock};
use crate::error::Result;
use crate::storage::{
    AnalyticsPeriod, AnalyticsRecord, BucketSpec, BucketState, QuotaPeriod, Retention, Storage,
    TokenResult, WindowResult, bucket_key, hour_start,
};

/// Garbage collection interval configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run GC every N requests. Zero never runs it.
    Requests(u64),
    /// Run GC at fixed time intervals.
    Duration(Duration),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10000)
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// When to trigger GC.
    pub interval: GcInterval,
    /// How long stale quota records and analytics rollups are kept
    /// (default: 90 days each).
    pub retention: Retention,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: GcInterval::default(),
            retention: Retention::default(),
        }
    }
}

impl GcConfig {
    /// Create config with request-based GC.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count),
            ..Default::default()
        }
    }

    /// Create config with time-based GC.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval),
            ..Default::default()
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
            ..Default::default()
        }
    }

    /// Set how long stale quota records and analytics rollups are kept.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterSlot {
    count: u64,
    reset_at: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct BucketSlot {
    state: BucketState,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct QuotaSlot {
    used: u64,
    period: QuotaPeriod,
}

#[derive(Debug, Clone)]
struct AnalyticsSlot {
    plan: String,
    endpoint: String,
    requests: u64,
    limited: u64,
}

#[derive(Debug, Default)]
struct Tables {
    counters: DashMap<String, CounterSlot>,
    buckets: DashMap<String, BucketSlot>,
    quotas: DashMap<String, QuotaSlot>,
    analytics: DashMap<(u64, String), AnalyticsSlot>,
}

impl Tables {
    fn len(&self) -> usize {
        self.counters.len() + self.buckets.len() + self.quotas.len()
    }

    /// Drop everything `retention` no longer covers. Returns the number of
    /// records removed.
    ///
    /// Removals are counted as they happen; requests may insert concurrently.
    fn purge(&self, now_ms: u64, retention: &Retention) -> u64 {
        let now_secs = now_ms / 1000;
        let quota_cutoff = retention.quota_cutoff(now_secs);
        let analytics_cutoff = retention.analytics_cutoff(now_secs);

        let mut removed = 0u64;
        let mut keep = |alive: bool| {
            if !alive {
                removed += 1;
            }
            alive
        };

        self.counters.retain(|_, slot| keep(slot.expires_at_ms > now_ms));
        self.buckets.retain(|_, slot| keep(slot.expires_at_ms > now_ms));
        self.quotas.retain(|_, slot| keep(slot.period.end >= quota_cutoff));
        self.analytics.retain(|(hour, _), _| keep(*hour >= analytics_cutoff));

        removed
    }
}

/// In-memory storage with garbage collection.
///
/// Uses `DashMap` for thread-safe concurrent access and includes
/// configurable garbage collection to prevent unbounded memory growth.
/// Analytics are kept as in-process hourly rollups.
///
/// # Example
///
/// ```ignore
/// use smart_throttle::storage::{MemoryStorage, GcConfig};
/// use std::time::Duration;
///
/// // Default GC (every 10000 requests)
/// let storage = MemoryStorage::new();
///
/// // Custom GC interval
/// let storage = MemoryStorage::with_gc(GcConfig::on_duration(Duration::from_secs(60)));
///
/// // Manual GC only
/// let storage = MemoryStorage::with_gc(GcConfig::manual());
/// storage.run_gc();
/// ```
pub struct MemoryStorage {
    tables: Arc<Tables>,
    gc_config: GcConfig,
    clock: SharedClock,
    request_count: AtomicU64,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.tables.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new memory storage with default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new memory storage with custom GC configuration.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        Self::with_gc_and_clock(gc_config, system_clock())
    }

    /// Create a memory storage that reads time from `clock`.
    pub fn with_clock(clock: impl Clock) -> Self {
        Self::with_gc_and_clock(GcConfig::default(), Arc::new(clock))
    }

    /// Create a memory storage with custom GC configuration and clock.
    pub fn with_gc_and_clock(gc_config: GcConfig, clock: SharedClock) -> Self {
        let storage = Self {
            tables: Arc::new(Tables::default()),
            gc_config: gc_config.clone(),
            clock,
            request_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        };

        // Start background GC task if duration-based
        if let GcInterval::Duration(interval) = gc_config.interval {
            storage.start_gc_task(interval);
        }

        storage
    }

    /// Start background GC task.
    fn start_gc_task(&self, interval: Duration) {
        let tables = Arc::downgrade(&self.tables);
        let clock = self.clock.clone();
        let retention = self.gc_config.retention;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(tables) = tables.upgrade() else { break };
                        let now_ms = clock.now_ms();
                        tables.purge(now_ms, &retention);
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Manually trigger garbage collection. Returns the number of records removed.
    pub fn run_gc(&self) -> u64 {
        self.tables.purge(self.clock.now_ms(), &self.gc_config.retention)
    }

    /// Get the number of counters, buckets and quota records currently stored.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.tables.counters.clear();
        self.tables.buckets.clear();
        self.tables.quotas.clear();
        self.tables.analytics.clear();
    }

    /// Check if GC should run and run it if needed.
    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if count > 0 && count.checked_rem(threshold) == Some(0) {
                // Try to acquire GC lock (non-blocking)
                if let Some(_guard) = self.gc_lock.try_lock() {
                    self.run_gc();
                }
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

impl Storage for MemoryStorage {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowResult> {
        self.maybe_run_gc();

        let now_ms = self.clock.now_ms();
        let fresh = CounterSlot {
            count: 1,
            reset_at: now_ms / 1000 + window.as_secs(),
            expires_at_ms: now_ms + window.as_millis() as u64,
        };

        let slot = match self.tables.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.expires_at_ms > now_ms {
                    slot.count += 1;
                } else {
                    *slot = fresh;
                }
                *slot
            }
            Entry::Vacant(vacant) => *vacant.insert(fresh),
        };

        Ok(WindowResult {
            count: slot.count,
            reset_at: slot.reset_at,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .tables
            .counters
            .get(key)
            .filter(|slot| slot.expires_at_ms > now_ms)
            .map(|slot| slot.count))
    }

    async fn ttl(&self, key: &str) -> Result<u64> {
        let now_ms = self.clock.now_ms();
        let expires_at_ms = self
            .tables
            .counters
            .get(key)
            .map(|slot| slot.expires_at_ms)
            .or_else(|| self.tables.buckets.get(key).map(|slot| slot.expires_at_ms));

        Ok(expires_at_ms
            .map(|at| at.saturating_sub(now_ms) / 1000)
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let counter = self.tables.counters.remove(key).is_some();
        let bucket = self.tables.buckets.remove(key).is_some();
        Ok(counter || bucket)
    }

    async fn acquire_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        self.maybe_run_gc();

        let now_ms = self.clock.now_ms();
        let now = now_ms as f64 / 1000.0;
        let expires_at_ms = now_ms + (spec.full_refill_secs() + 1) * 1000;

        let result = match self.tables.buckets.entry(bucket_key(key)) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get().state).filter(|_| occupied.get().expires_at_ms > now_ms);
                let (result, next) = BucketState::acquire(current, spec, now);
                if let Some(state) = next {
                    occupied.insert(BucketSlot { state, expires_at_ms });
                }
                result
            }
            Entry::Vacant(vacant) => {
                let (result, next) = BucketState::acquire(None, spec, now);
                if let Some(state) = next {
                    vacant.insert(BucketSlot { state, expires_at_ms });
                }
                result
            }
        };

        if !result.allowed {
            debug!(key = %key, capacity = spec.capacity, "Token bucket exhausted");
        }
        Ok(result)
    }

    async fn peek_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        let now_ms = self.clock.now_ms();
        let current = self
            .tables
            .buckets
            .get(&bucket_key(key))
            .filter(|slot| slot.expires_at_ms > now_ms)
            .map(|slot| slot.state);

        Ok(BucketState::peek(current, spec, now_ms as f64 / 1000.0))
    }

    async fn increment_quota(&self, key: &str, cost: u64, period: &QuotaPeriod) -> Result<u64> {
        self.maybe_run_gc();

        let mut slot = self.tables.quotas.entry(key.to_string()).or_insert(QuotaSlot {
            used: 0,
            period: *period,
        });
        if slot.period != *period {
            *slot = QuotaSlot {
                used: 0,
                period: *period,
            };
        }
        slot.used += cost;
        Ok(slot.used)
    }

    async fn get_quota(&self, key: &str, period: &QuotaPeriod) -> Result<u64> {
        Ok(self
            .tables
            .quotas
            .get(key)
            .filter(|slot| slot.period == *period)
            .map(|slot| slot.used)
            .unwrap_or(0))
    }

    async fn reset_quota(&self, key: &str) -> Result<bool> {
        Ok(self.tables.quotas.remove(key).is_some())
    }

    async fn set_quota(&self, key: &str, value: u64, period: &QuotaPeriod) -> Result<bool> {
        self.tables.quotas.insert(
            key.to_string(),
            QuotaSlot {
                used: value,
                period: *period,
            },
        );
        Ok(true)
    }

    async fn release_quota(&self, key: &str, amount: u64, period: &QuotaPeriod) -> Result<u64> {
        match self.tables.quotas.get_mut(key) {
            Some(mut slot) if slot.period == *period => {
                slot.used = slot.used.saturating_sub(amount);
                Ok(slot.used)
            }
            _ => Ok(0),
        }
    }

    async fn record_analytics(
        &self,
        key: &str,
        plan: &str,
        endpoint: &str,
        limited: bool,
    ) -> Result<()> {
        let hour = hour_start(self.clock.now_secs());
        let mut slot = self
            .tables
            .analytics
            .entry((hour, key.to_string()))
            .or_insert_with(|| AnalyticsSlot {
                plan: plan.to_string(),
                endpoint: endpoint.to_string(),
                requests: 0,
                limited: 0,
            });

        slot.plan = plan.to_string();
        slot.endpoint = endpoint.to_string();
        slot.requests += 1;
        if limited {
            slot.limited += 1;
        }
        Ok(())
    }

    async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> Result<Vec<AnalyticsRecord>> {
        let since = self
            .clock
            .now_secs()
            .saturating_sub(period.seconds() * limit as u64);

        let mut records: Vec<AnalyticsRecord> = self
            .tables
            .analytics
            .iter()
            .filter(|entry| entry.key().0 >= since)
            .map(|entry| AnalyticsRecord {
                key: Some(entry.key().1.clone()),
                plan: Some(entry.plan.clone()),
                endpoint: Some(entry.endpoint.clone()),
                requests: entry.requests,
                limited: entry.limited,
                period: entry.key().0,
                period_type: "hour".to_string(),
            })
            .collect();

        records.sort_by(|a, b| b.period.cmp(&a.period).then_with(|| a.key.cmp(&b.key)));
        records.truncate(limit);
        Ok(records)
    }

    async fn cleanup(&self, retention: &Retention) -> Result<u64> {
        let removed = self.tables.purge(self.clock.now_ms(), retention);
        debug!(removed, ?retention, "Memory storage cleanup finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn storage_at(secs: u64) -> (MemoryStorage, ManualClock) {
        let clock = ManualClock::at_secs(secs);
        (MemoryStorage::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_increment_fixes_reset_at_on_creation() {
        let (storage, clock) = storage_at(1_000);

        let first = storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(first, WindowResult { count: 1, reset_at: 1_060 });

        clock.advance(Duration::from_secs(30));
        let second = storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(second, WindowResult { count: 2, reset_at: 1_060 });
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let (storage, clock) = storage_at(1_000);

        storage.increment("k", Duration::from_secs(1)).await.unwrap();
        storage.increment("k", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let result = storage.increment("k", Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, WindowResult { count: 1, reset_at: 1_002 });
    }

    #[tokio::test]
    async fn test_get_and_ttl() {
        let (storage, clock) = storage_at(1_000);

        assert_eq!(storage.get("k").await.unwrap(), None);
        assert_eq!(storage.ttl("k").await.unwrap(), 0);

        storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(1));
        assert_eq!(storage.ttl("k").await.unwrap(), 60);

        clock.advance(Duration::from_secs(60));
        assert_eq!(storage.get("k").await.unwrap(), None);
        assert_eq!(storage.ttl("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_then_get_is_absent() {
        let (storage, _) = storage_at(1_000);

        storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert!(storage.reset("k").await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), None);
        assert!(!storage.reset("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();

        for _ in 0..50 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.increment("hot", Duration::from_secs(60)).await.unwrap().count
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_token_acquire_never_oversells() {
        let storage = Arc::new(MemoryStorage::with_clock(ManualClock::at_secs(1_000)));
        let spec = BucketSpec::new(10, 0.001);
        let mut handles = Vec::new();

        for _ in 0..40 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.acquire_token("bucket", &spec).await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_bucket_reset_restores_full() {
        let (storage, _) = storage_at(1_000);
        let spec = BucketSpec::new(2, 1.0);

        storage.acquire_token("k", &spec).await.unwrap();
        storage.acquire_token("k", &spec).await.unwrap();
        assert!(!storage.acquire_token("k", &spec).await.unwrap().allowed);

        assert!(storage.reset(&bucket_key("k")).await.unwrap());
        assert_eq!(storage.peek_token("k", &spec).await.unwrap().tokens, 2.0);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (storage, _) = storage_at(1_000);
        let spec = BucketSpec::new(1, 1.0);

        for _ in 0..3 {
            assert!(storage.peek_token("k", &spec).await.unwrap().allowed);
        }
        assert!(storage.acquire_token("k", &spec).await.unwrap().allowed);
        assert!(!storage.peek_token("k", &spec).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_quota_rolls_over_with_period() {
        let (storage, _) = storage_at(1_000);
        let october = QuotaPeriod::new(0, 2_000);
        let november = QuotaPeriod::new(2_000, 4_000);

        assert_eq!(storage.increment_quota("q", 5, &october).await.unwrap(), 5);
        assert_eq!(storage.increment_quota("q", 3, &october).await.unwrap(), 8);
        assert_eq!(storage.get_quota("q", &november).await.unwrap(), 0);
        assert_eq!(storage.increment_quota("q", 1, &november).await.unwrap(), 1);
        assert_eq!(storage.get_quota("q", &october).await.unwrap(), 0);

        assert_eq!(storage.release_quota("q", 4, &november).await.unwrap(), 0);
        storage.increment_quota("q", 9, &november).await.unwrap();
        assert_eq!(storage.release_quota("q", 4, &november).await.unwrap(), 6);
        assert_eq!(storage.release_quota("q", 4, &october).await.unwrap(), 0);
        assert_eq!(storage.get_quota("q", &november).await.unwrap(), 6);

        assert!(storage.set_quota("q", 42, &november).await.unwrap());
        assert_eq!(storage.get_quota("q", &november).await.unwrap(), 42);

        assert!(storage.reset_quota("q").await.unwrap());
        assert_eq!(storage.get_quota("q", &november).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_analytics_rollup() {
        let (storage, clock) = storage_at(7_200);

        storage.record_analytics("user:1", "free", "GET /a", false).await.unwrap();
        storage.record_analytics("user:1", "free", "GET /a", true).await.unwrap();
        clock.advance(Duration::from_secs(3_600));
        storage.record_analytics("user:1", "free", "GET /b", false).await.unwrap();

        let records = storage.get_analytics(AnalyticsPeriod::Day, 30).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].period, 10_800);
        assert_eq!(records[1].requests, 2);
        assert_eq!(records[1].limited, 1);
    }

    #[tokio::test]
    async fn test_cleanup_purges_expired() {
        let (storage, clock) = storage_at(1_000);

        storage.increment("short", Duration::from_secs(1)).await.unwrap();
        storage.increment("long", Duration::from_secs(3_600)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(storage.cleanup(&Retention::days(90)).await.unwrap(), 1);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_quotas_for_retention() {
        let (storage, clock) = storage_at(86_400);
        let period = QuotaPeriod::new(0, 86_400 + 60);
        storage.increment_quota("q", 3, &period).await.unwrap();
        storage.record_analytics("user:1", "free", "GET /a", false).await.unwrap();

        clock.advance(Duration::from_secs(2 * 86_400));
        let retention = Retention {
            quota_days: 3,
            analytics_days: 1,
        };
        assert_eq!(storage.cleanup(&retention).await.unwrap(), 1);
        assert_eq!(storage.len(), 1);
        assert!(storage.get_analytics(AnalyticsPeriod::Week, 10).await.unwrap().is_empty());

        assert_eq!(storage.cleanup(&Retention::days(1)).await.unwrap(), 1);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_purge_counts_only_removals() {
        let tables = Tables::default();
        let live = CounterSlot {
            count: 1,
            reset_at: 100,
            expires_at_ms: 100_000,
        };
        for i in 0..10 {
            tables.counters.insert(format!("k{i}"), live);
        }
        tables.counters.insert(
            "old".to_string(),
            CounterSlot {
                expires_at_ms: 1_000,
                ..live
            },
        );

        let retention = Retention::default();
        assert_eq!(tables.purge(2_000, &retention), 1);
        assert_eq!(tables.purge(2_000, &retention), 0);
        assert_eq!(tables.len(), 10);
    }

    #[tokio::test]
    async fn test_zero_request_interval_never_collects() {
        let clock = ManualClock::at_secs(1_000);
        let storage = MemoryStorage::with_gc_and_clock(
            GcConfig::on_requests(0),
            Arc::new(clock.clone()),
        );

        storage.increment("short", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        for _ in 0..3 {
            storage.increment("other", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_gc_config() {
        let config = GcConfig::on_requests(1000).with_retention(Retention::days(7));

        assert!(matches!(config.interval, GcInterval::Requests(1000)));
        assert_eq!(config.retention, Retention::days(7));
        assert_eq!(GcConfig::default().retention, Retention::days(90));
    }
}
