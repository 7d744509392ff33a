//! Relational storage backend on SQLite.
//!
//! Counters and quotas use single-statement upserts, so SQLite's write lock
//! serializes them. The token bucket needs a read before the write and runs
//! inside a `BEGIN IMMEDIATE` transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SharedClock, system_clock};
use crate::error::{ConnectionError, RateLimitError, Result, StorageError};
use crate::storage::{
    AnalyticsPeriod, AnalyticsRecord, BucketSpec, BucketState, QuotaPeriod, Retention, Storage,
    TokenResult, WindowResult, bucket_key, hour_start,
};

/// Table names used by [`DatabaseStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTables {
    /// Window counters: `{key unique, count, reset_at}`.
    pub counters: String,
    /// Billing-period quotas: `{key, used, bonus, period_start, period_end}`.
    pub quotas: String,
    /// Hourly analytics rollups.
    pub analytics: String,
    /// Token bucket state: `{key unique, tokens, last_refill, expires_at}`.
    pub buckets: String,
}

impl Default for DatabaseTables {
    fn default() -> Self {
        Self {
            counters: "rate_limits".to_string(),
            quotas: "api_quotas".to_string(),
            analytics: "api_rate_limit_analytics".to_string(),
            buckets: "token_buckets".to_string(),
        }
    }
}

/// Database storage configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://throttle.db` or `sqlite::memory:`.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection or a locked database.
    pub acquire_timeout: Duration,
    /// Table names.
    pub tables: DatabaseTables,
    /// Create missing tables on connect.
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://throttle.db".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            tables: DatabaseTables::default(),
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// A private in-memory database.
    ///
    /// Every SQLite connection to `:memory:` sees its own database, so the
    /// pool holds exactly one connection.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        }
    }

    /// Set the pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Override the table names.
    pub fn with_tables(mut self, tables: DatabaseTables) -> Self {
        self.tables = tables;
        self
    }
}

#[derive(Debug, FromRow)]
struct AnalyticsRow {
    key: String,
    plan: Option<String>,
    endpoint: Option<String>,
    requests: i64,
    limited: i64,
    period: i64,
    period_type: String,
}

impl From<AnalyticsRow> for AnalyticsRecord {
    fn from(row: AnalyticsRow) -> Self {
        Self {
            key: Some(row.key),
            plan: row.plan,
            endpoint: row.endpoint,
            requests: to_u64(row.requests),
            limited: to_u64(row.limited),
            period: to_u64(row.period),
            period_type: row.period_type,
        }
    }
}

/// Relational storage backend.
///
/// # Example
///
/// ```ignore
/// use smart_throttle::storage::{DatabaseConfig, DatabaseStorage};
///
/// let storage = DatabaseStorage::connect(DatabaseConfig::new("sqlite://throttle.db")).await?;
/// ```
#[derive(Clone)]
pub struct DatabaseStorage {
    pool: SqlitePool,
    tables: DatabaseTables,
    clock: SharedClock,
}

impl std::fmt::Debug for DatabaseStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseStorage")
            .field("tables", &self.tables)
            .finish()
    }
}

impl DatabaseStorage {
    /// Open a connection pool and, unless disabled, create missing tables.
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        info!(url = %config.url, "Creating SQLite storage connection pool");

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(config.acquire_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            // An in-memory database lives only as long as its connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!(url = %config.url, error = %e, "Failed to connect to SQLite storage");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        let storage = Self {
            pool,
            tables: config.tables,
            clock: system_clock(),
        };

        if config.auto_migrate {
            storage.migrate().await?;
        }
        Ok(storage)
    }

    /// Connect to a private in-memory database with all tables created.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(DatabaseConfig::in_memory()).await
    }

    /// Use `clock` for window and bucket arithmetic.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the storage tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL UNIQUE,
                    count INTEGER NOT NULL DEFAULT 0,
                    reset_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                t.counters
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL,
                    used INTEGER NOT NULL DEFAULT 0,
                    bonus INTEGER NOT NULL DEFAULT 0,
                    period_start INTEGER NOT NULL,
                    period_end INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (key, period_start)
                )",
                t.quotas
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL,
                    plan TEXT,
                    endpoint TEXT,
                    requests INTEGER NOT NULL DEFAULT 0,
                    limited INTEGER NOT NULL DEFAULT 0,
                    period INTEGER NOT NULL,
                    period_type TEXT NOT NULL DEFAULT 'hour',
                    UNIQUE (key, period, period_type)
                )",
                t.analytics
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_period_idx ON {0} (period, period_type)",
                t.analytics
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    tokens REAL NOT NULL,
                    last_refill REAL NOT NULL,
                    expires_at INTEGER NOT NULL
                )",
                t.buckets
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        info!(counters = %t.counters, quotas = %t.quotas, "SQLite storage tables ready");
        Ok(())
    }

    /// Refill and take one token on a connection that holds the write lock.
    async fn bucket_step(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        spec: &BucketSpec,
    ) -> Result<TokenResult> {
        let now_ms = self.clock.now_ms();
        let now = now_ms as f64 / 1000.0;

        let current: Option<(f64, f64, i64)> = sqlx::query_as(&format!(
            "SELECT tokens, last_refill, expires_at FROM {} WHERE key = ?1",
            self.tables.buckets
        ))
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        let state = current
            .filter(|(_, _, expires_at)| to_u64(*expires_at) * 1000 > now_ms)
            .map(|(tokens, last_refill, _)| BucketState {
                tokens,
                last_refill,
            });

        let (result, next) = BucketState::acquire(state, spec, now);

        if let Some(next) = next {
            let expires_at = now_ms / 1000 + spec.full_refill_secs() + 1;
            sqlx::query(&format!(
                "INSERT INTO {} (key, tokens, last_refill, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    tokens = excluded.tokens,
                    last_refill = excluded.last_refill,
                    expires_at = excluded.expires_at",
                self.tables.buckets
            ))
            .bind(key)
            .bind(next.tokens)
            .bind(next.last_refill)
            .bind(expires_at as i64)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }

        Ok(result)
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

/// Classify a sqlx failure. Pool and I/O failures mean the database could
/// not be reached.
fn db_err(err: sqlx::Error) -> RateLimitError {
    match err {
        sqlx::Error::PoolTimedOut => StorageError::PoolExhausted.into(),
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
            StorageError::unavailable(err.to_string()).into()
        }
        sqlx::Error::Database(ref db) if db.message().contains("locked") => {
            StorageError::operation_failed(err.to_string(), true).into()
        }
        _ => StorageError::operation_failed(err.to_string(), false).into(),
    }
}

impl Storage for DatabaseStorage {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowResult> {
        let now = self.clock.now_secs();
        let reset_at = now + window.as_secs();

        let (count, reset_at): (i64, i64) = sqlx::query_as(&format!(
            "INSERT INTO {} (key, count, reset_at, created_at, updated_at) VALUES (?1, 1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET
                count = CASE WHEN reset_at <= ?3 THEN 1 ELSE count + 1 END,
                reset_at = CASE WHEN reset_at <= ?3 THEN ?2 ELSE reset_at END,
                updated_at = ?3
             RETURNING count, reset_at",
            self.tables.counters
        ))
        .bind(key)
        .bind(reset_at as i64)
        .bind(now as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(WindowResult {
            count: to_u64(count),
            reset_at: to_u64(reset_at),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let count: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT count FROM {} WHERE key = ?1 AND reset_at > ?2",
            self.tables.counters
        ))
        .bind(key)
        .bind(self.clock.now_secs() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(count.map(to_u64))
    }

    async fn ttl(&self, key: &str) -> Result<u64> {
        let reset_at: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT reset_at FROM {} WHERE key = ?1",
            self.tables.counters
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(reset_at
            .map(|at| to_u64(at).saturating_sub(self.clock.now_secs()))
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut removed = 0;
        for table in [&self.tables.counters, &self.tables.buckets] {
            removed += sqlx::query(&format!("DELETE FROM {table} WHERE key = ?1"))
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(db_err)?
                .rows_affected();
        }
        Ok(removed > 0)
    }

    async fn acquire_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        // Rolled back on drop if the step fails or the future is cancelled.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;

        let result = self.bucket_step(&mut *tx, &bucket_key(key), spec).await?;
        tx.commit().await.map_err(db_err)?;

        if !result.allowed {
            debug!(key = %key, capacity = spec.capacity, "Token bucket exhausted");
        }
        Ok(result)
    }

    async fn peek_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        let now_ms = self.clock.now_ms();

        let current: Option<(f64, f64, i64)> = sqlx::query_as(&format!(
            "SELECT tokens, last_refill, expires_at FROM {} WHERE key = ?1",
            self.tables.buckets
        ))
        .bind(bucket_key(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let state = current
            .filter(|(_, _, expires_at)| to_u64(*expires_at) * 1000 > now_ms)
            .map(|(tokens, last_refill, _)| BucketState {
                tokens,
                last_refill,
            });

        Ok(BucketState::peek(state, spec, now_ms as f64 / 1000.0))
    }

    async fn increment_quota(&self, key: &str, cost: u64, period: &QuotaPeriod) -> Result<u64> {
        let used: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (key, used, bonus, period_start, period_end, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?5)
             ON CONFLICT(key, period_start) DO UPDATE SET
                used = used + excluded.used,
                updated_at = excluded.updated_at
             RETURNING used",
            self.tables.quotas
        ))
        .bind(key)
        .bind(cost as i64)
        .bind(period.start as i64)
        .bind(period.end as i64)
        .bind(self.clock.now_secs() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(to_u64(used))
    }

    async fn get_quota(&self, key: &str, period: &QuotaPeriod) -> Result<u64> {
        let used: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT used FROM {} WHERE key = ?1 AND period_start = ?2",
            self.tables.quotas
        ))
        .bind(key)
        .bind(period.start as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(used.map(to_u64).unwrap_or(0))
    }

    async fn reset_quota(&self, key: &str) -> Result<bool> {
        let removed = sqlx::query(&format!("DELETE FROM {} WHERE key = ?1", self.tables.quotas))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();

        Ok(removed > 0)
    }

    async fn set_quota(&self, key: &str, value: u64, period: &QuotaPeriod) -> Result<bool> {
        // Lowering usage is recorded as bonus credit.
        let affected = sqlx::query(&format!(
            "INSERT INTO {} (key, used, bonus, period_start, period_end, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?5)
             ON CONFLICT(key, period_start) DO UPDATE SET
                bonus = bonus + max(used - excluded.used, 0),
                used = excluded.used,
                period_end = excluded.period_end,
                updated_at = excluded.updated_at",
            self.tables.quotas
        ))
        .bind(key)
        .bind(value as i64)
        .bind(period.start as i64)
        .bind(period.end as i64)
        .bind(self.clock.now_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn release_quota(&self, key: &str, amount: u64, period: &QuotaPeriod) -> Result<u64> {
        // The released amount is recorded as bonus credit.
        let used: Option<i64> = sqlx::query_scalar(&format!(
            "UPDATE {} SET
                bonus = bonus + min(used, ?3),
                used = max(used - ?3, 0),
                updated_at = ?4
             WHERE key = ?1 AND period_start = ?2
             RETURNING used",
            self.tables.quotas
        ))
        .bind(key)
        .bind(period.start as i64)
        .bind(i64::try_from(amount).unwrap_or(i64::MAX))
        .bind(self.clock.now_secs() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(used.map(to_u64).unwrap_or(0))
    }

    async fn record_analytics(
        &self,
        key: &str,
        plan: &str,
        endpoint: &str,
        limited: bool,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, plan, endpoint, requests, limited, period, period_type)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, 'hour')
             ON CONFLICT(key, period, period_type) DO UPDATE SET
                plan = excluded.plan,
                endpoint = excluded.endpoint,
                requests = requests + 1,
                limited = limited + excluded.limited",
            self.tables.analytics
        ))
        .bind(key)
        .bind(plan)
        .bind(endpoint)
        .bind(i64::from(limited))
        .bind(hour_start(self.clock.now_secs()) as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

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

        let rows: Vec<AnalyticsRow> = sqlx::query_as(&format!(
            "SELECT key, plan, endpoint, requests, limited, period, period_type FROM {}
             WHERE period >= ?1
             ORDER BY period DESC, key
             LIMIT ?2",
            self.tables.analytics
        ))
        .bind(since as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(AnalyticsRecord::from).collect())
    }

    async fn cleanup(&self, retention: &Retention) -> Result<u64> {
        let now = self.clock.now_secs();
        let t = &self.tables;

        let statements = [
            (format!("DELETE FROM {} WHERE reset_at <= ?1", t.counters), now),
            (format!("DELETE FROM {} WHERE expires_at <= ?1", t.buckets), now),
            (
                format!("DELETE FROM {} WHERE period_end < ?1", t.quotas),
                retention.quota_cutoff(now),
            ),
            (
                format!("DELETE FROM {} WHERE period < ?1", t.analytics),
                retention.analytics_cutoff(now),
            ),
        ];

        let mut removed = 0;
        for (statement, cutoff) in &statements {
            removed += sqlx::query(statement)
                .bind(*cutoff as i64)
                .execute(&self.pool)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        info!(removed, ?retention, "SQLite storage cleanup finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn storage_at(secs: u64) -> (DatabaseStorage, ManualClock) {
        let clock = ManualClock::at_secs(secs);
        let storage = DatabaseStorage::in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone());
        (storage, clock)
    }

    #[tokio::test]
    async fn test_increment_and_window_restart() {
        let (storage, clock) = storage_at(1_000).await;

        let first = storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(first, WindowResult { count: 1, reset_at: 1_060 });
        let second = storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(second, WindowResult { count: 2, reset_at: 1_060 });

        clock.advance(Duration::from_secs(60));
        assert_eq!(storage.get("k").await.unwrap(), None);
        let restarted = storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(restarted, WindowResult { count: 1, reset_at: 1_120 });
        assert_eq!(storage.ttl("k").await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_reset_then_get_is_absent() {
        let (storage, _) = storage_at(1_000).await;

        storage.increment("k", Duration::from_secs(60)).await.unwrap();
        assert!(storage.reset("k").await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), None);
        assert!(!storage.reset("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (storage, _) = storage_at(1_000).await;
        let mut handles = Vec::new();

        for _ in 0..20 {
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
        assert_eq!(counts, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_token_bucket_exhausts_and_refills() {
        let (storage, clock) = storage_at(1_000).await;
        let spec = BucketSpec::new(3, 1.0);

        for _ in 0..3 {
            assert!(storage.acquire_token("k", &spec).await.unwrap().allowed);
        }
        let denied = storage.acquire_token("k", &spec).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.tokens, 0.0);

        clock.advance(Duration::from_secs(1));
        assert!(storage.acquire_token("k", &spec).await.unwrap().allowed);
        assert!(!storage.acquire_token("k", &spec).await.unwrap().allowed);

        assert!(storage.reset(&bucket_key("k")).await.unwrap());
        assert_eq!(storage.peek_token("k", &spec).await.unwrap().remaining(), 3);
    }

    #[tokio::test]
    async fn test_release_quota_records_bonus() {
        let (storage, _) = storage_at(1_000).await;
        let period = QuotaPeriod::new(0, 10_000);

        assert_eq!(storage.release_quota("q", 10, &period).await.unwrap(), 0);
        storage.increment_quota("q", 100, &period).await.unwrap();
        assert_eq!(storage.release_quota("q", 60, &period).await.unwrap(), 40);
        assert_eq!(storage.get_quota("q", &period).await.unwrap(), 40);
        assert!(storage.set_quota("q", 30, &period).await.unwrap());
        assert_eq!(storage.get_quota("q", &period).await.unwrap(), 30);

        let bonus: i64 = sqlx::query_scalar("SELECT bonus FROM api_quotas WHERE key = 'q'")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(bonus, 70);

        assert!(storage.reset_quota("q").await.unwrap());
        assert_eq!(storage.get_quota("q", &period).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_is_scoped_to_period() {
        let (storage, _) = storage_at(1_000).await;
        let first = QuotaPeriod::new(0, 2_000);
        let second = QuotaPeriod::new(2_000, 4_000);

        assert_eq!(storage.increment_quota("q", 7, &first).await.unwrap(), 7);
        assert_eq!(storage.increment_quota("q", 2, &second).await.unwrap(), 2);
        assert_eq!(storage.get_quota("q", &first).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_analytics_and_cleanup() {
        let (storage, clock) = storage_at(3_600 * 24 * 100).await;

        storage.record_analytics("user:1", "pro", "GET /x", false).await.unwrap();
        storage.record_analytics("user:1", "pro", "GET /x", true).await.unwrap();

        let records = storage.get_analytics(AnalyticsPeriod::Day, 7).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].requests, 2);
        assert_eq!(records[0].limited, 1);
        assert_eq!(records[0].plan.as_deref(), Some("pro"));

        storage.increment("k", Duration::from_secs(60)).await.unwrap();
        let period = QuotaPeriod::new(0, 3_600 * 24 * 100 + 600);
        storage.increment_quota("q", 1, &period).await.unwrap();
        clock.advance(Duration::from_secs(2 * 86_400));

        // The expired counter always goes; the rest is younger than 3 days.
        assert_eq!(storage.cleanup(&Retention::days(3)).await.unwrap(), 1);
        let analytics_only = Retention {
            quota_days: 3,
            analytics_days: 1,
        };
        assert_eq!(storage.cleanup(&analytics_only).await.unwrap(), 1);
        assert_eq!(storage.cleanup(&Retention::days(1)).await.unwrap(), 1);
        assert_eq!(storage.get_quota("q", &period).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_the_connection() {
        let (storage, _) = storage_at(1_000).await;
        let spec = BucketSpec::new(2, 1.0);

        let _ = tokio::time::timeout(Duration::ZERO, storage.acquire_token("b", &spec)).await;

        let result = storage.acquire_token("b", &spec).await.unwrap();
        assert!(result.allowed);
        assert!(storage.peek_token("b", &spec).await.unwrap().tokens < 2.0);
    }

    #[test]
    fn test_database_config() {
        let config = DatabaseConfig::new("sqlite://x.db").with_max_connections(2);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.tables.counters, "rate_limits");
        assert_eq!(DatabaseConfig::in_memory().max_connections, 1);
    }
}
