//! Redis storage backend for distributed rate limiting.
//!
//! Uses connection pooling for high performance. Every read-modify-write runs
//! as a Lua script so Redis serializes it per key. Time is passed into the
//! scripts from the storage clock rather than read from the server.

use std::collections::HashMap;
use std::time::Duration;

use deadpool_redis::redis::{self, AsyncCommands, RedisError, Script, cmd};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use tracing::{debug, info};

use crate::clock::{Clock, SharedClock, system_clock};
use crate::error::{ConnectionError, RateLimitError, Result, StorageError};
use crate::storage::{
    AnalyticsPeriod, AnalyticsRecord, BucketSpec, BucketState, QuotaPeriod, Retention, Storage,
    TokenResult, WindowResult, bucket_key, hour_start,
};

/// Analytics hashes are kept for 30 days.
const ANALYTICS_TTL_SECS: u64 = 30 * 86_400;

/// Increment a window counter, fixing `reset_at` when the window is created.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('hincrby', KEYS[1], 'count', 1)
if count == 1 then
    redis.call('hset', KEYS[1], 'reset_at', ARGV[1])
    redis.call('expire', KEYS[1], ARGV[2])
end
local reset_at = tonumber(redis.call('hget', KEYS[1], 'reset_at')) or tonumber(ARGV[1])
return {count, reset_at}
"#;

/// Refill and take one token. Denied attempts write nothing.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local initial = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('hmget', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or initial
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * rate)
if now > last_refill then
    last_refill = now
end

if tokens >= 1 then
    tokens = tokens - 1
    redis.call('hset', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(last_refill))
    redis.call('expire', KEYS[1], ttl)
    return {1, tostring(tokens), math.floor(now + (capacity - tokens) / rate)}
end

return {0, '0', math.floor(now + 1 / rate)}
"#;

/// Add to a quota counter, starting over when the period changes.
const QUOTA_SCRIPT: &str = r#"
if redis.call('hget', KEYS[1], 'period_start') ~= ARGV[1] then
    redis.call('del', KEYS[1])
    redis.call('hset', KEYS[1], 'period_start', ARGV[1])
end
local used = redis.call('hincrby', KEYS[1], 'used', ARGV[2])
redis.call('expireat', KEYS[1], ARGV[3])
return used
"#;

/// Lower a quota counter, never below zero. Other periods count as unused.
const RELEASE_QUOTA_SCRIPT: &str = r#"
if redis.call('hget', KEYS[1], 'period_start') ~= ARGV[1] then
    return 0
end
local used = tonumber(redis.call('hget', KEYS[1], 'used')) or 0
used = math.max(used - tonumber(ARGV[2]), 0)
redis.call('hset', KEYS[1], 'used', used)
return used
"#;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for all throttle keys
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "throttle:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis storage backend for distributed rate limiting.
///
/// Counters, buckets and quotas are hashes under `key_prefix`. Analytics are
/// hourly hashes (`analytics:<hour>`) holding total, limited and per-plan
/// request counts.
///
/// # Example
///
/// ```ignore
/// use smart_throttle::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:throttle:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    clock: SharedClock,
    increment_script: Script,
    bucket_script: Script,
    quota_script: Script,
    release_script: Script,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    ///
    /// Fails if the server does not answer `PING` within the connection
    /// timeout.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(&config.url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connection_timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let ping = async {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
            let _: () = cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
            Ok::<_, ConnectionError>(())
        };
        tokio::time::timeout(config.connection_timeout, ping)
            .await
            .map_err(|_| ConnectionError::Timeout(config.connection_timeout))??;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis storage");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
            clock: system_clock(),
            increment_script: Script::new(INCREMENT_SCRIPT),
            bucket_script: Script::new(TOKEN_BUCKET_SCRIPT),
            quota_script: Script::new(QUOTA_SCRIPT),
            release_script: Script::new(RELEASE_QUOTA_SCRIPT),
        })
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    /// Use `clock` for window and bucket arithmetic.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = std::sync::Arc::new(clock);
        self
    }

    /// Get the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn quota_key(&self, key: &str) -> String {
        format!("{}quota:{}", self.key_prefix, key)
    }

    fn analytics_key(&self, hour: u64) -> String {
        format!("{}analytics:{}", self.key_prefix, hour)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::unavailable(e.to_string()).into())
    }
}

/// Classify a Redis failure. Anything that means the server could not be
/// reached is reported as unavailable.
fn redis_err(err: RedisError) -> RateLimitError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        StorageError::unavailable(err.to_string()).into()
    } else {
        StorageError::operation_failed(err.to_string(), false).into()
    }
}

fn parse_tokens(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| StorageError::Serialization(format!("bad token count '{raw}': {e}")).into())
}

impl Storage for RedisStorage {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowResult> {
        let mut conn = self.get_conn().await?;
        let window_secs = window.as_secs().max(1);
        let reset_at = self.clock.now_secs() + window_secs;

        let (count, reset_at): (u64, u64) = self
            .increment_script
            .key(self.full_key(key))
            .arg(reset_at)
            .arg(window_secs)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)?;

        Ok(WindowResult { count, reset_at })
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.get_conn().await?;
        conn.hget(self.full_key(key), "count")
            .await
            .map_err(redis_err)
    }

    async fn ttl(&self, key: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let ttl: i64 = conn.ttl(self.full_key(key)).await.map_err(redis_err)?;
        // -2 for a missing key, -1 for one without expiry.
        Ok(ttl.max(0) as u64)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let removed: u64 = conn.del(self.full_key(key)).await.map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn acquire_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        let mut conn = self.get_conn().await?;

        let (allowed, tokens, reset_at): (u8, String, u64) = self
            .bucket_script
            .key(self.full_key(&bucket_key(key)))
            .arg(spec.capacity)
            .arg(spec.refill_rate)
            .arg(self.clock.now_secs_f64())
            .arg(spec.starting_tokens())
            .arg(spec.full_refill_secs() + 1)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)?;

        if allowed == 0 {
            debug!(key = %key, capacity = spec.capacity, "Token bucket exhausted");
        }

        Ok(TokenResult {
            allowed: allowed == 1,
            tokens: parse_tokens(&tokens)?,
            reset_at,
        })
    }

    async fn peek_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        let mut conn = self.get_conn().await?;

        let (tokens, last_refill): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.full_key(&bucket_key(key)))
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut *conn)
            .await
            .map_err(redis_err)?;

        let state = match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => Some(BucketState {
                tokens: parse_tokens(&tokens)?,
                last_refill: parse_tokens(&last_refill)?,
            }),
            _ => None,
        };

        Ok(BucketState::peek(state, spec, self.clock.now_secs_f64()))
    }

    async fn increment_quota(&self, key: &str, cost: u64, period: &QuotaPeriod) -> Result<u64> {
        let mut conn = self.get_conn().await?;

        self.quota_script
            .key(self.quota_key(key))
            .arg(period.start)
            .arg(cost)
            .arg(period.end)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)
    }

    async fn get_quota(&self, key: &str, period: &QuotaPeriod) -> Result<u64> {
        let mut conn = self.get_conn().await?;

        let (used, period_start): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.quota_key(key))
            .arg("used")
            .arg("period_start")
            .query_async(&mut *conn)
            .await
            .map_err(redis_err)?;

        Ok(match period_start {
            Some(start) if start == period.start => used.unwrap_or(0),
            _ => 0,
        })
    }

    async fn reset_quota(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let removed: u64 = conn.del(self.quota_key(key)).await.map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn set_quota(&self, key: &str, value: u64, period: &QuotaPeriod) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let quota_key = self.quota_key(key);

        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&quota_key)
            .ignore()
            .cmd("HSET")
            .arg(&quota_key)
            .arg("used")
            .arg(value)
            .arg("period_start")
            .arg(period.start)
            .ignore()
            .cmd("EXPIREAT")
            .arg(&quota_key)
            .arg(period.end)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(redis_err)?;

        Ok(true)
    }

    async fn release_quota(&self, key: &str, amount: u64, period: &QuotaPeriod) -> Result<u64> {
        let mut conn = self.get_conn().await?;

        self.release_script
            .key(self.quota_key(key))
            .arg(period.start)
            .arg(amount)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_err)
    }

    async fn record_analytics(
        &self,
        _key: &str,
        plan: &str,
        _endpoint: &str,
        limited: bool,
    ) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let analytics_key = self.analytics_key(hour_start(self.clock.now_secs()));

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HINCRBY")
            .arg(&analytics_key)
            .arg("total_requests")
            .arg(1)
            .ignore()
            .cmd("HINCRBY")
            .arg(&analytics_key)
            .arg(format!("plan:{plan}"))
            .arg(1)
            .ignore();
        if limited {
            pipe.cmd("HINCRBY")
                .arg(&analytics_key)
                .arg("limited_requests")
                .arg(1)
                .ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(&analytics_key)
            .arg(ANALYTICS_TTL_SECS)
            .ignore();

        let _: () = pipe.query_async(&mut *conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> Result<Vec<AnalyticsRecord>> {
        let mut conn = self.get_conn().await?;
        let now_hour = hour_start(self.clock.now_secs());

        // Nothing older than the analytics TTL can still exist.
        let lookback = (period.seconds() * limit as u64).min(ANALYTICS_TTL_SECS);
        let hours: Vec<u64> = (0..lookback / 3_600)
            .map(|i| now_hour.saturating_sub(i * 3_600))
            .collect();
        if hours.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for hour in &hours {
            pipe.cmd("HGETALL").arg(self.analytics_key(*hour));
        }
        let rows: Vec<HashMap<String, u64>> =
            pipe.query_async(&mut *conn).await.map_err(redis_err)?;

        let records = hours
            .into_iter()
            .zip(rows)
            .filter(|(_, row)| !row.is_empty())
            .take(limit)
            .map(|(hour, row)| {
                let plan = row
                    .iter()
                    .filter_map(|(field, count)| field.strip_prefix("plan:").map(|p| (p, *count)))
                    .max_by_key(|(_, count)| *count)
                    .map(|(plan, _)| plan.to_string());

                AnalyticsRecord {
                    key: None,
                    plan,
                    endpoint: None,
                    requests: row.get("total_requests").copied().unwrap_or(0),
                    limited: row.get("limited_requests").copied().unwrap_or(0),
                    period: hour,
                    period_type: "hour".to_string(),
                }
            })
            .collect();

        Ok(records)
    }

    async fn cleanup(&self, retention: &Retention) -> Result<u64> {
        // Redis expires everything on its own.
        debug!(?retention, "Redis cleanup is a no-op");
        Ok(0)
    }
}
