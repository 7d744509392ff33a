//! Configuration-driven backend selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::storage::{
    AnalyticsPeriod, AnalyticsRecord, BucketSpec, QuotaPeriod, Retention, Storage, TokenResult,
    WindowResult,
};

#[cfg(feature = "database")]
use crate::storage::{DatabaseConfig, DatabaseStorage, DatabaseTables};
#[cfg(feature = "memory")]
use crate::storage::{GcConfig, MemoryStorage};
#[cfg(feature = "redis")]
use crate::storage::{RedisConfig, RedisStorage};

/// Which backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// In-process maps.
    #[default]
    Memory,
    /// Redis with Lua scripts.
    Redis,
    /// SQLite tables.
    Database,
}

impl StorageDriver {
    /// Configuration name of the driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Database => "database",
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Connection URL.
    pub url: String,
    /// Pool size.
    pub pool_size: usize,
    /// Connect and checkout timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout_ms: 5_000,
        }
    }
}

/// Table names for the relational backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    /// Window counter table.
    pub counters: String,
    /// Quota table.
    pub quotas: String,
    /// Analytics table.
    pub analytics: String,
    /// Token bucket table.
    pub buckets: String,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            counters: "rate_limits".to_string(),
            quotas: "api_quotas".to_string(),
            analytics: "api_rate_limit_analytics".to_string(),
            buckets: "token_buckets".to_string(),
        }
    }
}

/// Relational connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Table names.
    pub tables: TableSettings,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://throttle.db".to_string(),
            max_connections: 5,
            tables: TableSettings::default(),
        }
    }
}

/// Storage section of the throttle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend to build.
    pub driver: StorageDriver,
    /// Key prefix for backends with a shared keyspace.
    pub prefix: String,
    /// Redis settings, used when `driver` is `redis`.
    pub redis: RedisSettings,
    /// Relational settings, used when `driver` is `database`.
    pub database: DatabaseSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::default(),
            prefix: "throttle:".to_string(),
            redis: RedisSettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

impl StorageConfig {
    /// Build the configured backend.
    ///
    /// `retention` drives the memory backend's own garbage collection; the
    /// other backends only apply it on [`Storage::cleanup`].
    ///
    /// Fails with [`ConfigError::InvalidStorage`] when the driver's cargo
    /// feature is not enabled.
    #[cfg_attr(not(feature = "memory"), allow(unused_variables))]
    pub async fn connect(&self, retention: Retention) -> Result<AnyStorage> {
        match self.driver {
            #[cfg(feature = "memory")]
            StorageDriver::Memory => Ok(AnyStorage::Memory(MemoryStorage::with_gc(
                GcConfig::default().with_retention(retention),
            ))),

            #[cfg(feature = "redis")]
            StorageDriver::Redis => {
                let config = RedisConfig::new(&self.redis.url)
                    .with_prefix(&self.prefix)
                    .with_pool_size(self.redis.pool_size)
                    .with_timeout(Duration::from_millis(self.redis.timeout_ms));
                Ok(AnyStorage::Redis(RedisStorage::new(config).await?))
            }

            #[cfg(feature = "database")]
            StorageDriver::Database => {
                let tables = &self.database.tables;
                let config = DatabaseConfig::new(&self.database.url)
                    .with_max_connections(self.database.max_connections)
                    .with_tables(DatabaseTables {
                        counters: tables.counters.clone(),
                        quotas: tables.quotas.clone(),
                        analytics: tables.analytics.clone(),
                        buckets: tables.buckets.clone(),
                    });
                Ok(AnyStorage::Database(DatabaseStorage::connect(config).await?))
            }

            #[allow(unreachable_patterns)]
            driver => Err(ConfigError::InvalidStorage(format!(
                "driver '{}' requires the `{}` feature",
                driver.as_str(),
                driver.as_str()
            ))
            .into()),
        }
    }
}

/// Any of the compiled-in backends.
#[derive(Debug)]
pub enum AnyStorage {
    /// In-memory backend.
    #[cfg(feature = "memory")]
    Memory(MemoryStorage),
    /// Redis backend.
    #[cfg(feature = "redis")]
    Redis(RedisStorage),
    /// Relational backend.
    #[cfg(feature = "database")]
    Database(DatabaseStorage),
}

impl AnyStorage {
    /// Which backend this is.
    pub fn driver(&self) -> StorageDriver {
        match *self {
            #[cfg(feature = "memory")]
            Self::Memory(_) => StorageDriver::Memory,
            #[cfg(feature = "redis")]
            Self::Redis(_) => StorageDriver::Redis,
            #[cfg(feature = "database")]
            Self::Database(_) => StorageDriver::Database,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match *$self {
            #[cfg(feature = "memory")]
            AnyStorage::Memory(ref $inner) => $body,
            #[cfg(feature = "redis")]
            AnyStorage::Redis(ref $inner) => $body,
            #[cfg(feature = "database")]
            AnyStorage::Database(ref $inner) => $body,
        }
    };
}

impl Storage for AnyStorage {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowResult> {
        dispatch!(self, s => s.increment(key, window).await)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        dispatch!(self, s => s.get(key).await)
    }

    async fn ttl(&self, key: &str) -> Result<u64> {
        dispatch!(self, s => s.ttl(key).await)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        dispatch!(self, s => s.reset(key).await)
    }

    async fn acquire_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        dispatch!(self, s => s.acquire_token(key, spec).await)
    }

    async fn peek_token(&self, key: &str, spec: &BucketSpec) -> Result<TokenResult> {
        dispatch!(self, s => s.peek_token(key, spec).await)
    }

    async fn increment_quota(&self, key: &str, cost: u64, period: &QuotaPeriod) -> Result<u64> {
        dispatch!(self, s => s.increment_quota(key, cost, period).await)
    }

    async fn get_quota(&self, key: &str, period: &QuotaPeriod) -> Result<u64> {
        dispatch!(self, s => s.get_quota(key, period).await)
    }

    async fn reset_quota(&self, key: &str) -> Result<bool> {
        dispatch!(self, s => s.reset_quota(key).await)
    }

    async fn set_quota(&self, key: &str, value: u64, period: &QuotaPeriod) -> Result<bool> {
        dispatch!(self, s => s.set_quota(key, value, period).await)
    }

    async fn release_quota(&self, key: &str, amount: u64, period: &QuotaPeriod) -> Result<u64> {
        dispatch!(self, s => s.release_quota(key, amount, period).await)
    }

    async fn record_analytics(
        &self,
        key: &str,
        plan: &str,
        endpoint: &str,
        limited: bool,
    ) -> Result<()> {
        dispatch!(self, s => s.record_analytics(key, plan, endpoint, limited).await)
    }

    async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> Result<Vec<AnalyticsRecord>> {
        dispatch!(self, s => s.get_analytics(period, limit).await)
    }

    async fn cleanup(&self, retention: &Retention) -> Result<u64> {
        dispatch!(self, s => s.cleanup(retention).await)
    }
}
