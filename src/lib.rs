//! Plan-aware rate limiting and quota engine.
//!
//! `smart_throttle` decides whether a request may proceed based on the
//! caller's subscription plan:
//!
//! - **Plans**: per-second, minute, hour and day limits plus monthly and
//!   daily quotas, with a configurable default plan
//! - **Strategies**: Fixed Window, Sliding Window and Token Bucket, one of
//!   them chosen globally
//! - **Pluggable Storage**: in-memory with GC, Redis with connection pooling,
//!   SQLite through sqlx
//! - **Route Overrides**: stricter limits and forced scopes for endpoints
//!   such as login
//! - **Headers**: `X-RateLimit-*`, `X-Quota-*` and `Retry-After` values
//!
//! # Quick Start
//!
//! ```ignore
//! use smart_throttle::{MemoryStorage, ThrottleConfig, ThrottleEngine};
//!
//! #[tokio::main]
//! async fn main() -> smart_throttle::Result<()> {
//!     let config = ThrottleConfig::default();
//!     let engine = ThrottleEngine::from_config(&config, MemoryStorage::new())?;
//!
//!     let limits = engine.evaluate("free", "user:123").await?;
//!     if limits.is_allowed() {
//!         let quota = engine.evaluate_quota("free", "user:123", 1).await?;
//!         println!("{:?} requests left this month", quota.remaining());
//!     } else {
//!         println!("Rate limited! Retry after {:?}s", limits.retry_after);
//!     }
//!
//!     for (name, value) in limits.to_headers().to_vec() {
//!         println!("{name}: {value}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Strategies
//!
//! | Strategy | Best For | Storage per window |
//! |----------|----------|--------------------|
//! | Fixed Window | Simple use cases | 1 counter |
//! | Sliding Window | Smooth limits at boundaries | 2 counters |
//! | Token Bucket | Bursty traffic | 1 bucket |
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend
//! - `database`: SQLite storage backend
//! - `full`: every backend

pub mod algorithm;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod headers;
pub mod key;
pub mod plan;
pub mod quota;
pub mod storage;

// Re-export main types
pub use algorithm::{Algorithm, Limiter, LimiterConfig, LimiterFactory};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{FailurePolicy, ThrottleConfig};
pub use decision::{Decision, DecisionMetadata, RateLimitInfo};
pub use engine::{RateLimits, ThrottleEngine, ThrottleEngineBuilder, WindowStatus};
pub use error::{ConfigError, ConnectionError, RateLimitError, Result, StorageError};
pub use headers::RateLimitHeaders;
pub use key::{
    BypassList, EndpointOverrides, FnKey, Key, KeyResolverConfig, RequestInfo, Resolver, Scope,
    ScopeResolver, StaticKey,
};
pub use plan::{EndpointOverride, Plan, PlanConfig, PlanTable, Window};
pub use quota::{QuotaInfo, QuotaTracker, QuotaUsage};
pub use storage::{AnyStorage, Retention, Storage, StorageConfig};

// Re-export algorithms
pub use algorithm::{FixedWindow, SlidingWindow, TokenBucket};

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::RedisStorage;

#[cfg(feature = "database")]
pub use storage::DatabaseStorage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::Algorithm;
    pub use crate::config::{FailurePolicy, ThrottleConfig};
    pub use crate::decision::{Decision, RateLimitInfo};
    pub use crate::engine::{RateLimits, ThrottleEngine};
    pub use crate::error::{RateLimitError, Result};
    pub use crate::key::{HasHeaders, HasIpAddr, HasRoute, HasUser, Key, RequestInfo};
    pub use crate::plan::{Plan, PlanTable, Window};
    pub use crate::quota::QuotaInfo;
    pub use crate::storage::Storage;

    #[cfg(feature = "memory")]
    pub use crate::storage::MemoryStorage;
}
