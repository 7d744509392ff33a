//! Values exchanged with storage backends.

use serde::{Deserialize, Serialize};

/// Upper bound on how long bucket state is kept.
const MAX_REFILL_SECS: u64 = 365 * 86_400;

/// Result of incrementing a window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowResult {
    /// Count after the increment.
    pub count: u64,
    /// Unix seconds at which the counter's window expires.
    ///
    /// Fixed when the window is created, so repeated reads within the
    /// window agree.
    pub reset_at: u64,
}

/// Shape of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Bucket capacity in tokens.
    pub capacity: u64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Tokens in a bucket seen for the first time. Full when unset.
    pub initial_tokens: Option<u64>,
}

impl BucketSpec {
    /// Create a bucket spec that starts full.
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            initial_tokens: None,
        }
    }

    /// Start new buckets with `tokens` instead of full.
    pub fn with_initial_tokens(mut self, tokens: u64) -> Self {
        self.initial_tokens = Some(tokens);
        self
    }

    /// Tokens held by a bucket that has no stored state.
    pub fn starting_tokens(&self) -> f64 {
        self.initial_tokens
            .map_or(self.capacity, |t| t.min(self.capacity)) as f64
    }

    /// Seconds an empty bucket needs to refill completely, capped at a year.
    pub fn full_refill_secs(&self) -> u64 {
        (self.capacity as f64 / self.refill_rate)
            .ceil()
            .min(MAX_REFILL_SECS as f64) as u64
    }
}

/// Persisted token bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently held, in `[0, capacity]`.
    pub tokens: f64,
    /// Unix seconds (fractional) of the last refill.
    pub last_refill: f64,
}

impl BucketState {
    /// Tokens available at `now` after refilling.
    fn refilled(state: Option<Self>, spec: &BucketSpec, now: f64) -> (f64, f64) {
        let (stored, last_refill) = match state {
            Some(s) => (s.tokens, s.last_refill),
            None => (spec.starting_tokens(), now),
        };
        let elapsed = (now - last_refill).max(0.0);
        let tokens = (stored + elapsed * spec.refill_rate).min(spec.capacity as f64);
        (tokens, last_refill.max(now))
    }

    /// Run one consuming step of the bucket.
    ///
    /// Returns the outcome and, when a token was taken, the state to persist.
    /// A denied attempt leaves the stored state untouched.
    pub fn acquire(state: Option<Self>, spec: &BucketSpec, now: f64) -> (TokenResult, Option<Self>) {
        let (tokens, last_refill) = Self::refilled(state, spec, now);

        if tokens >= 1.0 {
            let tokens = tokens - 1.0;
            let reset_at = now + (spec.capacity as f64 - tokens) / spec.refill_rate;
            let result = TokenResult {
                allowed: true,
                tokens,
                reset_at: reset_at.floor() as u64,
            };
            (result, Some(Self { tokens, last_refill }))
        } else {
            let result = TokenResult {
                allowed: false,
                tokens: 0.0,
                reset_at: (now + 1.0 / spec.refill_rate).floor() as u64,
            };
            (result, None)
        }
    }

    /// Read the bucket without consuming.
    pub fn peek(state: Option<Self>, spec: &BucketSpec, now: f64) -> TokenResult {
        let (tokens, _) = Self::refilled(state, spec, now);
        let reset_at = if tokens >= 1.0 {
            now + (spec.capacity as f64 - tokens) / spec.refill_rate
        } else {
            now + (1.0 - tokens) / spec.refill_rate
        };
        TokenResult {
            allowed: tokens >= 1.0,
            tokens,
            reset_at: reset_at.floor() as u64,
        }
    }
}

/// Outcome of a token bucket step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenResult {
    /// Whether a token was (or could be) taken.
    pub allowed: bool,
    /// Tokens left in the bucket.
    pub tokens: f64,
    /// Unix seconds at which the bucket is full again, or, when denied,
    /// when the next token arrives.
    pub reset_at: u64,
}

impl TokenResult {
    /// Whole tokens left.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }
}

/// A billing period for quota counters, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaPeriod {
    /// First second of the period.
    pub start: u64,
    /// First second after the period.
    pub end: u64,
}

impl QuotaPeriod {
    /// Create a period.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Seconds left in the period at `now`.
    pub fn ttl(&self, now: u64) -> u64 {
        self.end.saturating_sub(now)
    }

    /// Whether `now` falls inside the period.
    pub fn contains(&self, now: u64) -> bool {
        self.start <= now && now < self.end
    }
}

/// Span used when querying analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsPeriod {
    /// Look back `limit` hours.
    Hour,
    /// Look back `limit` days.
    Day,
    /// Look back `limit` weeks.
    Week,
}

impl AnalyticsPeriod {
    /// Length of one period in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }
}

/// One hourly analytics rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    /// Subject key, when the backend tracks per-subject rollups.
    pub key: Option<String>,
    /// Plan of the most recent request in the bucket.
    pub plan: Option<String>,
    /// Endpoint of the most recent request in the bucket.
    pub endpoint: Option<String>,
    /// Requests seen.
    pub requests: u64,
    /// Requests that were limited.
    pub limited: u64,
    /// Unix seconds of the start of the hour.
    pub period: u64,
    /// Granularity of `period`.
    pub period_type: String,
}

/// How long stale records survive cleanup.
///
/// Expired window counters and buckets carry no history and are always
/// removed. Quota records are kept for `quota_days` after their period ends.
/// Analytics rollups are kept for `analytics_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Days a quota record is kept after its period ended.
    pub quota_days: u32,
    /// Days analytics rollups are kept.
    pub analytics_days: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self::days(90)
    }
}

impl Retention {
    /// The same retention for quotas and analytics.
    pub const fn days(days: u32) -> Self {
        Self {
            quota_days: days,
            analytics_days: days,
        }
    }

    /// Quota records whose period ended before this are stale.
    pub fn quota_cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(u64::from(self.quota_days) * 86_400)
    }

    /// Analytics hours starting before this are stale.
    pub fn analytics_cutoff(&self, now: u64) -> u64 {
        hour_start(now.saturating_sub(u64::from(self.analytics_days) * 86_400))
    }
}

/// Start of the hour containing `secs`.
pub fn hour_start(secs: u64) -> u64 {
    secs - secs % 3_600
}
