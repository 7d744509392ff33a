//! Sliding Window rate limiting algorithm.

use std::time::Duration;

use tracing::debug;

use crate::algorithm::{Algorithm, retry_after};
use crate::clock::{Clock, SharedClock, system_clock};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::storage::Storage;

/// Sliding Window rate limiting algorithm.
///
/// Uses a weighted combination of the current and previous fixed windows to
/// approximate a rolling window without storing a log:
///
/// ```text
/// overlap  = (window - now % window) / window
/// weighted = ceil(previous * overlap + current)
/// ```
///
/// Each window counter lives under `{key}:sliding:{window_start}` and is kept
/// for two windows so the previous count is still there when it is needed.
#[derive(Clone)]
pub struct SlidingWindow {
    clock: SharedClock,
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow").finish()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of `now` relative to the window grid.
struct Frame {
    current_key: String,
    previous_key: String,
    overlap: f64,
    reset_at: u64,
}

impl SlidingWindow {
    /// Create a new Sliding Window algorithm instance.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an instance that reads time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self { clock }
    }

    fn frame(&self, key: &str, window: Duration) -> Frame {
        let now = self.clock.now_secs();
        let window_secs = window.as_secs().max(1);
        let elapsed = now % window_secs;
        let window_start = now - elapsed;

        Frame {
            current_key: format!("{key}:sliding:{window_start}"),
            previous_key: format!("{key}:sliding:{}", window_start.saturating_sub(window_secs)),
            overlap: (window_secs - elapsed) as f64 / window_secs as f64,
            reset_at: window_start + window_secs,
        }
    }

    /// Calculate weighted count using current and previous window.
    fn weighted_count(current: u64, previous: u64, overlap: f64) -> u64 {
        (previous as f64 * overlap + current as f64).ceil() as u64
    }
}

impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn attempt<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        let frame = self.frame(key, window);

        let current = storage.increment(&frame.current_key, window * 2).await?.count;
        let previous = storage.get(&frame.previous_key).await?.unwrap_or(0);

        let weighted = Self::weighted_count(current, previous, frame.overlap);
        let allowed = weighted <= limit;

        let mut info = RateLimitInfo::new(limit, limit.saturating_sub(weighted), frame.reset_at)
            .with_algorithm(self.name())
            .with_metadata(
                DecisionMetadata::new()
                    .with_key(frame.current_key)
                    .with_count(current)
                    .with_previous_count(previous),
            );

        if !allowed {
            debug!(key = %key, weighted, limit, "Sliding window exceeded");
            info = info.with_retry_after(retry_after(frame.reset_at, self.clock.now_secs()));
        }

        Ok(Decision::from_allowed(allowed, info))
    }

    async fn remaining<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<u64> {
        let frame = self.frame(key, window);

        let current = storage.get(&frame.current_key).await?.unwrap_or(0);
        let previous = storage.get(&frame.previous_key).await?.unwrap_or(0);

        Ok(limit.saturating_sub(Self::weighted_count(current, previous, frame.overlap)))
    }

    async fn reset<S: Storage>(&self, storage: &S, key: &str, window: Duration) -> Result<bool> {
        let frame = self.frame(key, window);

        let current = storage.reset(&frame.current_key).await?;
        let previous = storage.reset(&frame.previous_key).await?;
        Ok(current || previous)
    }
}
