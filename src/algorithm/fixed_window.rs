//! Fixed Window rate limiting algorithm.

use std::time::Duration;

use tracing::debug;

use crate::algorithm::{Algorithm, retry_after};
use crate::clock::{Clock, SharedClock, system_clock};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::storage::Storage;

/// Fixed Window rate limiting algorithm.
///
/// One counter per key that restarts when its window expires. A client that
/// bursts at the end of one window and the start of the next can get up to
/// twice the limit through in a short span; that is inherent to the model.
#[derive(Clone)]
pub struct FixedWindow {
    clock: SharedClock,
}

impl std::fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow").finish()
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedWindow {
    /// Create a new Fixed Window algorithm instance.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an instance that reads time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    async fn attempt<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        let result = storage.increment(key, window).await?;
        let allowed = result.count <= limit;

        let mut info = RateLimitInfo::new(limit, limit.saturating_sub(result.count), result.reset_at)
            .with_algorithm(self.name())
            .with_metadata(DecisionMetadata::new().with_key(key).with_count(result.count));

        if !allowed {
            debug!(key = %key, count = result.count, limit, "Fixed window exceeded");
            info = info.with_retry_after(retry_after(result.reset_at, self.clock.now_secs()));
        }

        Ok(Decision::from_allowed(allowed, info))
    }

    async fn remaining<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        limit: u64,
        _window: Duration,
    ) -> Result<u64> {
        let count = storage.get(key).await?.unwrap_or(0);
        Ok(limit.saturating_sub(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn setup() -> (FixedWindow, MemoryStorage, ManualClock) {
        let clock = ManualClock::at_secs(1_000);
        let algorithm = FixedWindow::with_clock(Arc::new(clock.clone()));
        (algorithm, MemoryStorage::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_fixed_window_allows_up_to_limit() {
        let (algorithm, storage, _) = setup();
        let window = Duration::from_secs(60);

        for expected in (0..5).rev() {
            let decision = algorithm.attempt(&storage, "k", 5, window).await.unwrap();
            assert!(decision.is_allowed());
            assert_eq!(decision.info().remaining, expected);
            assert_eq!(decision.info().reset_at, 1_060);
        }

        let decision = algorithm.attempt(&storage, "k", 5, window).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.info().remaining, 0);
        assert_eq!(decision.info().retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_fixed_window_restarts_after_window() {
        let (algorithm, storage, clock) = setup();
        let window = Duration::from_secs(10);

        for _ in 0..3 {
            algorithm.attempt(&storage, "k", 2, window).await.unwrap();
        }
        clock.advance(window);

        let decision = algorithm.attempt(&storage, "k", 2, window).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 1);
    }

    #[tokio::test]
    async fn test_boundary_burst_is_possible() {
        let (algorithm, storage, clock) = setup();
        let window = Duration::from_secs(60);

        // Open the window, then burst in its last second and the next one.
        algorithm.attempt(&storage, "k", 5, window).await.unwrap();
        clock.advance(Duration::from_secs(59));

        let mut allowed = 0;
        for _ in 0..4 {
            if algorithm.attempt(&storage, "k", 5, window).await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        clock.advance(Duration::from_secs(1));
        for _ in 0..5 {
            if algorithm.attempt(&storage, "k", 5, window).await.unwrap().is_allowed() {
                allowed += 1;
            }
        }

        // Nine requests inside two seconds against a limit of five.
        assert_eq!(allowed, 9);
    }

    #[tokio::test]
    async fn test_remaining_does_not_count() {
        let (algorithm, storage, _) = setup();
        let window = Duration::from_secs(60);

        algorithm.attempt(&storage, "k", 5, window).await.unwrap();
        assert_eq!(algorithm.remaining(&storage, "k", 5, window).await.unwrap(), 4);
        assert_eq!(algorithm.remaining(&storage, "k", 5, window).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_zero_limit_denies_everything() {
        let (algorithm, storage, _) = setup();
        let decision = algorithm
            .attempt(&storage, "k", 0, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(decision.is_denied());
    }
}
