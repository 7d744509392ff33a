//! Billing-cycle quotas.
//!
//! Quotas count requests over calendar periods (UTC month and UTC day),
//! independently of the short rate limiting windows. Granting extra quota is
//! modelled as a reduction of recorded usage that never goes below zero.
//!
//! # Example
//!
//! ```ignore
//! use smart_throttle::{MemoryStorage, QuotaTracker};
//! use std::sync::Arc;
//!
//! let tracker = QuotaTracker::new(Arc::new(MemoryStorage::new()));
//! tracker.consume("user:42", 1).await?;
//!
//! let info = tracker.info(&plan, "user:42").await?;
//! if info.is_exceeded {
//!     // reject
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, SharedClock, system_clock};
use crate::error::{RateLimitError, Result};
use crate::plan::Plan;
use crate::storage::{QuotaPeriod, Storage};

/// Usage against one quota horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Allowed requests in the period.
    pub limit: u64,
    /// Requests used in the period.
    pub used: u64,
    /// Requests left, never negative.
    pub remaining: u64,
}

impl QuotaUsage {
    /// Usage of `used` against `limit`.
    pub fn new(limit: u64, used: u64) -> Self {
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
        }
    }

    /// Whether the horizon is used up.
    pub fn is_exceeded(&self) -> bool {
        self.used >= self.limit
    }
}

/// Alert level reached by quota usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaThreshold {
    /// Usage passed the warning percentage.
    Warning,
    /// Usage passed the critical percentage.
    Critical,
}

/// Percentages at which alerts fire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Warning level in percent.
    pub warning: f64,
    /// Critical level in percent.
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 80.0,
            critical: 95.0,
        }
    }
}

impl AlertThresholds {
    /// The alert level `percentage` has reached.
    pub fn classify(&self, percentage: f64) -> Option<QuotaThreshold> {
        if percentage >= self.critical {
            Some(QuotaThreshold::Critical)
        } else if percentage >= self.warning {
            Some(QuotaThreshold::Warning)
        } else {
            None
        }
    }
}

/// Quota state for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Monthly usage, when the plan has a monthly quota.
    pub monthly: Option<QuotaUsage>,
    /// Daily usage, when the plan has a daily quota.
    pub daily: Option<QuotaUsage>,
    /// Unix seconds at which the monthly quota starts over.
    pub resets_at: Option<u64>,
    /// Share of the monthly quota used, in percent.
    pub percentage_used: f64,
    /// Whether any horizon is used up.
    pub is_exceeded: bool,
}

impl QuotaInfo {
    /// Build from raw counts. A `None` limit leaves that horizon untracked.
    pub fn from_usage(
        monthly_limit: Option<u64>,
        monthly_used: u64,
        daily_limit: Option<u64>,
        daily_used: u64,
        resets_at: Option<u64>,
    ) -> Self {
        let monthly = monthly_limit.map(|limit| QuotaUsage::new(limit, monthly_used));
        let daily = daily_limit.map(|limit| QuotaUsage::new(limit, daily_used));

        let percentage_used = match monthly {
            Some(usage) if usage.limit > 0 => usage.used as f64 / usage.limit as f64 * 100.0,
            _ => 0.0,
        };
        let is_exceeded = monthly.is_some_and(|u| u.is_exceeded())
            || daily.is_some_and(|u| u.is_exceeded());

        Self {
            monthly,
            daily,
            resets_at,
            percentage_used,
            is_exceeded,
        }
    }

    /// Quota state of a plan without quotas.
    pub fn unlimited() -> Self {
        Self::from_usage(None, 0, None, 0, None)
    }

    /// Requests left across all horizons, `None` when none is configured.
    pub fn remaining(&self) -> Option<u64> {
        match (self.monthly, self.daily) {
            (Some(m), Some(d)) => Some(m.remaining.min(d.remaining)),
            (Some(m), None) => Some(m.remaining),
            (None, Some(d)) => Some(d.remaining),
            (None, None) => None,
        }
    }

    /// The alert level the monthly usage has reached.
    pub fn threshold(&self, thresholds: &AlertThresholds) -> Option<QuotaThreshold> {
        self.monthly?;
        thresholds.classify(self.percentage_used)
    }
}

/// Tracks monthly and daily usage per subject.
///
/// Counters live in the storage quota namespace under `<scope>:month` and
/// `<scope>:day`, each bound to its current calendar period.
pub struct QuotaTracker<S> {
    storage: Arc<S>,
    clock: SharedClock,
}

impl<S> Clone for QuotaTracker<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: self.clock.clone(),
        }
    }
}

impl<S> std::fmt::Debug for QuotaTracker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker").finish_non_exhaustive()
    }
}

impl<S: Storage> QuotaTracker<S> {
    /// Create a tracker over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            clock: system_clock(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record `cost` units for `scope`. Returns the monthly and daily totals.
    pub async fn consume(&self, scope: &str, cost: u64) -> Result<(u64, u64)> {
        let (month, day) = self.periods()?;
        let monthly = self
            .storage
            .increment_quota(&month_key(scope), cost, &month)
            .await?;
        let daily = self
            .storage
            .increment_quota(&day_key(scope), cost, &day)
            .await?;
        Ok((monthly, daily))
    }

    /// Record `cost` units for `scope` and report the resulting state.
    pub async fn track(&self, plan: &Plan, scope: &str, cost: u64) -> Result<QuotaInfo> {
        let (monthly, daily) = self.consume(scope, cost).await?;
        let info = self.build(plan, monthly, daily)?;
        if info.is_exceeded {
            debug!(scope = %scope, plan = %plan.name, monthly, daily, "Quota exceeded");
        }
        Ok(info)
    }

    /// Current quota state for `scope` without recording anything.
    pub async fn info(&self, plan: &Plan, scope: &str) -> Result<QuotaInfo> {
        let (monthly, daily) = self.usage(scope).await?;
        self.build(plan, monthly, daily)
    }

    /// Current monthly and daily totals.
    pub async fn usage(&self, scope: &str) -> Result<(u64, u64)> {
        let (month, day) = self.periods()?;
        let monthly = self.storage.get_quota(&month_key(scope), &month).await?;
        let daily = self.storage.get_quota(&day_key(scope), &day).await?;
        Ok((monthly, daily))
    }

    /// Requests left for `scope` under `plan`, most restrictive horizon.
    pub async fn remaining(&self, plan: &Plan, scope: &str) -> Result<Option<u64>> {
        Ok(self.info(plan, scope).await?.remaining())
    }

    /// Grant `amount` extra requests this month.
    ///
    /// Lowers the recorded monthly usage, clamped at zero. Returns the new
    /// monthly usage.
    pub async fn add_quota(&self, scope: &str, amount: u64) -> Result<u64> {
        let (month, _) = self.periods()?;
        let used = self
            .storage
            .release_quota(&month_key(scope), amount, &month)
            .await?;
        debug!(scope = %scope, amount, used, "Quota granted");
        Ok(used)
    }

    /// Forget all quota usage for `scope`.
    pub async fn reset(&self, scope: &str) -> Result<bool> {
        let monthly = self.storage.reset_quota(&month_key(scope)).await?;
        let daily = self.storage.reset_quota(&day_key(scope)).await?;
        Ok(monthly || daily)
    }

    fn build(&self, plan: &Plan, monthly: u64, daily: u64) -> Result<QuotaInfo> {
        let (month, _) = self.periods()?;
        Ok(QuotaInfo::from_usage(
            plan.requests_per_month,
            monthly,
            plan.daily_limit(),
            daily,
            Some(month.end),
        ))
    }

    fn periods(&self) -> Result<(QuotaPeriod, QuotaPeriod)> {
        let now = self.clock.now_secs();
        Ok((month_period(now)?, day_period(now)?))
    }
}

fn month_key(scope: &str) -> String {
    format!("{scope}:month")
}

fn day_key(scope: &str) -> String {
    format!("{scope}:day")
}

fn utc_date(secs: u64) -> Result<NaiveDate> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.date_naive())
        .ok_or_else(|| RateLimitError::Internal(format!("timestamp {secs} is out of range")))
}

fn midnight(date: NaiveDate) -> u64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp().max(0) as u64
}

/// The UTC calendar month containing `now`.
pub fn month_period(now: u64) -> Result<QuotaPeriod> {
    let date = utc_date(now)?;
    let period = date
        .with_day(1)
        .and_then(|start| Some((start, start.checked_add_months(Months::new(1))?)));

    match period {
        Some((start, end)) => Ok(QuotaPeriod::new(midnight(start), midnight(end))),
        None => Err(RateLimitError::Internal(format!("no month after {date}"))),
    }
}

/// The UTC calendar day containing `now`.
pub fn day_period(now: u64) -> Result<QuotaPeriod> {
    let date = utc_date(now)?;
    match date.checked_add_days(Days::new(1)) {
        Some(end) => Ok(QuotaPeriod::new(midnight(date), midnight(end))),
        None => Err(RateLimitError::Internal(format!("no day after {date}"))),
    }
}
