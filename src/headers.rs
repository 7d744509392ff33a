//! HTTP headers for rate limiting.
//!
//! Standard and extended headers for communicating rate limit and quota
//! status. Response bodies are left to the caller.

use crate::decision::RateLimitInfo;
use crate::engine::RateLimits;
use crate::quota::QuotaInfo;

/// Header names.
pub mod names {
    /// Maximum requests allowed per window.
    pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";

    /// Remaining requests in current window.
    pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";

    /// Unix time at which the window resets.
    pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";

    /// Limit and window length, e.g. `60;w=60`.
    pub const RATE_LIMIT_POLICY: &str = "X-RateLimit-Policy";

    /// Plan the caller was evaluated under.
    pub const RATE_LIMIT_PLAN: &str = "X-RateLimit-Plan";

    /// Seconds until the client should retry (standard HTTP header).
    pub const RETRY_AFTER: &str = "Retry-After";

    /// Monthly quota.
    pub const QUOTA_LIMIT: &str = "X-Quota-Limit";

    /// Monthly quota left.
    pub const QUOTA_REMAINING: &str = "X-Quota-Remaining";

    /// Unix time at which the monthly quota starts over.
    pub const QUOTA_RESET: &str = "X-Quota-Reset";
}

/// Builder for rate limit headers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset: Option<u64>,
    retry_after: Option<u64>,
    policy: Option<String>,
    plan: Option<String>,
    quota_limit: Option<u64>,
    quota_remaining: Option<u64>,
    quota_reset: Option<u64>,
}

impl RateLimitHeaders {
    /// Create a new header builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit header.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the remaining header.
    pub fn remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    /// Set the reset header (Unix seconds).
    pub fn reset(mut self, reset_at: u64) -> Self {
        self.reset = Some(reset_at);
        self
    }

    /// Set the retry-after header (seconds until retry).
    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Set the policy header.
    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    /// Set the plan header.
    pub fn plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    /// Add the quota headers. Only a monthly quota is reported.
    pub fn quota(mut self, quota: &QuotaInfo) -> Self {
        if let Some(monthly) = quota.monthly {
            self.quota_limit = Some(monthly.limit);
            self.quota_remaining = Some(monthly.remaining);
            self.quota_reset = Some(quota.resets_at.unwrap_or(0));
        }
        self
    }

    /// Convert to a vector of (name, value) pairs.
    pub fn to_vec(&self) -> Vec<(&'static str, String)> {
        let fields = [
            (names::RATE_LIMIT_LIMIT, self.limit.map(|v| v.to_string())),
            (names::RATE_LIMIT_REMAINING, self.remaining.map(|v| v.to_string())),
            (names::RATE_LIMIT_RESET, self.reset.map(|v| v.to_string())),
            (names::RATE_LIMIT_POLICY, self.policy.clone()),
            (names::RATE_LIMIT_PLAN, self.plan.clone()),
            (names::RETRY_AFTER, self.retry_after.map(|v| v.to_string())),
            (names::QUOTA_LIMIT, self.quota_limit.map(|v| v.to_string())),
            (names::QUOTA_REMAINING, self.quota_remaining.map(|v| v.to_string())),
            (names::QUOTA_RESET, self.quota_reset.map(|v| v.to_string())),
        ];

        fields
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .collect()
    }
}

impl From<&RateLimitInfo> for RateLimitHeaders {
    fn from(info: &RateLimitInfo) -> Self {
        let mut headers = Self::new()
            .limit(info.limit)
            .remaining(info.remaining)
            .reset(info.reset_at);

        if let Some(retry) = info.retry_after {
            headers = headers.retry_after(retry.as_secs());
        }

        headers
    }
}

impl From<&RateLimits> for RateLimitHeaders {
    fn from(limits: &RateLimits) -> Self {
        let mut headers = Self::new().plan(&limits.plan);

        if let Some((window, status)) = limits.primary() {
            headers = headers
                .limit(status.limit)
                .remaining(if limits.is_limited { 0 } else { status.remaining })
                .reset(status.reset_at)
                .policy(format!("{};w={}", status.limit, window.seconds()));
        }

        if let Some(retry) = limits.retry_after {
            headers = headers.retry_after(retry);
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WindowStatus;
    use crate::plan::Window;
    use std::time::Duration;

    fn header<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_header_builder() {
        let headers = RateLimitHeaders::new()
            .limit(100)
            .remaining(50)
            .reset(1_700_000_030)
            .policy("100;w=60")
            .to_vec();

        assert_eq!(headers.len(), 4);
        assert_eq!(header(&headers, "X-RateLimit-Limit"), Some("100"));
        assert_eq!(header(&headers, "X-RateLimit-Remaining"), Some("50"));
        assert_eq!(header(&headers, "X-RateLimit-Reset"), Some("1700000030"));
        assert_eq!(header(&headers, "X-RateLimit-Policy"), Some("100;w=60"));
    }

    #[test]
    fn test_headers_from_info() {
        let info = RateLimitInfo::new(10, 0, 500).with_retry_after(Duration::from_secs(7));
        let headers = RateLimitHeaders::from(&info).to_vec();
        assert_eq!(header(&headers, "Retry-After"), Some("7"));
        assert_eq!(header(&headers, "X-RateLimit-Reset"), Some("500"));
    }

    #[test]
    fn test_headers_from_limits_and_quota() {
        let mut limits = RateLimits::new("pro");
        limits.windows.insert(
            Window::Second,
            WindowStatus {
                limit: 20,
                remaining: 19,
                reset_at: 1_001,
            },
        );
        limits.windows.insert(
            Window::Minute,
            WindowStatus {
                limit: 300,
                remaining: 299,
                reset_at: 1_060,
            },
        );
        let quota = QuotaInfo::from_usage(Some(1_000), 10, None, 0, Some(2_000));

        let headers = RateLimitHeaders::from(&limits).quota(&quota).to_vec();
        assert_eq!(header(&headers, "X-RateLimit-Limit"), Some("300"));
        assert_eq!(header(&headers, "X-RateLimit-Policy"), Some("300;w=60"));
        assert_eq!(header(&headers, "X-RateLimit-Plan"), Some("pro"));
        assert_eq!(header(&headers, "X-Quota-Remaining"), Some("990"));
        assert_eq!(header(&headers, "X-Quota-Reset"), Some("2000"));
        assert_eq!(header(&headers, "Retry-After"), None);
    }

    #[test]
    fn test_no_quota_headers_without_monthly_quota() {
        let headers = RateLimitHeaders::new()
            .quota(&QuotaInfo::unlimited())
            .to_vec();
        assert!(headers.is_empty());
    }
}
