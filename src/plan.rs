//! Subscription plans and their per-window limits.
//!
//! A plan maps each [`Window`] to an optional request limit. A missing limit
//! means the window is unlimited and no counter is ever touched for it.
//!
//! # Example
//!
//! ```ignore
//! use smart_throttle::plan::{Plan, PlanTable, Window};
//!
//! let free = Plan::new("free").with_limit(Window::Minute, 60);
//! let table = PlanTable::new("free").with_plan(free);
//!
//! assert_eq!(table.get("unknown").name, "free");
//! assert_eq!(table.get("free").limit(Window::Minute), Some(60));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::key::Scope;

/// A rate limiting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    /// One second.
    Second,
    /// One minute.
    Minute,
    /// One hour.
    Hour,
    /// One day.
    Day,
}

impl Window {
    /// Every window in evaluation order.
    pub const ALL: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Day];

    /// Window length in seconds.
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Window length.
    pub const fn duration(self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Name used in keys, headers and configuration.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Window {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(ConfigError::InvalidValue(format!(
                "unrecognized window type '{other}'"
            ))),
        }
    }
}

/// Plan definition as written in configuration.
///
/// Keys follow the `requests_per_<window>` convention. A key with an
/// unrecognized window, or any other unknown key, is rejected when the plan
/// is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Display label. Defaults to `"<Name> Plan"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Requests per second.
    #[serde(default)]
    pub requests_per_second: Option<u64>,
    /// Requests per minute.
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    /// Requests per hour.
    #[serde(default)]
    pub requests_per_hour: Option<u64>,
    /// Requests per day.
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// Monthly quota.
    #[serde(default)]
    pub requests_per_month: Option<u64>,
    /// Daily quota. Falls back to `requests_per_day` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_quota: Option<u64>,
    /// Token bucket capacity. Zero means "use the strategy default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_size: Option<u64>,
    /// Token bucket refill rate in tokens per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_refill_rate: Option<f64>,
    /// Concurrent request allowance, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_requests: Option<u64>,
    /// Daily bandwidth allowance in megabytes, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_day_mb: Option<u64>,
    /// Keys not recognized above.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A resolved subscription plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Plan name.
    pub name: String,
    /// Display label.
    pub label: String,
    /// Requests per second.
    pub requests_per_second: Option<u64>,
    /// Requests per minute.
    pub requests_per_minute: Option<u64>,
    /// Requests per hour.
    pub requests_per_hour: Option<u64>,
    /// Requests per day.
    pub requests_per_day: Option<u64>,
    /// Monthly quota.
    pub requests_per_month: Option<u64>,
    /// Daily quota override, see [`Plan::daily_limit`].
    pub daily_quota: Option<u64>,
    /// Token bucket capacity override.
    pub burst_size: Option<u64>,
    /// Token bucket refill rate override.
    pub burst_refill_rate: Option<f64>,
    /// Concurrent request allowance.
    pub concurrent_requests: Option<u64>,
    /// Daily bandwidth allowance in megabytes.
    pub bandwidth_per_day_mb: Option<u64>,
}

impl Plan {
    /// A plan with no limits at all.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: default_label(&name),
            name,
            requests_per_second: None,
            requests_per_minute: None,
            requests_per_hour: None,
            requests_per_day: None,
            requests_per_month: None,
            daily_quota: None,
            burst_size: None,
            burst_refill_rate: None,
            concurrent_requests: None,
            bandwidth_per_day_mb: None,
        }
    }

    /// Build a plan from its configuration.
    pub fn from_config(name: &str, config: &PlanConfig) -> Result<Self, ConfigError> {
        if let Some(key) = config.extra.keys().next() {
            let reason = match key.strip_prefix("requests_per_") {
                Some(window) => format!("unrecognized window type '{window}'"),
                None => format!("unknown setting '{key}'"),
            };
            return Err(ConfigError::invalid_plan(name, reason));
        }

        if let Some(rate) = config.burst_refill_rate {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(ConfigError::invalid_plan(
                    name,
                    format!("burst_refill_rate must be positive, got {rate}"),
                ));
            }
        }

        Ok(Self {
            name: name.to_string(),
            label: config.label.clone().unwrap_or_else(|| default_label(name)),
            requests_per_second: config.requests_per_second,
            requests_per_minute: config.requests_per_minute,
            requests_per_hour: config.requests_per_hour,
            requests_per_day: config.requests_per_day,
            requests_per_month: config.requests_per_month,
            daily_quota: config.daily_quota,
            burst_size: config.burst_size.filter(|&size| size > 0),
            burst_refill_rate: config.burst_refill_rate,
            concurrent_requests: config.concurrent_requests,
            bandwidth_per_day_mb: config.bandwidth_per_day_mb,
        })
    }

    /// Set the limit for `window`.
    pub fn with_limit(mut self, window: Window, limit: u64) -> Self {
        *self.limit_mut(window) = Some(limit);
        self
    }

    /// Set the monthly quota.
    pub fn with_monthly_quota(mut self, limit: u64) -> Self {
        self.requests_per_month = Some(limit);
        self
    }

    /// Set the daily quota.
    pub fn with_daily_quota(mut self, limit: u64) -> Self {
        self.daily_quota = Some(limit);
        self
    }

    /// Set the token bucket capacity and refill rate used for this plan.
    pub fn with_burst(mut self, burst_size: u64, refill_rate: f64) -> Self {
        self.burst_size = Some(burst_size);
        self.burst_refill_rate = Some(refill_rate);
        self
    }

    /// The limit for `window`, `None` when unlimited.
    pub fn limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Second => self.requests_per_second,
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
        }
    }

    /// The daily quota ceiling: an explicit daily quota, else the per-day
    /// request limit.
    pub fn daily_limit(&self) -> Option<u64> {
        self.daily_quota.or(self.requests_per_day)
    }

    /// Whether any quota horizon applies to this plan.
    pub fn has_quota(&self) -> bool {
        self.requests_per_month.is_some() || self.daily_limit().is_some()
    }

    fn limit_mut(&mut self, window: Window) -> &mut Option<u64> {
        match window {
            Window::Second => &mut self.requests_per_second,
            Window::Minute => &mut self.requests_per_minute,
            Window::Hour => &mut self.requests_per_hour,
            Window::Day => &mut self.requests_per_day,
        }
    }

    /// Whether `window` has no limit.
    pub fn is_unlimited(&self, window: Window) -> bool {
        self.limit(window).is_none()
    }

    /// The windows that carry a limit, in evaluation order.
    pub fn limited_windows(&self) -> impl Iterator<Item = (Window, u64)> + '_ {
        Window::ALL
            .into_iter()
            .filter_map(|window| self.limit(window).map(|limit| (window, limit)))
    }

    /// A copy with the windows named by `endpoint` replaced.
    pub fn with_overrides(&self, endpoint: &EndpointOverride) -> Self {
        let mut plan = self.clone();
        for window in Window::ALL {
            if let Some(limit) = endpoint.limit(window) {
                *plan.limit_mut(window) = Some(limit);
            }
        }
        plan
    }
}

fn default_label(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{} Plan", first.to_uppercase(), chars.as_str()),
        None => "Plan".to_string(),
    }
}

/// Limits that replace a plan's limits on matching routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointOverride {
    /// Requests per second.
    pub requests_per_second: Option<u64>,
    /// Requests per minute.
    pub requests_per_minute: Option<u64>,
    /// Requests per hour.
    pub requests_per_hour: Option<u64>,
    /// Requests per day.
    pub requests_per_day: Option<u64>,
    /// Identity the route's counters are scoped by.
    pub scope: Option<Scope>,
    /// Quota units one request costs.
    pub cost: Option<u64>,
}

impl EndpointOverride {
    /// An override with no limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit for `window`.
    pub fn with_limit(mut self, window: Window, limit: u64) -> Self {
        match window {
            Window::Second => self.requests_per_second = Some(limit),
            Window::Minute => self.requests_per_minute = Some(limit),
            Window::Hour => self.requests_per_hour = Some(limit),
            Window::Day => self.requests_per_day = Some(limit),
        }
        self
    }

    /// Scope the route's counters by `scope`.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Charge `cost` quota units per request.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// The overriding limit for `window`.
    pub fn limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Second => self.requests_per_second,
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
        }
    }

    /// Quota units one request costs.
    pub fn cost(&self) -> u64 {
        self.cost.unwrap_or(1)
    }
}

/// Plans by name, with a fallback for callers without a known plan.
#[derive(Debug, Clone)]
pub struct PlanTable {
    plans: HashMap<String, Plan>,
    default: Plan,
}

impl PlanTable {
    /// An empty table whose fallback is `default_plan`.
    ///
    /// Until a plan with that name is added the fallback is unlimited.
    pub fn new(default_plan: impl Into<String>) -> Self {
        Self {
            plans: HashMap::new(),
            default: Plan::new(default_plan),
        }
    }

    /// Build every plan in `configs`.
    ///
    /// Fails when a plan is invalid or `default_plan` is not among them.
    pub fn from_configs(
        configs: &BTreeMap<String, PlanConfig>,
        default_plan: &str,
    ) -> Result<Self, ConfigError> {
        let plans = configs
            .iter()
            .map(|(name, config)| Ok((name.clone(), Plan::from_config(name, config)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        let default = plans
            .get(default_plan)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPlan(default_plan.to_string()))?;

        Ok(Self { plans, default })
    }

    /// Add or replace a plan.
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.insert(plan);
        self
    }

    /// Add or replace a plan.
    pub fn insert(&mut self, plan: Plan) {
        if plan.name == self.default.name {
            self.default = plan.clone();
        }
        self.plans.insert(plan.name.clone(), plan);
    }

    /// The plan called `name`, or the default plan.
    pub fn get(&self, name: &str) -> &Plan {
        self.plans.get(name).unwrap_or(&self.default)
    }

    /// The plan called `name`, without fallback.
    pub fn find(&self, name: &str) -> Option<&Plan> {
        self.plans.get(name)
    }

    /// Name of the fallback plan.
    pub fn default_plan(&self) -> &str {
        &self.default.name
    }

    /// Plan names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.plans.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The plans shipped as configuration defaults.
pub fn default_plans() -> BTreeMap<String, PlanConfig> {
    let plan = |label: &str,
                limits: [Option<u64>; 5],
                burst: Option<(u64, f64)>,
                concurrent: Option<u64>,
                bandwidth: Option<u64>| PlanConfig {
        label: Some(label.to_string()),
        requests_per_second: limits[0],
        requests_per_minute: limits[1],
        requests_per_hour: limits[2],
        requests_per_day: limits[3],
        requests_per_month: limits[4],
        burst_size: burst.map(|(size, _)| size),
        burst_refill_rate: burst.map(|(_, rate)| rate),
        concurrent_requests: concurrent,
        bandwidth_per_day_mb: bandwidth,
        ..Default::default()
    };

    BTreeMap::from([
        (
            "free".to_string(),
            plan(
                "Free Plan",
                [Some(5), Some(60), Some(500), Some(5_000), Some(100_000)],
                Some((10, 1.0)),
                Some(5),
                Some(100),
            ),
        ),
        (
            "pro".to_string(),
            plan(
                "Pro Plan",
                [Some(20), Some(300), Some(5_000), Some(50_000), Some(1_000_000)],
                Some((50, 5.0)),
                Some(20),
                Some(1_000),
            ),
        ),
        (
            "enterprise".to_string(),
            plan(
                "Enterprise Plan",
                [Some(100), Some(1_000), Some(20_000), Some(200_000), None],
                Some((200, 20.0)),
                Some(100),
                None,
            ),
        ),
        (
            "internal".to_string(),
            plan("Internal Services", [None; 5], None, None, None),
        ),
    ])
}
