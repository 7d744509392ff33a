//! Throttle configuration.
//!
//! Loaded from JSON. Every section has defaults, so an empty document is a
//! valid configuration with the `free`, `pro`, `enterprise` and `internal`
//! plans.
//!
//! ```json
//! {
//!   "default_plan": "free",
//!   "plans": { "free": { "requests_per_minute": 60, "requests_per_month": 100000 } },
//!   "token_bucket": { "enabled": true, "burst_size": 10, "refill_rate": 1.0 },
//!   "endpoints": { "POST /api/*/login": { "requests_per_minute": 5, "scope": "ip" } },
//!   "failure_policy": "closed",
//!   "storage": { "driver": "redis", "redis": { "url": "redis://localhost:6379" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::algorithm::{LimiterConfig, LimiterFactory};
use crate::error::{ConfigError, Result};
use crate::key::{BypassList, EndpointOverrides, KeyResolverConfig};
use crate::plan::{EndpointOverride, PlanConfig, PlanTable, default_plans};
use crate::quota::AlertThresholds;
use crate::storage::{Retention, StorageConfig};

/// What to do when the storage backend cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Deny the request.
    #[default]
    Closed,
    /// Let the request through.
    Open,
}

/// Quota section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Track monthly and daily quotas.
    pub enabled: bool,
    /// Days stale quota records are kept before cleanup.
    pub retention_days: u32,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 90,
        }
    }
}

/// Analytics section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    /// Record an analytics event per evaluation.
    pub enabled: bool,
    /// Days analytics rollups are kept.
    pub retention_days: u32,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_days: 90,
        }
    }
}

/// Alert section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Whether the engine reports threshold alerts.
    pub enabled: bool,
    /// Usage percentages that trigger alerts.
    pub thresholds: AlertThresholds,
}

/// Complete throttle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Master switch. When off every request is allowed.
    pub enabled: bool,
    /// Plan for callers without a known plan.
    pub default_plan: String,
    /// Plan definitions by name.
    pub plans: BTreeMap<String, PlanConfig>,
    /// Strategy selection.
    #[serde(flatten)]
    pub limiter: LimiterConfig,
    /// Scope key derivation.
    pub key_resolver: KeyResolverConfig,
    /// Route overrides keyed by `"METHOD /pattern"`.
    pub endpoints: BTreeMap<String, EndpointOverride>,
    /// Quota tracking.
    pub quotas: QuotaSettings,
    /// Callers that are never throttled.
    pub bypass: BypassList,
    /// Usage analytics.
    pub analytics: AnalyticsSettings,
    /// Alert thresholds.
    pub alerts: AlertSettings,
    /// Behaviour during storage outages.
    pub failure_policy: FailurePolicy,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_plan: "free".to_string(),
            plans: default_plans(),
            limiter: LimiterConfig::default(),
            key_resolver: KeyResolverConfig::default(),
            endpoints: default_endpoints(),
            quotas: QuotaSettings::default(),
            bypass: BypassList::default(),
            analytics: AnalyticsSettings::default(),
            alerts: AlertSettings::default(),
            failure_policy: FailurePolicy::default(),
            storage: StorageConfig::default(),
        }
    }
}

fn default_endpoints() -> BTreeMap<String, EndpointOverride> {
    use crate::key::Scope;
    use crate::plan::Window;

    let auth = |per_minute, per_hour| {
        EndpointOverride::new()
            .with_limit(Window::Minute, per_minute)
            .with_limit(Window::Hour, per_hour)
            .with_scope(Scope::Ip)
    };

    BTreeMap::from([
        ("POST /api/*/login".to_string(), auth(5, 20)),
        ("POST /api/*/register".to_string(), auth(3, 10)),
    ])
}

impl ThrottleConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    /// Check everything that would otherwise fail when the engine is built.
    pub fn validate(&self) -> Result<()> {
        self.plan_table()?;
        self.endpoint_overrides()?;
        LimiterFactory::new(self.limiter.clone()).build()?;

        let thresholds = &self.alerts.thresholds;
        if thresholds.warning > thresholds.critical {
            return Err(ConfigError::InvalidValue(format!(
                "alerts.thresholds.warning ({}) is above critical ({})",
                thresholds.warning, thresholds.critical
            ))
            .into());
        }
        Ok(())
    }

    /// Build the plan table.
    pub fn plan_table(&self) -> Result<PlanTable> {
        Ok(PlanTable::from_configs(&self.plans, &self.default_plan)?)
    }

    /// Build the route overrides.
    pub fn endpoint_overrides(&self) -> Result<EndpointOverrides> {
        Ok(EndpointOverrides::from_map(&self.endpoints)?)
    }

    /// How long stale quota and analytics records are kept.
    pub fn retention(&self) -> Retention {
        Retention {
            quota_days: self.quotas.retention_days,
            analytics_days: self.analytics.retention_days,
        }
    }

    /// Alert thresholds, `None` when alerts are disabled.
    pub fn alert_thresholds(&self) -> Option<AlertThresholds> {
        self.alerts.enabled.then_some(self.alerts.thresholds)
    }
}
