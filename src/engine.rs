//! The throttle engine.
//!
//! `ThrottleEngine` evaluates every window of a plan against one storage
//! backend and merges the outcomes into a single [`RateLimits`] value. It
//! also fronts the quota tracker and the administrative operations.
//!
//! # Example
//!
//! ```ignore
//! use smart_throttle::{MemoryStorage, Plan, PlanTable, ThrottleEngine, Window};
//!
//! let plans = PlanTable::new("free")
//!     .with_plan(Plan::new("free").with_limit(Window::Minute, 60));
//!
//! let engine = ThrottleEngine::builder()
//!     .plans(plans)
//!     .build(MemoryStorage::new())?;
//!
//! let limits = engine.evaluate("free", "user:42").await?;
//! if limits.is_limited {
//!     println!("limited by {:?}, retry in {:?}s", limits.limited_by, limits.retry_after);
//! }
//! ```
//!
//! Counting is fail-forward: once an increment has reached storage it is not
//! rolled back, even if the caller gives up on the request afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::algorithm::{Algorithm, Limiter, LimiterConfig, LimiterFactory};
use crate::clock::{Clock, SharedClock, system_clock};
use crate::config::{FailurePolicy, ThrottleConfig};
use crate::error::Result;
use crate::headers::RateLimitHeaders;
use crate::key::{
    BypassList, EndpointOverrides, KeyResolverConfig, PlanResolver, RequestInfo, Resolver,
    ScopeResolver,
};
use crate::plan::{Plan, PlanTable, Window};
use crate::quota::{AlertThresholds, QuotaInfo, QuotaThreshold, QuotaTracker};
use crate::storage::{AnalyticsPeriod, AnalyticsRecord, Retention, Storage};

/// Retry hint returned when a storage outage denies a request.
const DEGRADED_RETRY_SECS: u64 = 60;

/// Capacity of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    /// Requests allowed in the window.
    pub limit: u64,
    /// Requests left, never negative.
    pub remaining: u64,
    /// Unix seconds at which the window resets.
    pub reset_at: u64,
}

/// Outcome of evaluating every window of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    /// Plan the request was evaluated under.
    pub plan: String,
    /// Status of every limited window.
    pub windows: BTreeMap<Window, WindowStatus>,
    /// Whether any window was exceeded.
    pub is_limited: bool,
    /// First exceeded window in second, minute, hour, day order.
    pub limited_by: Option<Window>,
    /// Seconds until the limiting window resets.
    pub retry_after: Option<u64>,
    /// Set when storage was unreachable and the failure policy decided.
    pub degraded: bool,
}

impl RateLimits {
    /// An unlimited outcome for `plan`.
    pub fn new(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            windows: BTreeMap::new(),
            is_limited: false,
            limited_by: None,
            retry_after: None,
            degraded: false,
        }
    }

    /// Status of `window`, if the plan limits it.
    pub fn window(&self, window: Window) -> Option<&WindowStatus> {
        self.windows.get(&window)
    }

    /// The window to report in headers: minute, then second, hour, day.
    pub fn primary(&self) -> Option<(Window, &WindowStatus)> {
        [Window::Minute, Window::Second, Window::Hour, Window::Day]
            .into_iter()
            .find_map(|window| self.window(window).map(|status| (window, status)))
    }

    /// Whether the request may pass.
    pub fn is_allowed(&self) -> bool {
        !self.is_limited
    }

    /// Share of the primary window used, in percent.
    pub fn percentage_used(&self) -> Option<f64> {
        let (_, status) = self.primary()?;
        if status.limit == 0 {
            return None;
        }
        let used = status.limit.saturating_sub(status.remaining);
        Some(used as f64 / status.limit as f64 * 100.0)
    }

    /// Headers describing this outcome.
    pub fn to_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders::from(self)
    }
}

/// Evaluates plans, quotas and administrative operations over one storage.
pub struct ThrottleEngine<S> {
    storage: Arc<S>,
    limiter: Limiter,
    plans: PlanTable,
    endpoints: EndpointOverrides,
    bypass: BypassList,
    scopes: ScopeResolver,
    quotas: QuotaTracker<S>,
    quotas_enabled: bool,
    analytics_enabled: bool,
    alerts: Option<AlertThresholds>,
    retention: Retention,
    failure_policy: FailurePolicy,
    enabled: bool,
    clock: SharedClock,
}

impl<S> std::fmt::Debug for ThrottleEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("limiter", &self.limiter)
            .field("plans", &self.plans)
            .field("endpoints", &self.endpoints)
            .field("failure_policy", &self.failure_policy)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ThrottleEngine<()> {
    /// Create a new engine builder.
    pub fn builder() -> ThrottleEngineBuilder {
        ThrottleEngineBuilder::new()
    }
}

impl<S: Storage> ThrottleEngine<S> {
    /// Build an engine from configuration over `storage`.
    pub fn from_config(config: &ThrottleConfig, storage: S) -> Result<Self> {
        ThrottleEngineBuilder::from_config(config)?.build(storage)
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The strategy enforcing every window.
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// The plan table.
    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    /// The quota tracker.
    pub fn quotas(&self) -> &QuotaTracker<S> {
        &self.quotas
    }

    /// Behaviour during storage outages.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// A request resolver using the configured scope derivation, falling
    /// back to this engine's default plan.
    pub fn resolver<P>(&self, plans: P) -> Resolver<P> {
        Resolver::new(plans, self.scopes.clone(), self.plans.default_plan())
    }

    /// The alert level `quota` has reached. `None` while alerts are off.
    pub fn quota_alert(&self, quota: &QuotaInfo) -> Option<QuotaThreshold> {
        quota.threshold(self.alerts.as_ref()?)
    }

    /// The alert level the primary window of `limits` has reached. `None`
    /// while alerts are off.
    pub fn rate_alert(&self, limits: &RateLimits) -> Option<QuotaThreshold> {
        self.alerts.as_ref()?.classify(limits.percentage_used()?)
    }

    /// Count one request for `scope` under `plan` against every window.
    ///
    /// Every limited window is counted, even after an earlier one is
    /// exceeded, so usage stays observable. Unlimited windows are skipped
    /// without touching storage. An unknown plan name falls back to the
    /// default plan.
    pub async fn evaluate(&self, plan: &str, scope: &str) -> Result<RateLimits> {
        let plan = self.plans.get(plan);
        self.evaluate_plan(plan, scope, None).await
    }

    /// Like [`evaluate`](Self::evaluate), applying the route override for
    /// `method` and `path`.
    ///
    /// A matching route gets its own counters, keyed by the rule that
    /// matched.
    pub async fn evaluate_endpoint(
        &self,
        plan: &str,
        scope: &str,
        method: &str,
        path: &str,
    ) -> Result<RateLimits> {
        let base = self.plans.get(plan);
        match self.endpoints.find(method, path) {
            Some(endpoint) => {
                let plan = base.with_overrides(endpoint.config);
                let scope = format!("{scope}:{}", endpoint.route);
                self.evaluate_plan(&plan, &scope, Some(endpoint.route)).await
            }
            None => {
                let route = format!("{} {path}", method.to_ascii_uppercase());
                self.evaluate_plan(base, scope, Some(&route)).await
            }
        }
    }

    /// [`evaluate`](Self::evaluate) with the failure policy applied.
    ///
    /// When storage is unreachable the result is flagged `degraded` and is
    /// limited under [`FailurePolicy::Closed`]. Other errors are returned.
    pub async fn evaluate_or_fallback(&self, plan: &str, scope: &str) -> Result<RateLimits> {
        let result = self.evaluate(plan, scope).await;
        self.or_fallback(plan, scope, result)
    }

    /// Resolve, bypass-check and evaluate a request.
    ///
    /// Applies route overrides, including a route's forced scope, and the
    /// failure policy.
    pub async fn evaluate_request<R, P>(
        &self,
        resolver: &Resolver<P>,
        request: &R,
    ) -> Result<RateLimits>
    where
        R: RequestInfo,
        P: PlanResolver<R>,
    {
        if !self.enabled || self.bypass.is_bypassed(request) {
            let plan = self.plans.get(&resolver.plan(request));
            debug!(plan = %plan.name, "Throttling bypassed");
            return Ok(RateLimits::new(plan.name.clone()));
        }

        let (plan, mut scope) = resolver.resolve(request)?;

        let forced = self
            .endpoints
            .find(request.method(), request.path())
            .and_then(|endpoint| endpoint.config.scope);
        if let Some(key) = forced.and_then(|s| resolver.scopes().resolve_as(Some(s), request)) {
            scope = key;
        }

        let result = self
            .evaluate_endpoint(&plan, &scope, request.method(), request.path())
            .await;
        self.or_fallback(&plan, &scope, result)
    }

    /// Whether the next request for `scope` would be limited, without
    /// counting it.
    pub async fn would_limit(&self, plan: &str, scope: &str) -> Result<bool> {
        let plan = self.plans.get(plan);
        let limiter = self.limiter.for_plan(plan);

        for (window, limit) in plan.limited_windows() {
            let key = window_key(scope, window);
            if limiter
                .remaining(&*self.storage, &key, limit, window.duration())
                .await?
                == 0
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Requests left in `window`, without counting. `None` when unlimited.
    pub async fn remaining(&self, plan: &str, scope: &str, window: Window) -> Result<Option<u64>> {
        let plan = self.plans.get(plan);
        let Some(limit) = plan.limit(window) else {
            return Ok(None);
        };

        let remaining = self
            .limiter
            .for_plan(plan)
            .remaining(&*self.storage, &window_key(scope, window), limit, window.duration())
            .await?;
        Ok(Some(remaining))
    }

    /// Quota units a request to `method` `path` costs. 1 unless a route
    /// override says otherwise.
    pub fn request_cost(&self, method: &str, path: &str) -> u64 {
        self.endpoints
            .find(method, path)
            .map_or(1, |endpoint| endpoint.config.cost())
    }

    /// Charge `cost` quota units to `scope` and report the quota state.
    ///
    /// Plans without quotas, or engines with quotas disabled, never touch
    /// storage.
    pub async fn evaluate_quota(&self, plan: &str, scope: &str, cost: u64) -> Result<QuotaInfo> {
        let plan = self.plans.get(plan);
        if !self.tracks_quota(plan) {
            return Ok(QuotaInfo::unlimited());
        }
        let quota = self.quotas.track(plan, scope, cost).await?;
        if let Some(level) = self.quota_alert(&quota) {
            info!(
                scope = %scope,
                plan = %plan.name,
                ?level,
                percentage_used = quota.percentage_used,
                "Quota alert threshold reached"
            );
        }
        Ok(quota)
    }

    /// Quota state of `scope` without charging anything.
    pub async fn quota(&self, plan: &str, scope: &str) -> Result<QuotaInfo> {
        let plan = self.plans.get(plan);
        if !self.tracks_quota(plan) {
            return Ok(QuotaInfo::unlimited());
        }
        self.quotas.info(plan, scope).await
    }

    /// Clear every window counter of `scope`, including the counters each
    /// route override keeps for it.
    pub async fn reset(&self, scope: &str) -> Result<bool> {
        let scopes: Vec<String> = std::iter::once(scope.to_string())
            .chain(self.endpoints.routes().map(|route| format!("{scope}:{route}")))
            .collect();

        let mut existed = false;
        for scope in &scopes {
            for window in Window::ALL {
                existed |= self
                    .limiter
                    .reset(&*self.storage, &window_key(scope, window), window.duration())
                    .await?;
            }
        }
        info!(scope = %scope, existed, "Rate limits reset");
        Ok(existed)
    }

    /// Clear the quota usage of `scope`.
    pub async fn reset_quota(&self, scope: &str) -> Result<bool> {
        let existed = self.quotas.reset(scope).await?;
        info!(scope = %scope, existed, "Quota reset");
        Ok(existed)
    }

    /// Grant `amount` extra requests to `scope` this month. Returns the new
    /// monthly usage.
    pub async fn grant_quota(&self, scope: &str, amount: u64) -> Result<u64> {
        let used = self.quotas.add_quota(scope, amount).await?;
        info!(scope = %scope, amount, used, "Quota granted");
        Ok(used)
    }

    /// Purge quota and analytics records older than `older_than_days`,
    /// along with expired counters.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        self.cleanup_with(&Retention::days(older_than_days)).await
    }

    /// Purge whatever the configured retention no longer covers.
    pub async fn cleanup_stale(&self) -> Result<u64> {
        self.cleanup_with(&self.retention).await
    }

    async fn cleanup_with(&self, retention: &Retention) -> Result<u64> {
        let deleted = self.storage.cleanup(retention).await?;
        info!(deleted, ?retention, "Storage cleanup finished");
        Ok(deleted)
    }

    /// Analytics rollups for the last `limit` periods.
    pub async fn analytics(
        &self,
        period: AnalyticsPeriod,
        limit: usize,
    ) -> Result<Vec<AnalyticsRecord>> {
        self.storage.get_analytics(period, limit).await
    }

    async fn evaluate_plan(
        &self,
        plan: &Plan,
        scope: &str,
        endpoint: Option<&str>,
    ) -> Result<RateLimits> {
        let mut limits = RateLimits::new(plan.name.clone());
        if !self.enabled {
            return Ok(limits);
        }

        let limiter = self.limiter.for_plan(plan);
        let now = self.clock.now_secs();

        for (window, limit) in plan.limited_windows() {
            let key = window_key(scope, window);
            let decision = limiter
                .attempt(&*self.storage, &key, limit, window.duration())
                .await?;
            let info = decision.info();

            limits.windows.insert(
                window,
                WindowStatus {
                    limit: info.limit,
                    remaining: info.remaining,
                    reset_at: info.reset_at,
                },
            );

            if decision.is_denied() && !limits.is_limited {
                limits.is_limited = true;
                limits.limited_by = Some(window);
                limits.retry_after = Some(info.reset_after(now));
            }
        }

        if limits.is_limited {
            debug!(
                scope = %scope,
                plan = %plan.name,
                limited_by = ?limits.limited_by,
                retry_after = ?limits.retry_after,
                "Rate limit exceeded"
            );
        } else if let Some(level) = self.rate_alert(&limits) {
            debug!(scope = %scope, plan = %plan.name, ?level, "Rate limit approaching");
        }

        if self.analytics_enabled {
            let endpoint = endpoint.unwrap_or_default();
            if let Err(e) = self
                .storage
                .record_analytics(scope, &plan.name, endpoint, limits.is_limited)
                .await
            {
                warn!(scope = %scope, error = %e, "Failed to record analytics");
            }
        }

        Ok(limits)
    }

    fn or_fallback(&self, plan: &str, scope: &str, result: Result<RateLimits>) -> Result<RateLimits> {
        match result {
            Err(e) if e.is_storage_unavailable() => {
                warn!(
                    scope = %scope,
                    policy = ?self.failure_policy,
                    error = %e,
                    "Storage unavailable, applying failure policy"
                );
                Ok(self.degraded(plan))
            }
            other => other,
        }
    }

    fn degraded(&self, plan: &str) -> RateLimits {
        let mut limits = RateLimits::new(self.plans.get(plan).name.clone());
        limits.degraded = true;
        if self.failure_policy == FailurePolicy::Closed {
            limits.is_limited = true;
            limits.retry_after = Some(DEGRADED_RETRY_SECS);
        }
        limits
    }

    fn tracks_quota(&self, plan: &Plan) -> bool {
        self.enabled && self.quotas_enabled && plan.has_quota()
    }
}

/// Storage key of one window counter.
fn window_key(scope: &str, window: Window) -> String {
    format!("{scope}:{}", window.label())
}

/// Builder for [`ThrottleEngine`].
#[derive(Clone)]
pub struct ThrottleEngineBuilder {
    limiter: LimiterConfig,
    plans: PlanTable,
    endpoints: EndpointOverrides,
    bypass: BypassList,
    key_resolver: KeyResolverConfig,
    quotas_enabled: bool,
    analytics_enabled: bool,
    alerts: Option<AlertThresholds>,
    retention: Retention,
    failure_policy: FailurePolicy,
    enabled: bool,
    clock: SharedClock,
}

impl std::fmt::Debug for ThrottleEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleEngineBuilder")
            .field("limiter", &self.limiter)
            .field("plans", &self.plans)
            .finish_non_exhaustive()
    }
}

impl Default for ThrottleEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleEngineBuilder {
    /// Create a builder with a fixed window strategy, an unlimited `free`
    /// plan and no overrides.
    pub fn new() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            plans: PlanTable::new("free"),
            endpoints: EndpointOverrides::new(),
            bypass: BypassList::empty(),
            key_resolver: KeyResolverConfig::default(),
            quotas_enabled: true,
            analytics_enabled: false,
            alerts: None,
            retention: Retention::default(),
            failure_policy: FailurePolicy::default(),
            enabled: true,
            clock: system_clock(),
        }
    }

    /// Start from a configuration.
    pub fn from_config(config: &ThrottleConfig) -> Result<Self> {
        Ok(Self {
            limiter: config.limiter.clone(),
            plans: config.plan_table()?,
            endpoints: config.endpoint_overrides()?,
            bypass: config.bypass.clone(),
            key_resolver: config.key_resolver.clone(),
            quotas_enabled: config.quotas.enabled,
            analytics_enabled: config.analytics.enabled,
            alerts: config.alert_thresholds(),
            retention: config.retention(),
            failure_policy: config.failure_policy,
            enabled: config.enabled,
            clock: system_clock(),
        })
    }

    /// Set the strategy configuration.
    pub fn limiter(mut self, config: LimiterConfig) -> Self {
        self.limiter = config;
        self
    }

    /// Select a strategy by name.
    pub fn algorithm(mut self, name: impl Into<String>) -> Self {
        self.limiter.algorithm = Some(name.into());
        self
    }

    /// Set the plan table.
    pub fn plans(mut self, plans: PlanTable) -> Self {
        self.plans = plans;
        self
    }

    /// Add or replace one plan.
    pub fn plan(mut self, plan: Plan) -> Self {
        self.plans.insert(plan);
        self
    }

    /// Set the route overrides.
    pub fn endpoints(mut self, endpoints: EndpointOverrides) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Set the callers that are never throttled.
    pub fn bypass(mut self, bypass: BypassList) -> Self {
        self.bypass = bypass;
        self
    }

    /// Set how request scope keys are derived.
    pub fn key_resolver(mut self, config: KeyResolverConfig) -> Self {
        self.key_resolver = config;
        self
    }

    /// Enable or disable quota tracking.
    pub fn quotas(mut self, enabled: bool) -> Self {
        self.quotas_enabled = enabled;
        self
    }

    /// Enable or disable analytics recording.
    pub fn analytics(mut self, enabled: bool) -> Self {
        self.analytics_enabled = enabled;
        self
    }

    /// Report alerts at `thresholds`.
    pub fn alerts(mut self, thresholds: AlertThresholds) -> Self {
        self.alerts = Some(thresholds);
        self
    }

    /// Set how long [`ThrottleEngine::cleanup_stale`] keeps stale records.
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Set the behaviour during storage outages.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Turn throttling on or off.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Read time from `clock`.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the engine over `storage`.
    pub fn build<S: Storage>(self, storage: S) -> Result<ThrottleEngine<S>> {
        self.build_shared(Arc::new(storage))
    }

    /// Build the engine over shared `storage`.
    ///
    /// Fails when the strategy configuration is invalid.
    pub fn build_shared<S: Storage>(self, storage: Arc<S>) -> Result<ThrottleEngine<S>> {
        let limiter = LimiterFactory::new(self.limiter)
            .with_clock(self.clock.clone())
            .build()?;

        info!(
            algorithm = limiter.name(),
            plans = self.plans.names().len(),
            default_plan = %self.plans.default_plan(),
            failure_policy = ?self.failure_policy,
            "Throttle engine ready"
        );

        Ok(ThrottleEngine {
            quotas: QuotaTracker::new(Arc::clone(&storage)).with_clock(self.clock.clone()),
            storage,
            limiter,
            plans: self.plans,
            endpoints: self.endpoints,
            bypass: self.bypass,
            scopes: ScopeResolver::new(self.key_resolver),
            quotas_enabled: self.quotas_enabled,
            analytics_enabled: self.analytics_enabled,
            alerts: self.alerts,
            retention: self.retention,
            failure_policy: self.failure_policy,
            enabled: self.enabled,
            clock: self.clock,
        })
    }
}

impl ThrottleEngine<crate::storage::AnyStorage> {
    /// Connect the configured storage backend and build the engine.
    pub async fn connect(config: &ThrottleConfig) -> Result<Self> {
        config.validate()?;
        let storage = config.storage.connect(config.retention()).await?;
        Self::from_config(config, storage)
    }
}
