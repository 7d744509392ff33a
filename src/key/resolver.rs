//! Turning a request into a `(plan, scope)` pair.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};
use crate::key::{ApiKeyKey, HasUser, IpKey, Key, RequestInfo, UserKey};

/// Identity a set of counters is scoped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The authenticated user.
    User,
    /// The client address.
    Ip,
    /// The API key header.
    ApiKey,
}

impl Scope {
    /// The scope key for `request`, `None` when the identity is missing.
    pub fn extract<R: RequestInfo>(self, request: &R) -> Option<String> {
        match self {
            Self::User => UserKey::new().extract(request),
            Self::Ip => IpKey::new().extract(request),
            Self::ApiKey => ApiKeyKey::new().extract(request),
        }
    }
}

/// How scope keys are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyResolverConfig {
    /// Identity tried first.
    pub primary: Scope,
    /// Identity used when the primary one is missing.
    pub fallback: Option<Scope>,
    /// Append the request method and path to the key.
    pub include_route: bool,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            primary: Scope::User,
            fallback: Some(Scope::Ip),
            include_route: true,
        }
    }
}

/// Derives the scope key of a request.
///
/// The primary identity wins; the fallback is used only when the primary one
/// cannot be extracted. With `include_route` the key becomes
/// `<identity>:<METHOD>:<path>` so each route gets its own counters.
#[derive(Debug, Clone, Default)]
pub struct ScopeResolver {
    config: KeyResolverConfig,
}

impl ScopeResolver {
    /// Create a resolver.
    pub fn new(config: KeyResolverConfig) -> Self {
        Self { config }
    }

    /// The resolver settings.
    pub fn config(&self) -> &KeyResolverConfig {
        &self.config
    }

    /// The scope key for `request`.
    pub fn resolve<R: RequestInfo>(&self, request: &R) -> Option<String> {
        self.resolve_as(None, request)
    }

    /// The scope key for `request`, with `scope` forced as the identity.
    pub fn resolve_as<R: RequestInfo>(&self, scope: Option<Scope>, request: &R) -> Option<String> {
        let identity = match scope {
            Some(scope) => scope.extract(request),
            None => self
                .config
                .primary
                .extract(request)
                .or_else(|| self.config.fallback.and_then(|s| s.extract(request))),
        }?;

        if self.config.include_route {
            Some(format!(
                "{identity}:{}:{}",
                request.method().to_ascii_uppercase(),
                request.path()
            ))
        } else {
            Some(identity)
        }
    }
}

impl<R: RequestInfo> Key<R> for ScopeResolver {
    fn extract(&self, request: &R) -> Option<String> {
        self.resolve(request)
    }

    fn name(&self) -> &'static str {
        "scope"
    }
}

/// Maps a request to a plan name.
///
/// Returning `None` selects the default plan.
pub trait PlanResolver<R>: Send + Sync + 'static {
    /// The plan for `request`.
    fn resolve_plan(&self, request: &R) -> Option<String>;
}

/// Reads the plan from the authenticated user.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserPlanResolver;

impl<R: HasUser> PlanResolver<R> for UserPlanResolver {
    fn resolve_plan(&self, request: &R) -> Option<String> {
        request.user_plan()
    }
}

/// A plan resolver built by a closure.
#[derive(Clone)]
pub struct FnPlanResolver<F> {
    resolver: F,
}

impl<F> std::fmt::Debug for FnPlanResolver<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPlanResolver").finish()
    }
}

impl<F> FnPlanResolver<F> {
    /// Create a resolver from a closure.
    pub fn new(resolver: F) -> Self {
        Self { resolver }
    }
}

impl<R, F> PlanResolver<R> for FnPlanResolver<F>
where
    F: Fn(&R) -> Option<String> + Send + Sync + 'static,
{
    fn resolve_plan(&self, request: &R) -> Option<String> {
        (self.resolver)(request)
    }
}

/// Plan and scope resolution combined.
#[derive(Debug, Clone)]
pub struct Resolver<P> {
    plans: P,
    scopes: ScopeResolver,
    default_plan: String,
}

impl<P> Resolver<P> {
    /// Create a resolver falling back to `default_plan`.
    pub fn new(plans: P, scopes: ScopeResolver, default_plan: impl Into<String>) -> Self {
        Self {
            plans,
            scopes,
            default_plan: default_plan.into(),
        }
    }

    /// The scope resolver.
    pub fn scopes(&self) -> &ScopeResolver {
        &self.scopes
    }

    /// The plan name for `request`, falling back to the default plan.
    pub fn plan<R>(&self, request: &R) -> String
    where
        P: PlanResolver<R>,
    {
        self.plans
            .resolve_plan(request)
            .unwrap_or_else(|| self.default_plan.clone())
    }

    /// Resolve `(plan_name, scope_key)` for `request`.
    ///
    /// Fails with [`RateLimitError::KeyExtraction`] when no identity can be
    /// read from the request.
    pub fn resolve<R>(&self, request: &R) -> Result<(String, String)>
    where
        R: RequestInfo,
        P: PlanResolver<R>,
    {
        let plan = self.plan(request);
        let scope = self.scopes.resolve(request).ok_or_else(|| {
            RateLimitError::KeyExtraction("request carries no user, address or API key".into())
        })?;
        Ok((plan, scope))
    }
}

/// Callers that are never throttled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassList {
    /// Client addresses.
    pub ips: HashSet<String>,
    /// API keys, matched against `x-api-key` then `authorization`.
    pub api_keys: HashSet<String>,
    /// User identifiers.
    pub user_ids: HashSet<String>,
}

impl Default for BypassList {
    fn default() -> Self {
        Self {
            ips: HashSet::from(["127.0.0.1".to_string()]),
            api_keys: HashSet::new(),
            user_ids: HashSet::new(),
        }
    }
}

impl BypassList {
    /// A list that bypasses nobody.
    pub fn empty() -> Self {
        Self {
            ips: HashSet::new(),
            api_keys: HashSet::new(),
            user_ids: HashSet::new(),
        }
    }

    /// Whether `request` skips throttling.
    pub fn is_bypassed<R: RequestInfo>(&self, request: &R) -> bool {
        if let Some(ip) = request.client_ip() {
            if self.ips.contains(&ip.to_string()) {
                return true;
            }
        }

        if let Some(key) = ApiKeyKey::new().value(request) {
            if self.api_keys.contains(key) {
                return true;
            }
        }

        request
            .user_id()
            .is_some_and(|id| self.user_ids.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::extractors::tests::MockRequest;

    fn request(user: Option<&str>, ip: Option<&str>) -> MockRequest {
        MockRequest {
            user: user.map(String::from),
            ip: ip.map(|ip| ip.parse().unwrap()),
            method: "get".into(),
            path: "/api/items".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_user_takes_precedence_over_ip() {
        let resolver = ScopeResolver::new(KeyResolverConfig {
            include_route: false,
            ..Default::default()
        });

        assert_eq!(
            resolver.resolve(&request(Some("42"), Some("10.0.0.1"))),
            Some("user:42".to_string())
        );
        assert_eq!(
            resolver.resolve(&request(None, Some("10.0.0.1"))),
            Some("ip:10.0.0.1".to_string())
        );
        assert_eq!(resolver.resolve(&request(None, None)), None);
    }

    #[test]
    fn test_route_is_appended() {
        let resolver = ScopeResolver::default();
        assert_eq!(
            resolver.resolve(&request(Some("42"), None)),
            Some("user:42:GET:/api/items".to_string())
        );
    }

    #[test]
    fn test_forced_scope() {
        let resolver = ScopeResolver::new(KeyResolverConfig {
            include_route: false,
            ..Default::default()
        });
        assert_eq!(
            resolver.resolve_as(Some(Scope::Ip), &request(Some("42"), Some("10.0.0.1"))),
            Some("ip:10.0.0.1".to_string())
        );
    }

    #[test]
    fn test_resolver_defaults_plan() {
        let resolver = Resolver::new(UserPlanResolver, ScopeResolver::default(), "free");

        let mut req = request(Some("7"), None);
        assert_eq!(resolver.resolve(&req).unwrap().0, "free");

        req.plan = Some("pro".into());
        let (plan, scope) = resolver.resolve(&req).unwrap();
        assert_eq!(plan, "pro");
        assert_eq!(scope, "user:7:GET:/api/items");

        let err = resolver.resolve(&request(None, None)).unwrap_err();
        assert!(matches!(err, RateLimitError::KeyExtraction(_)));
    }

    #[test]
    fn test_fn_plan_resolver() {
        let resolver = FnPlanResolver::new(|req: &MockRequest| {
            req.path.starts_with("/internal").then(|| "internal".to_string())
        });
        let mut req = request(None, None);
        assert_eq!(resolver.resolve_plan(&req), None);
        req.path = "/internal/health".into();
        assert_eq!(resolver.resolve_plan(&req), Some("internal".to_string()));
    }

    #[test]
    fn test_bypass_list() {
        let bypass = BypassList {
            api_keys: HashSet::from(["ops-key".to_string()]),
            user_ids: HashSet::from(["1".to_string()]),
            ..Default::default()
        };

        assert!(bypass.is_bypassed(&request(None, Some("127.0.0.1"))));
        assert!(bypass.is_bypassed(&request(Some("1"), Some("10.0.0.1"))));
        assert!(!bypass.is_bypassed(&request(Some("2"), Some("10.0.0.1"))));

        let mut req = request(None, Some("10.0.0.1"));
        req.headers.insert("x-api-key".into(), "ops-key".into());
        assert!(bypass.is_bypassed(&req));

        assert!(!BypassList::empty().is_bypassed(&request(None, Some("127.0.0.1"))));
    }
}
