//! Request identity: scope keys, plan resolution, bypass and route overrides.
//!
//! The engine itself only sees a `(plan, scope)` pair. This module holds the
//! pluggable pieces that turn a request into that pair.
//!
//! # Example
//!
//! ```ignore
//! use smart_throttle::key::{KeyResolverConfig, Resolver, ScopeResolver, UserPlanResolver};
//!
//! let resolver = Resolver::new(
//!     UserPlanResolver,
//!     ScopeResolver::new(KeyResolverConfig::default()),
//!     "free",
//! );
//! let (plan, scope) = resolver.resolve(&request)?;
//! ```

mod extractors;
mod resolver;
mod routes;

pub use extractors::*;
pub use resolver::{
    BypassList, FnPlanResolver, KeyResolverConfig, PlanResolver, Resolver, Scope, ScopeResolver,
    UserPlanResolver,
};
pub use routes::{EndpointMatch, EndpointOverrides};

/// Trait for extracting rate limiting keys from requests.
///
/// Return `None` if the key cannot be extracted (e.g., no authenticated
/// user), so a fallback extractor can be tried.
///
/// # Type Parameters
///
/// - `R`: The request type
pub trait Key<R>: Send + Sync + 'static {
    /// Extract a rate limiting key from the request.
    fn extract(&self, request: &R) -> Option<String>;

    /// Get the key name for logging.
    fn name(&self) -> &'static str;
}

/// A key built by a closure.
#[derive(Clone)]
pub struct FnKey<F> {
    extractor: F,
    name: &'static str,
}

impl<F> std::fmt::Debug for FnKey<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnKey").field("name", &self.name).finish()
    }
}

impl<F> FnKey<F> {
    /// Create a new function-based key extractor.
    pub fn new(name: &'static str, extractor: F) -> Self {
        Self { extractor, name }
    }
}

impl<R, F> Key<R> for FnKey<F>
where
    F: Fn(&R) -> Option<String> + Send + Sync + 'static,
{
    fn extract(&self, request: &R) -> Option<String> {
        (self.extractor)(request)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A key that always returns the same value.
///
/// Every request then shares one set of counters.
#[derive(Debug, Clone)]
pub struct StaticKey {
    key: String,
}

impl StaticKey {
    /// Create a new static key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl<R> Key<R> for StaticKey {
    fn extract(&self, _request: &R) -> Option<String> {
        Some(self.key.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
