//! Per-route limit overrides.
//!
//! Routes are written as `"METHOD /path"`. The method may be `*` or left out
//! to match any method. Paths support glob segments:
//!
//! - `*` matches exactly one segment
//! - `**` matches the rest of the path
//!
//! Exact routes are looked up first, then patterns in the order given.

use std::collections::{BTreeMap, HashMap};

use crate::error::ConfigError;
use crate::plan::EndpointOverride;

/// A route rule that matched a request.
#[derive(Debug, Clone, Copy)]
pub struct EndpointMatch<'a> {
    /// The rule as configured, e.g. `POST /api/*/login`.
    pub route: &'a str,
    /// Limits for the rule.
    pub config: &'a EndpointOverride,
}

#[derive(Debug, Clone)]
struct Rule {
    route: String,
    method: Option<String>,
    path: String,
    config: EndpointOverride,
}

impl Rule {
    fn parse(route: &str, config: EndpointOverride) -> Result<Self, ConfigError> {
        let route = route.trim();
        let (method, path) = match route.split_once(char::is_whitespace) {
            Some((method, path)) => (method, path.trim()),
            None => ("*", route),
        };

        if !path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "endpoint '{route}' must have a path starting with '/'"
            )));
        }

        let method = (method != "*").then(|| method.to_ascii_uppercase());
        Ok(Self {
            route: route.to_string(),
            method,
            path: path.to_string(),
            config,
        })
    }

    fn method_matches(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(method))
    }

    fn as_match(&self) -> EndpointMatch<'_> {
        EndpointMatch {
            route: &self.route,
            config: &self.config,
        }
    }
}

/// Route rules with glob matching.
#[derive(Debug, Clone, Default)]
pub struct EndpointOverrides {
    exact: HashMap<String, Vec<Rule>>,
    patterns: Vec<Rule>,
}

impl EndpointOverrides {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every `"METHOD /path"` rule in `routes`.
    pub fn from_map(routes: &BTreeMap<String, EndpointOverride>) -> Result<Self, ConfigError> {
        routes
            .iter()
            .try_fold(Self::new(), |overrides, (route, config)| {
                overrides.route(route, config.clone())
            })
    }

    /// Add a rule.
    pub fn route(mut self, route: &str, config: EndpointOverride) -> Result<Self, ConfigError> {
        let rule = Rule::parse(route, config)?;
        if rule.path.split('/').any(|s| s == "*" || s == "**") {
            self.patterns.push(rule);
        } else {
            self.exact.entry(rule.path.clone()).or_default().push(rule);
        }
        Ok(self)
    }

    /// The rule for `method` and `path`, if any.
    pub fn find(&self, method: &str, path: &str) -> Option<EndpointMatch<'_>> {
        if let Some(rules) = self.exact.get(path) {
            if let Some(rule) = rules.iter().find(|r| r.method_matches(method)) {
                return Some(rule.as_match());
            }
        }

        self.patterns
            .iter()
            .find(|r| r.method_matches(method) && pattern_matches(&r.path, path))
            .map(Rule::as_match)
    }

    /// The route of every rule, as written when it was added.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.exact
            .values()
            .flatten()
            .chain(&self.patterns)
            .map(|rule| rule.route.as_str())
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.patterns.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Simple glob pattern matching for paths.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut pi = 0;
    let mut pa = 0;

    while pi < pattern_parts.len() && pa < path_parts.len() {
        match pattern_parts[pi] {
            "**" => return true,
            "*" => {}
            segment if segment == path_parts[pa] => {}
            _ => return false,
        }
        pi += 1;
        pa += 1;
    }

    // A trailing ** also matches an empty remainder.
    let rest = &pattern_parts[pi..];
    pa == path_parts.len() && (rest.is_empty() || rest == ["**"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Window;

    fn login() -> EndpointOverride {
        EndpointOverride::new().with_limit(Window::Minute, 5)
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("/api/*/login", "/api/v1/login"));
        assert!(!pattern_matches("/api/*/login", "/api/v1/v2/login"));
        assert!(pattern_matches("/api/**", "/api/users/123/posts"));
        assert!(pattern_matches("/api/**", "/api"));
        assert!(!pattern_matches("/api/users", "/api/users/1"));
    }

    #[test]
    fn test_find_by_method_and_pattern() {
        let overrides = EndpointOverrides::new()
            .route("POST /api/*/login", login())
            .unwrap();

        let found = overrides.find("post", "/api/v1/login").unwrap();
        assert_eq!(found.route, "POST /api/*/login");
        assert_eq!(found.config.limit(Window::Minute), Some(5));

        assert!(overrides.find("GET", "/api/v1/login").is_none());
        assert!(overrides.find("POST", "/api/v1/logout").is_none());
    }

    #[test]
    fn test_exact_wins_over_pattern() {
        let overrides = EndpointOverrides::new()
            .route("/api/**", EndpointOverride::new().with_limit(Window::Minute, 100))
            .unwrap()
            .route("GET /api/search", EndpointOverride::new().with_limit(Window::Minute, 30))
            .unwrap();

        assert_eq!(overrides.len(), 2);
        let found = overrides.find("GET", "/api/search").unwrap();
        assert_eq!(found.config.limit(Window::Minute), Some(30));

        let found = overrides.find("POST", "/api/search").unwrap();
        assert_eq!(found.config.limit(Window::Minute), Some(100));
    }

    #[test]
    fn test_invalid_route() {
        assert!(EndpointOverrides::new().route("POST api/login", login()).is_err());
    }
}
