//! Pre-built key extractors for common patterns.
//!
//! These extractors are generic and can work with any request type
//! that provides the necessary data through traits.

use std::net::IpAddr;

use crate::key::Key;

// ============================================================================
// Request Info Traits
// ============================================================================

/// Trait for requests that have an IP address.
pub trait HasIpAddr {
    /// Get the client IP address.
    fn client_ip(&self) -> Option<IpAddr>;
}

/// Trait for requests that have headers.
pub trait HasHeaders {
    /// Get a header value by name (lowercase).
    fn header(&self, name: &str) -> Option<&str>;
}

/// Trait for requests that may carry an authenticated user.
pub trait HasUser {
    /// Identifier of the authenticated user.
    fn user_id(&self) -> Option<String>;

    /// Plan name attached to the user, if the request knows it.
    fn user_plan(&self) -> Option<String> {
        None
    }
}

/// Trait for requests that have a method and a path.
pub trait HasRoute {
    /// Request method (GET, POST, etc).
    fn method(&self) -> &str;

    /// Request path.
    fn path(&self) -> &str;
}

/// Everything the default resolvers read from a request.
pub trait RequestInfo: HasIpAddr + HasHeaders + HasUser + HasRoute {}

impl<T: HasIpAddr + HasHeaders + HasUser + HasRoute> RequestInfo for T {}

// ============================================================================
// Identity Extractors
// ============================================================================

/// Extract key from the authenticated user.
#[derive(Debug, Clone, Default)]
pub struct UserKey;

impl UserKey {
    /// Create a new user key extractor.
    pub fn new() -> Self {
        Self
    }
}

impl<R: HasUser> Key<R> for UserKey {
    fn extract(&self, request: &R) -> Option<String> {
        request.user_id().map(|id| format!("user:{id}"))
    }

    fn name(&self) -> &'static str {
        "user"
    }
}

/// Extract key from client IP address.
#[derive(Debug, Clone, Default)]
pub struct IpKey {
    /// Header to check for real IP (e.g., X-Forwarded-For).
    real_ip_header: Option<&'static str>,
}

impl IpKey {
    /// Create a new IP key extractor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use X-Forwarded-For header to get real IP behind proxy.
    pub fn with_forwarded_for() -> Self {
        Self::with_header("x-forwarded-for")
    }

    /// Use a custom header for real IP.
    pub fn with_header(header: &'static str) -> Self {
        Self {
            real_ip_header: Some(header),
        }
    }

    /// The client address as text, honoring the proxy header.
    pub fn address<R: HasIpAddr + HasHeaders>(&self, request: &R) -> Option<String> {
        if let Some(value) = self.real_ip_header.and_then(|h| request.header(h)) {
            // X-Forwarded-For might have multiple IPs, take the first
            let ip = value.split(',').next().unwrap_or_default().trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }

        request.client_ip().map(|ip| ip.to_string())
    }
}

impl<R> Key<R> for IpKey
where
    R: HasIpAddr + HasHeaders,
{
    fn extract(&self, request: &R) -> Option<String> {
        self.address(request).map(|ip| format!("ip:{ip}"))
    }

    fn name(&self) -> &'static str {
        "ip"
    }
}

/// Extract key from the API key header.
///
/// Reads `x-api-key`, then `authorization`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyKey;

impl ApiKeyKey {
    /// Create a new API key extractor.
    pub fn new() -> Self {
        Self
    }

    /// The raw API key carried by `request`.
    pub fn value<'r, R: HasHeaders>(&self, request: &'r R) -> Option<&'r str> {
        request
            .header("x-api-key")
            .or_else(|| request.header("authorization"))
            .filter(|value| !value.is_empty())
    }
}

impl<R: HasHeaders> Key<R> for ApiKeyKey {
    fn extract(&self, request: &R) -> Option<String> {
        self.value(request).map(|value| format!("api_key:{value}"))
    }

    fn name(&self) -> &'static str {
        "api_key"
    }
}

// ============================================================================
// Route-based Extractors
// ============================================================================

/// Extract key from the request method and path.
#[derive(Debug, Clone, Default)]
pub struct RouteKey;

impl RouteKey {
    /// Create a new route key extractor.
    pub fn new() -> Self {
        Self
    }
}

impl<R: HasRoute> Key<R> for RouteKey {
    fn extract(&self, request: &R) -> Option<String> {
        Some(format!(
            "route:{}:{}",
            request.method().to_ascii_uppercase(),
            request.path()
        ))
    }

    fn name(&self) -> &'static str {
        "route"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub(crate) struct MockRequest {
        pub ip: Option<IpAddr>,
        pub headers: HashMap<String, String>,
        pub user: Option<String>,
        pub plan: Option<String>,
        pub method: String,
        pub path: String,
    }

    impl Default for MockRequest {
        fn default() -> Self {
            Self {
                ip: None,
                headers: HashMap::new(),
                user: None,
                plan: None,
                method: "GET".into(),
                path: "/".into(),
            }
        }
    }

    impl HasIpAddr for MockRequest {
        fn client_ip(&self) -> Option<IpAddr> {
            self.ip
        }
    }

    impl HasHeaders for MockRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(name).map(|s| s.as_str())
        }
    }

    impl HasUser for MockRequest {
        fn user_id(&self) -> Option<String> {
            self.user.clone()
        }

        fn user_plan(&self) -> Option<String> {
            self.plan.clone()
        }
    }

    impl HasRoute for MockRequest {
        fn method(&self) -> &str {
            &self.method
        }

        fn path(&self) -> &str {
            &self.path
        }
    }

    #[test]
    fn test_ip_key() {
        let key = IpKey::new();
        let mut req = MockRequest::default();
        req.ip = Some("192.168.1.1".parse().unwrap());

        assert_eq!(key.extract(&req), Some("ip:192.168.1.1".to_string()));
    }

    #[test]
    fn test_ip_key_with_forwarded_for() {
        let key = IpKey::with_forwarded_for();
        let mut req = MockRequest::default();
        req.ip = Some("10.0.0.1".parse().unwrap());
        req.headers
            .insert("x-forwarded-for".into(), "203.0.113.50, 70.41.3.18".into());

        assert_eq!(key.extract(&req), Some("ip:203.0.113.50".to_string()));
    }

    #[test]
    fn test_user_key() {
        let mut req = MockRequest::default();
        assert_eq!(UserKey::new().extract(&req), None);

        req.user = Some("42".into());
        assert_eq!(UserKey::new().extract(&req), Some("user:42".to_string()));
    }

    #[test]
    fn test_api_key_prefers_dedicated_header() {
        let key = ApiKeyKey::new();
        let mut req = MockRequest::default();
        req.headers.insert("authorization".into(), "Bearer abc".into());
        assert_eq!(key.extract(&req), Some("api_key:Bearer abc".to_string()));

        req.headers.insert("x-api-key".into(), "secret-key".into());
        assert_eq!(key.extract(&req), Some("api_key:secret-key".to_string()));
    }

    #[test]
    fn test_route_key() {
        let mut req = MockRequest::default();
        req.method = "post".into();
        req.path = "/api/v1/login".into();

        assert_eq!(
            RouteKey::new().extract(&req),
            Some("route:POST:/api/v1/login".to_string())
        );
    }
}
