//! Integration tests for key extractors and route overrides.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use smart_throttle::key::{
    ApiKeyKey, FnKey, HasHeaders, HasIpAddr, HasRoute, HasUser, IpKey, Key, RouteKey, StaticKey,
    UserKey,
};
use smart_throttle::{EndpointOverride, EndpointOverrides, Scope, Window};

#[derive(Default)]
struct Request {
    ip: Option<IpAddr>,
    headers: HashMap<String, String>,
    user: Option<String>,
}

impl HasIpAddr for Request {
    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

impl HasHeaders for Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl HasUser for Request {
    fn user_id(&self) -> Option<String> {
        self.user.clone()
    }
}

impl HasRoute for Request {
    fn method(&self) -> &str {
        "delete"
    }

    fn path(&self) -> &str {
        "/api/items/9"
    }
}

fn request() -> Request {
    Request {
        ip: Some("192.168.1.20".parse().unwrap()),
        headers: HashMap::from([
            ("x-forwarded-for".to_string(), "203.0.113.7, 10.0.0.1".to_string()),
            ("authorization".to_string(), "Bearer abc".to_string()),
        ]),
        user: Some("99".to_string()),
    }
}

#[test]
fn test_identity_extractors() {
    let req = request();

    assert_eq!(UserKey::new().extract(&req), Some("user:99".to_string()));
    assert_eq!(IpKey::new().extract(&req), Some("ip:192.168.1.20".to_string()));
    assert_eq!(
        IpKey::with_forwarded_for().extract(&req),
        Some("ip:203.0.113.7".to_string())
    );
    assert_eq!(
        ApiKeyKey::new().extract(&req),
        Some("api_key:Bearer abc".to_string())
    );
    assert_eq!(
        RouteKey::new().extract(&req),
        Some("route:DELETE:/api/items/9".to_string())
    );
}

#[test]
fn test_custom_keys() {
    let tenant = FnKey::new("tenant", |req: &Request| {
        req.headers.get("x-tenant").map(|t| format!("tenant:{t}"))
    });
    assert_eq!(tenant.extract(&request()), None);
    assert_eq!(Key::<Request>::name(&tenant), "tenant");

    let shared = StaticKey::new("global");
    assert_eq!(shared.extract(&request()), Some("global".to_string()));
}

#[test]
fn test_scope_extraction() {
    let req = request();
    assert_eq!(Scope::User.extract(&req), Some("user:99".to_string()));
    assert_eq!(Scope::Ip.extract(&req), Some("ip:192.168.1.20".to_string()));

    let anonymous = Request::default();
    assert_eq!(Scope::User.extract(&anonymous), None);
    assert_eq!(Scope::ApiKey.extract(&anonymous), None);
}

#[test]
fn test_route_precedence() {
    let routes = BTreeMap::from([
        (
            "/api/items/**".to_string(),
            EndpointOverride::new().with_limit(Window::Minute, 100),
        ),
        (
            "DELETE /api/items/*".to_string(),
            EndpointOverride::new().with_limit(Window::Minute, 10),
        ),
        (
            "DELETE /api/items/9".to_string(),
            EndpointOverride::new().with_limit(Window::Minute, 1),
        ),
    ]);
    let overrides = EndpointOverrides::from_map(&routes).unwrap();

    let exact = overrides.find("DELETE", "/api/items/9").unwrap();
    assert_eq!(exact.route, "DELETE /api/items/9");
    assert_eq!(exact.config.limit(Window::Minute), Some(1));

    let any_method = overrides.find("GET", "/api/items/9/history").unwrap();
    assert_eq!(any_method.route, "/api/items/**");

    assert!(overrides.find("GET", "/api/users").is_none());
}
