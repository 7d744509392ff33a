//! Integration tests for the throttle engine.

use std::sync::Arc;
use std::time::Duration;

use smart_throttle::algorithm::TokenBucketConfig;
use smart_throttle::storage::{AnalyticsPeriod, MemoryStorage};
use smart_throttle::{
    Algorithm, EndpointOverride, EndpointOverrides, ManualClock, Plan, PlanTable, Scope,
    ThrottleEngine, Window,
};

const NOW: u64 = 1_707_998_400;

fn engine_with(plans: PlanTable) -> (ThrottleEngine<MemoryStorage>, ManualClock) {
    let clock = ManualClock::at_secs(NOW);
    let engine = ThrottleEngine::builder()
        .plans(plans)
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock.clone()))
        .unwrap();
    (engine, clock)
}

fn per_minute(limit: u64) -> PlanTable {
    PlanTable::new("free").with_plan(Plan::new("free").with_limit(Window::Minute, limit))
}

#[tokio::test]
async fn test_minute_limit_counts_down_then_limits() {
    let (engine, _clock) = engine_with(per_minute(60));

    for expected in (0..60).rev() {
        let limits = engine.evaluate("free", "user:1").await.unwrap();
        assert!(limits.is_allowed());
        assert_eq!(limits.window(Window::Minute).unwrap().remaining, expected);
    }

    let limits = engine.evaluate("free", "user:1").await.unwrap();
    assert!(limits.is_limited);
    assert_eq!(limits.limited_by, Some(Window::Minute));
    assert_eq!(limits.window(Window::Minute).unwrap().remaining, 0);
    assert_eq!(limits.retry_after, Some(60));

    let headers = limits.to_headers().to_vec();
    assert!(headers.contains(&("Retry-After", "60".to_string())));
    assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
}

#[tokio::test]
async fn test_window_resets_after_it_expires() {
    let (engine, clock) = engine_with(per_minute(2));

    engine.evaluate("free", "user:1").await.unwrap();
    engine.evaluate("free", "user:1").await.unwrap();
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_limited);

    clock.advance(Duration::from_secs(61));
    let limits = engine.evaluate("free", "user:1").await.unwrap();
    assert!(limits.is_allowed());
    assert_eq!(limits.window(Window::Minute).unwrap().remaining, 1);
}

#[tokio::test]
async fn test_scopes_are_independent() {
    let (engine, _clock) = engine_with(per_minute(1));

    assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_limited);
    assert!(engine.evaluate("free", "user:2").await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_unknown_plan_uses_default() {
    let (engine, _clock) = engine_with(per_minute(1));

    let limits = engine.evaluate("platinum", "user:1").await.unwrap();
    assert_eq!(limits.plan, "free");
    assert_eq!(limits.window(Window::Minute).unwrap().limit, 1);
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let clock = ManualClock::at_secs(NOW);
    let plans = PlanTable::new("free").with_plan(
        Plan::new("free")
            .with_limit(Window::Minute, 60)
            .with_burst(10, 1.0),
    );
    let engine = ThrottleEngine::builder()
        .algorithm("token_bucket")
        .plans(plans)
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock.clone()))
        .unwrap();

    for _ in 0..10 {
        assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    }
    let limits = engine.evaluate("free", "user:1").await.unwrap();
    assert!(limits.is_limited);
    assert_eq!(limits.window(Window::Minute).unwrap().limit, 10);
    assert_eq!(limits.retry_after, Some(1));

    clock.advance(Duration::from_secs(1));
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_limited);
}

#[tokio::test]
async fn test_token_bucket_config_shapes_unconfigured_plans() {
    let clock = ManualClock::at_secs(NOW);
    let mut limiter = smart_throttle::LimiterConfig::default();
    limiter.token_bucket.enabled = true;
    limiter.token_bucket.bucket = TokenBucketConfig::default()
        .with_burst_size(3)
        .with_refill_rate(1.0);

    let engine = ThrottleEngine::builder()
        .limiter(limiter)
        .plans(per_minute(60))
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock))
        .unwrap();

    assert_eq!(engine.limiter().name(), "token_bucket");
    for _ in 0..3 {
        assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    }
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_limited);
}

#[tokio::test]
async fn test_sliding_window_selected_by_name() {
    let clock = ManualClock::at_secs(NOW);
    let engine = ThrottleEngine::builder()
        .algorithm("sliding_window")
        .plans(per_minute(3))
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock))
        .unwrap();

    for _ in 0..3 {
        assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    }
    let limits = engine.evaluate("free", "user:1").await.unwrap();
    assert!(limits.is_limited);
    assert_eq!(limits.limited_by, Some(Window::Minute));
}

#[tokio::test]
async fn test_would_limit_and_remaining_do_not_count() {
    let (engine, _clock) = engine_with(per_minute(2));

    assert!(!engine.would_limit("free", "user:1").await.unwrap());
    assert_eq!(
        engine.remaining("free", "user:1", Window::Minute).await.unwrap(),
        Some(2)
    );
    assert_eq!(
        engine.remaining("free", "user:1", Window::Hour).await.unwrap(),
        None
    );

    engine.evaluate("free", "user:1").await.unwrap();
    engine.evaluate("free", "user:1").await.unwrap();
    assert!(engine.would_limit("free", "user:1").await.unwrap());
    assert_eq!(
        engine.remaining("free", "user:1", Window::Minute).await.unwrap(),
        Some(0)
    );
}

#[tokio::test]
async fn test_reset_clears_counters() {
    let (engine, _clock) = engine_with(per_minute(1));

    engine.evaluate("free", "user:1").await.unwrap();
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_limited);

    assert!(engine.reset("user:1").await.unwrap());
    assert!(engine.evaluate("free", "user:1").await.unwrap().is_allowed());
    assert!(!engine.reset("user:unknown").await.unwrap());
}

#[tokio::test]
async fn test_endpoint_override_uses_own_counters() {
    let clock = ManualClock::at_secs(NOW);
    let endpoints = EndpointOverrides::new()
        .route(
            "POST /api/*/login",
            EndpointOverride::new()
                .with_limit(Window::Minute, 2)
                .with_scope(Scope::Ip)
                .with_cost(3),
        )
        .unwrap();
    let engine = ThrottleEngine::builder()
        .plans(per_minute(100))
        .endpoints(endpoints)
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock))
        .unwrap();

    for _ in 0..2 {
        let limits = engine
            .evaluate_endpoint("free", "ip:10.0.0.1", "post", "/api/v1/login")
            .await
            .unwrap();
        assert!(limits.is_allowed());
    }
    let limits = engine
        .evaluate_endpoint("free", "ip:10.0.0.1", "POST", "/api/v1/login")
        .await
        .unwrap();
    assert!(limits.is_limited);
    assert_eq!(limits.window(Window::Minute).unwrap().limit, 2);
    assert_eq!(engine.request_cost("POST", "/api/v2/login"), 3);
    assert_eq!(engine.request_cost("GET", "/api/v1/items"), 1);

    // Other routes keep the plan limit and their own counter.
    let limits = engine
        .evaluate_endpoint("free", "ip:10.0.0.1", "GET", "/api/v1/items")
        .await
        .unwrap();
    assert!(limits.is_allowed());
    assert_eq!(limits.window(Window::Minute).unwrap().remaining, 99);
}

#[tokio::test]
async fn test_reset_clears_route_counters() {
    let clock = ManualClock::at_secs(NOW);
    let endpoints = EndpointOverrides::new()
        .route("POST /login", EndpointOverride::new().with_limit(Window::Minute, 1))
        .unwrap();
    let engine = ThrottleEngine::builder()
        .plans(per_minute(100))
        .endpoints(endpoints)
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock))
        .unwrap();

    let scope = "ip:10.0.0.1";
    engine.evaluate_endpoint("free", scope, "POST", "/login").await.unwrap();
    let limits = engine.evaluate_endpoint("free", scope, "POST", "/login").await.unwrap();
    assert!(limits.is_limited);

    assert!(engine.reset(scope).await.unwrap());
    let limits = engine.evaluate_endpoint("free", scope, "POST", "/login").await.unwrap();
    assert!(limits.is_allowed());
    assert_eq!(engine.storage().len(), 1);
}

#[tokio::test]
async fn test_analytics_are_recorded_when_enabled() {
    let clock = ManualClock::at_secs(NOW);
    let engine = ThrottleEngine::builder()
        .plans(per_minute(1))
        .analytics(true)
        .clock(Arc::new(clock.clone()))
        .build(MemoryStorage::with_clock(clock))
        .unwrap();

    engine.evaluate("free", "user:1").await.unwrap();
    engine.evaluate("free", "user:1").await.unwrap();

    let records = engine.analytics(AnalyticsPeriod::Hour, 1).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].requests, 2);
    assert_eq!(records[0].limited, 1);
    assert_eq!(records[0].plan.as_deref(), Some("free"));
}

#[tokio::test]
async fn test_concurrent_evaluations_never_overshoot() {
    let (engine, _clock) = engine_with(per_minute(50));
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.evaluate("free", "user:1").await.unwrap().is_allowed()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
}
