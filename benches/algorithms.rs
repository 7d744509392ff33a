//! Benchmarks for rate limiting strategies and full plan evaluation.

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use smart_throttle::{
    Algorithm, FixedWindow, MemoryStorage, SlidingWindow, ThrottleConfig, ThrottleEngine,
    TokenBucket,
};
use tokio::runtime::Runtime;

const LIMIT: u64 = 1000;
const WINDOW: Duration = Duration::from_secs(1);

fn bench_algorithms(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("algorithms");

    // Token Bucket
    group.bench_function("token_bucket", |b| {
        let storage = MemoryStorage::new();
        let algorithm = TokenBucket::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("token:{}", i % 100);
            rt.block_on(async {
                black_box(algorithm.attempt(&storage, &key, LIMIT, WINDOW).await)
            })
        })
    });

    // Fixed Window
    group.bench_function("fixed_window", |b| {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("fixed:{}", i % 100);
            rt.block_on(async {
                black_box(algorithm.attempt(&storage, &key, LIMIT, WINDOW).await)
            })
        })
    });

    // Sliding Window
    group.bench_function("sliding_window", |b| {
        let storage = MemoryStorage::new();
        let algorithm = SlidingWindow::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("sliding:{}", i % 100);
            rt.block_on(async {
                black_box(algorithm.attempt(&storage, &key, LIMIT, WINDOW).await)
            })
        })
    });

    group.finish();
}

fn bench_plan_evaluation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = ThrottleConfig::default();

    let mut group = c.benchmark_group("plan_evaluation");

    for algorithm in ["fixed_window", "sliding_window", "token_bucket"] {
        for num_keys in [1u64, 100, 1000] {
            group.bench_with_input(
                BenchmarkId::new(algorithm, num_keys),
                &num_keys,
                |b, &num_keys| {
                    let engine = ThrottleEngine::builder()
                        .plans(config.plan_table().unwrap())
                        .algorithm(algorithm)
                        .build(MemoryStorage::new())
                        .unwrap();
                    let mut i = 0u64;
                    b.iter(|| {
                        i += 1;
                        let scope = format!("user:{}", i % num_keys);
                        rt.block_on(async {
                            black_box(engine.evaluate("enterprise", &scope).await)
                        })
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_quota_tracking(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = ThrottleEngine::from_config(&ThrottleConfig::default(), MemoryStorage::new())
        .unwrap();

    c.bench_function("quota_tracking", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let scope = format!("user:{}", i % 100);
            rt.block_on(async { black_box(engine.evaluate_quota("pro", &scope, 1).await) })
        })
    });
}

criterion_group!(
    benches,
    bench_algorithms,
    bench_plan_evaluation,
    bench_quota_tracking
);
criterion_main!(benches);
