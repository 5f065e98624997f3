use criterion::{black_box, criterion_group, criterion_main, Criterion};
use geoguard::{
    ApiError, ApiGuard, CircuitBreaker, CircuitBreakerConfig, GuardConfig, RateLimiter,
    WindowLimits,
};

use std::time::Duration;

fn rate_limit_check_and_consume(c: &mut Criterion) {
    let limits = WindowLimits::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX).unwrap();
    let limiter = RateLimiter::new(limits);

    c.bench_function("rate_limit_check_and_consume", |b| {
        b.iter(|| black_box(limiter.check_and_consume(black_box("geocode"), black_box("api-key"))));
    });
}

fn rate_limit_many_identifiers(c: &mut Criterion) {
    let limits = WindowLimits::new(10, 300, 5_000, 40_000).unwrap();
    let limiter = RateLimiter::new(limits);
    let identifiers: Vec<String> = (0..1_000).map(|i| format!("key-{i}")).collect();
    let mut next = 0usize;

    c.bench_function("rate_limit_1k_identifiers", |b| {
        b.iter(|| {
            next = (next + 1) % identifiers.len();
            black_box(limiter.check_and_consume("geocode", &identifiers[next]))
        });
    });
}

fn circuit_breaker_call_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

    c.bench_function("circuit_breaker_call_success", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = breaker.call("geocode", || async { Ok::<_, ApiError>(black_box(1)) }).await;
            black_box(outcome)
        });
    });
}

fn circuit_breaker_call_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1) // Open on first failure
        .recovery_timeout(Duration::from_secs(3_600))
        .build()
        .unwrap();
    let breaker = CircuitBreaker::new(config);
    rt.block_on(breaker.record_failure("geocode", &ApiError::status(503, "unavailable")));

    c.bench_function("circuit_breaker_call_open_fallback", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = breaker
                .call_with_fallback(
                    "geocode",
                    || async { Ok::<_, ApiError>(1) },
                    |_| async { Ok(black_box(0)) },
                )
                .await;
            black_box(outcome)
        });
    });
}

fn guard_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = GuardConfig::builder()
        .per_second(u32::MAX)
        .per_minute(u32::MAX)
        .per_hour(u32::MAX)
        .per_day(u32::MAX)
        .build()
        .unwrap();
    let guard = ApiGuard::new(config);

    c.bench_function("guard_execute", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = guard
                .execute("geocode", "api-key", || async { Ok::<_, ApiError>(black_box(1)) })
                .await;
            black_box(outcome)
        });
    });
}

criterion_group!(
    benches,
    rate_limit_check_and_consume,
    rate_limit_many_identifiers,
    circuit_breaker_call_success,
    circuit_breaker_call_open,
    guard_execute
);
criterion_main!(benches);
