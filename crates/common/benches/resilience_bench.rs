//! Benchmarks for the resilience primitives' hot paths
//!
//! Covers token-bucket admission, circuit breaker admission and state
//! recording, and backoff/jitter calculation.
//!
//! Run with: `cargo bench --bench resilience_bench -p opendata-common`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opendata_common::resilience::{
    full_jitter, CircuitBreaker, CircuitBreakerConfig, RateLimiterConfig, RetryConfig,
    TokenBucketLimiter,
};

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    group.bench_function("acquire_admitted", |b| {
        let limiter = TokenBucketLimiter::new(RateLimiterConfig {
            capacity: 1_000_000.0,
            refill_per_second: 1_000_000.0,
            burst: None,
            ..Default::default()
        })
        .expect("valid config for benchmarks");
        b.iter(|| black_box(limiter.acquire(1.0)));
    });

    group.bench_function("acquire_denied", |b| {
        let limiter = TokenBucketLimiter::new(RateLimiterConfig {
            capacity: 1.0,
            refill_per_second: 0.001,
            burst: Some((1.0, 0.001)),
            ..Default::default()
        })
        .expect("valid config for benchmarks");
        limiter.acquire(1.0);
        limiter.acquire(1.0);
        b.iter(|| black_box(limiter.acquire(1.0)));
    });

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("admit_and_record_success", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("valid config for benchmarks");
        b.iter(|| {
            black_box(breaker.can_execute());
            breaker.record_success();
        });
    });

    group.bench_function("short_circuit_when_open", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(3600),
        })
        .expect("valid config for benchmarks");
        breaker.record_failure();
        b.iter(|| black_box(breaker.can_execute()));
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let config = RetryConfig::default();

    group.bench_function("delay_calculation", |b| {
        b.iter(|| {
            for attempt in 0..8 {
                black_box(config.backoff_delay(black_box(attempt)));
            }
        });
    });

    group.bench_function("full_jitter", |b| {
        let delay = Duration::from_millis(200);
        b.iter(|| black_box(full_jitter(black_box(delay))));
    });

    group.finish();
}

criterion_group!(benches, bench_token_bucket, bench_circuit_breaker, bench_backoff);
criterion_main!(benches);
