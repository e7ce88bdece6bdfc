//! Resilience benchmarks
//!
//! Benchmarks for the circuit breaker hot paths (admission, rejection,
//! tripping) and the retry backoff computation.
//!
//! Run with: `cargo bench --bench resilience_bench -p faultline-resilience`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use faultline_resilience::{BreakerError, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_sync_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_sync_paths");

    group.bench_function("call_success", |b| {
        let breaker = CircuitBreaker::with_defaults();
        b.iter(|| {
            let result: Result<_, BreakerError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            if let Err(err) = result {
                panic!("circuit breaker success path failed: {err}");
            }
        });
    });

    group.bench_function("call_rejected_while_open", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .wait_duration(Duration::from_secs(3600))
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::new(config).expect("circuit breaker should build");
        let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("trip")));

        b.iter(|| {
            let result: Result<(), BreakerError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            black_box(result.is_err());
        });
    });

    group.bench_function("fail_to_open", |b| {
        b.iter(|| {
            let config = CircuitBreakerConfig::builder()
                .failure_threshold(5)
                .success_threshold(2)
                .wait_duration(Duration::from_secs(30))
                .build()
                .expect("valid circuit breaker config for benchmarks");
            let breaker = CircuitBreaker::new(config).expect("circuit breaker should build");

            for _ in 0..5 {
                let result: Result<_, BreakerError<std::io::Error>> =
                    breaker.call(|| Err::<(), _>(std::io::Error::other("benchmark failure")));
                let _result = black_box(result);
            }

            black_box(breaker.state());
        });
    });

    group.finish();
}

fn bench_circuit_breaker_async_execute(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("benchmark runtime should build");

    c.bench_function("circuit_breaker_execute_success", |b| {
        let breaker = CircuitBreaker::with_defaults();
        b.iter(|| {
            runtime.block_on(async {
                let result: Result<_, BreakerError<std::io::Error>> =
                    breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
                black_box(result.is_ok());
            });
        });
    });
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_delay_math(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_delay_for");

    let deterministic = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(30))
        .backoff_multiplier(2.0)
        .jitter_factor(0.0)
        .build()
        .expect("valid policy for benchmarks");

    let jittered = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(30))
        .backoff_multiplier(2.0)
        .jitter_factor(0.5)
        .build()
        .expect("valid policy for benchmarks");

    for attempt in [1u32, 4, 16] {
        group.bench_with_input(BenchmarkId::new("deterministic", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(deterministic.delay_for(n)));
        });
        group.bench_with_input(BenchmarkId::new("jittered", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(jittered.delay_for(n)));
        });
    }

    group.finish();
}

fn bench_retry_first_attempt_success(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("benchmark runtime should build");

    c.bench_function("retry_execute_first_attempt_success", |b| {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(1))
            .build()
            .expect("valid policy for benchmarks");

        b.iter(|| {
            runtime.block_on(async {
                let result = policy.execute(|| async { Ok::<_, std::io::Error>(42) }).await;
                black_box(result.is_ok());
            });
        });
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_sync_paths,
    bench_circuit_breaker_async_execute,
    bench_retry_delay_math,
    bench_retry_first_attempt_success
);
criterion_main!(benches);
