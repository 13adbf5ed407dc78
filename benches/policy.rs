use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use stanchion::breaker::CircuitBreaker;
use stanchion::error::BoxError;
use stanchion::limiter::RateLimiter;
use tokio::runtime::Runtime;

fn bench_limiter_admit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = RateLimiter::per_key(1_000_000, Duration::from_secs(1));

    c.bench_function("limiter_admit_single_key", |b| {
        b.iter(|| rt.block_on(limiter.admit("client-a")))
    });

    let keys: Vec<String> = (0..1024).map(|i| format!("client-{i}")).collect();
    let mut i = 0;
    c.bench_function("limiter_admit_many_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            rt.block_on(limiter.admit(&keys[i]))
        })
    });
}

fn bench_breaker_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = CircuitBreaker::new(5, Duration::from_secs(30));

    c.bench_function("breaker_execute_closed", |b| {
        b.iter(|| rt.block_on(breaker.execute("billing", async { Ok::<_, BoxError>(1u32) })))
    });
}

criterion_group!(benches, bench_limiter_admit, bench_breaker_execute);
criterion_main!(benches);
