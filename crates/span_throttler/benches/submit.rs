//! Submission throughput benchmarks.
//!
//! Measures the hot paths against `NullStore` so store latency does not
//! dominate: periodic refresh (lock + map update, no I/O) and a full
//! manual start/end round trip (two store calls).

use criterion::{criterion_group, criterion_main, Criterion};
use span_throttler::{NullStore, SubmitKind, Throttler, ThrottlerConfig};
use std::sync::Arc;
use std::time::Duration;

fn bench_config() -> ThrottlerConfig {
    ThrottlerConfig {
        update_pause: Duration::from_secs(3600),
        ttl: Duration::from_secs(120),
    }
}

fn submit_periodic(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let throttler = runtime.block_on(async {
        Throttler::new(bench_config(), Arc::new(NullStore::new()))
    });

    c.bench_function("submit_periodic_refresh", |b| {
        b.to_async(&runtime).iter(|| async {
            throttler
                .submit_periodic("typing", "bench", true, None)
                .await
        });
    });
}

fn manual_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let throttler = runtime.block_on(async {
        Throttler::new(bench_config(), Arc::new(NullStore::new()))
    });

    c.bench_function("manual_start_end", |b| {
        b.to_async(&runtime).iter(|| async {
            throttler
                .submit_manual("build", "bench", SubmitKind::Start, true, Some(1), None)
                .await
                .unwrap();
            throttler
                .submit_manual("build", "bench", SubmitKind::End, true, Some(2), None)
                .await
                .unwrap();
        });
    });
}

criterion_group!(benches, submit_periodic, manual_round_trip);
criterion_main!(benches);
