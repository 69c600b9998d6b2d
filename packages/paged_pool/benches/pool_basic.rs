//! Basic benchmarks for the `paged_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use paged_pool::{HeapPages, Pool, PoolRegistry, WaitMode};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const OBJECT_SIZE: usize = 64;

fn bench_pool(registry: &Arc<PoolRegistry>) -> Pool {
    Pool::builder()
        .object_size(OBJECT_SIZE)
        .poison(false)
        .page_store(Arc::new(HeapPages::new()))
        .registry(registry)
        .build()
        .unwrap()
}

fn entrypoint(c: &mut Criterion) {
    let registry = Arc::new(PoolRegistry::new());

    let mut group = c.benchmark_group("pool_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(bench_pool(&registry)));
            }

            start.elapsed()
        });
    });

    group.bench_function("get_put_warm", |b| {
        b.iter_custom(|iters| {
            let pool = bench_pool(&registry);
            pool.prime(1);

            let start = Instant::now();

            for _ in 0..iters {
                let object = black_box(pool.get(WaitMode::NoWait).unwrap());
                pool.put(object);
            }

            start.elapsed()
        });
    });

    group.bench_function("get_1000_cold", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = std::time::Duration::ZERO;

            for _ in 0..iters {
                let pool = bench_pool(&registry);
                let mut objects = Vec::with_capacity(1000);

                let start = Instant::now();

                for _ in 0..1000 {
                    objects.push(black_box(pool.get(WaitMode::NoWait).unwrap()));
                }

                elapsed += start.elapsed();

                for object in objects {
                    pool.put(object);
                }
            }

            elapsed
        });
    });

    group.bench_function("prime_block", |b| {
        b.iter_custom(|iters| {
            let pools = (0..iters)
                .map(|_| bench_pool(&registry))
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &pools {
                black_box(pool.prime(4096 / OBJECT_SIZE));
            }

            start.elapsed()
        });
    });

    group.finish();
}
