//! Compares allocating from a pool against allocating from the system heap.
//!
//! All benchmarks go through `PoolAllocator`, so the system heap numbers include the cost of the
//! routing decision and of the owner lookup on release.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use heap_pool::{Pool, PoolAllocator, PoolHold};

#[global_allocator]
static ALLOCATOR: PoolAllocator = PoolAllocator::new();

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const SMALL: usize = 48;
const MEDIUM: usize = 4096;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_pool_alloc_free");

    for size in [SMALL, MEDIUM] {
        group.bench_function(format!("system_{size}"), |b| {
            b.iter(|| drop(black_box(vec![0_u8; size])));
        });

        let pool = Pool::builder().build();

        group.bench_function(format!("pool_{size}"), |b| {
            let _hold = PoolHold::new(Some(&pool));

            b.iter(|| drop(black_box(vec![0_u8; size])));
        });

        group.bench_function(format!("explicit_{size}"), |b| {
            b.iter(|| {
                let block = heap_pool::malloc_in(size, &pool).expect("unbounded pool has room");

                // SAFETY: The block is live and not used afterwards.
                unsafe { heap_pool::free(black_box(block)) };
            });
        });
    }

    group.finish();

    let mut group = c.benchmark_group("heap_pool_teardown");

    group.bench_function("drop_pool_with_1000_blocks", |b| {
        b.iter_batched(
            || {
                let pool = Pool::builder().build();

                for _ in 0..1000 {
                    _ = pool.allocate(SMALL);
                }

                pool
            },
            drop,
            BatchSize::SmallInput,
        );
    });

    group.bench_function("free_1000_blocks_then_drop_pool", |b| {
        b.iter_batched(
            || {
                let pool = Pool::builder().build();

                let blocks: Vec<_> = (0..1000)
                    .filter_map(|_| pool.allocate(SMALL))
                    .collect();

                (pool, blocks)
            },
            |(pool, blocks)| {
                for block in blocks {
                    // SAFETY: The block is live and not used afterwards.
                    unsafe { pool.release(block) };
                }

                drop(pool);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}
