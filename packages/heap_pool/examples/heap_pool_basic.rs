//! Basic usage of `heap_pool` with explicit pools and the C-style entry points.
//!
//! Run with: `cargo run --example heap_pool_basic`

use heap_pool::{Pool, PoolHold};

fn main() {
    println!("=== Pool Basics ===\n");

    // A pool with a 64 KiB budget.
    let pool = Pool::builder()
        .max_size(64 * 1024)
        .identifier("basic example")
        .build();

    println!("Created {} with a budget of {} bytes", pool.id(), pool.max_size());

    // 1. Allocating directly from the pool.
    let block = pool.allocate(1000).expect("fresh pool has room for 1000 bytes");
    println!("Allocated a block, the pool now holds {} bytes", pool.size());

    // 2. Making the pool current so that unqualified allocations go to it.
    let second = {
        let _hold = PoolHold::new(Some(&pool));
        heap_pool::calloc(10, 100).expect("pool has room for 1000 zeroed bytes")
    };

    println!(
        "Unqualified allocation went to {:?}, the pool now holds {} bytes",
        heap_pool::owner_of(second),
        pool.size()
    );

    // 3. Running out of budget.
    match pool.allocate(100_000) {
        Some(_) => println!("Unexpectedly fit 100000 bytes into a 64 KiB pool"),
        None => println!("A 100000 byte request does not fit into the budget"),
    }

    // 4. Reporting.
    println!("\nPool statistics: {}", pool.statistics());
    println!("\nAll heaps:\n{}", heap_pool::global_statistics_string());

    // 5. Freeing does not need to know which pool a block came from.
    // SAFETY: Both blocks are live and not used afterwards.
    unsafe {
        heap_pool::free(block);
        heap_pool::free(second);
    }

    println!("\nAfter freeing, the pool holds {} bytes", pool.size());
    println!("Returned {} bytes of unused memory to the system", pool.trim());
}
