//! Gives every unit of work its own pool with `PoolAllocator` installed as the global allocator.
//!
//! Each simulated request runs on a worker thread that owns a pool. Everything the request
//! allocates, including ordinary Rust collections, comes from that pool and is bounded by its
//! budget. A result that outlives the worker keeps the pool alive until the result is dropped.
//!
//! Run with: `cargo run --example heap_pool_request_scoped`

use std::collections::HashMap;
use std::thread;

use heap_pool::{Pool, PoolAllocator, PoolId, all_pools};
use tracing::Level;

#[global_allocator]
static ALLOCATOR: PoolAllocator = PoolAllocator::new();

fn handle_request(request: u32) -> (PoolId, HashMap<u32, String>) {
    let pool = Pool::builder()
        .max_size(1024 * 1024)
        .identifier(format!("request {request}"))
        .owned_by_current_thread()
        .lazy_deleted(true)
        .build();

    // The pool is current on this thread, so these come from the pool.
    let response = (0..50)
        .map(|key| (key, format!("request {request}, item {key}")))
        .collect();

    (pool.id(), response)
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let responses: Vec<_> = (1..=4)
        .map(|request| thread::spawn(move || handle_request(request)))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|worker| worker.join().expect("worker does not panic"))
        .collect();

    println!("\nWorkers have exited, their pools wait for the responses:");
    for pool in all_pools() {
        println!("  {pool}");
    }

    for (pool, response) in responses {
        println!(
            "\nResponse from {pool} holds {} items, e.g. {:?}",
            response.len(),
            response.get(&0)
        );

        drop(response);
    }

    println!("\nPools remaining after dropping the responses: {}", all_pools().len());
    println!("Blocks still live in any pool: {}", heap_pool::print_leaked_blocks());
}
