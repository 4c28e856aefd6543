#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Independent memory pools with per-thread pool selection and a pool-aware global allocator.
//!
//! This package provides:
//!
//! - [`Pool`] - an independently managed heap with its own byte budget, identifier, optional
//!   owning thread and optional lazy deletion.
//! - [`PoolHold`] and [`set_current_pool()`] - a per-thread "current pool" that redirects all
//!   unqualified allocations on that thread to a specific pool.
//! - [`malloc()`], [`calloc()`], [`realloc()`], [`free()`] and [`memsize()`] - C-style entry points
//!   that route to the current pool, an explicitly named pool or the system heap.
//! - [`PoolAllocator`] - a [`GlobalAlloc`][std::alloc::GlobalAlloc] implementation that sends
//!   every Rust allocation in the process through the same routing.
//! - [`PoolBox`] - an owning pointer that allocates through the pools and reports failure the
//!   way [`Box`] does.
//!
//! Any block may be freed from any thread, regardless of which pool is current on the freeing
//! thread. The owning pool is recovered from the block address alone, and blocks that were never
//! issued by a pool (for example, memory handed over by a third-party library that used the
//! system allocator) are forwarded to the system heap.
//!
//! # Example
//!
//! ```
//! use heap_pool::{Pool, PoolHold};
//!
//! let pool = Pool::builder().max_size(64 * 1024).identifier("request 42").build();
//!
//! {
//!     let _hold = PoolHold::new(Some(&pool));
//!
//!     // Unqualified allocations on this thread now come from `pool`.
//!     let block = heap_pool::malloc(1000).expect("pool has room for 1000 bytes");
//!     assert_eq!(heap_pool::owner_of(block), Some(pool.id()));
//!
//!     // SAFETY: The block was returned by `malloc()` and is not used afterwards.
//!     unsafe { heap_pool::free(block) };
//! }
//!
//! assert_eq!(pool.size(), 0);
//! assert_eq!(heap_pool::current_pool(), None);
//! ```
//!
//! # Using the pools for all allocations
//!
//! ```
//! use heap_pool::{Pool, PoolAllocator, PoolHold};
//!
//! #[global_allocator]
//! static ALLOCATOR: PoolAllocator = PoolAllocator::new();
//!
//! fn main() {
//!     let pool = Pool::builder().identifier("scratch").build();
//!
//!     let data = {
//!         let _hold = PoolHold::new(Some(&pool));
//!         vec![1_u64, 2, 3]
//!     };
//!
//!     assert!(pool.size() >= 24);
//!     drop(data);
//!     assert_eq!(pool.size(), 0);
//! }
//! ```
//!
//! # Platform support
//!
//! The system heap is accessed through the C library allocator, so this package supports Unix
//! targets only.
//!
//! # Miri compatibility
//!
//! The system heap path calls into libc, which Miri does not support, so most of this package
//! cannot be executed under Miri.

#[cfg(not(unix))]
compile_error!("heap_pool requires a Unix target with a C library allocator");

mod allocator;
mod arena;
mod block_table;
mod bookkeeping;
mod builder;
mod constants;
mod current;
mod drop_policy;
mod error;
mod facade;
mod fail_on_free;
mod pool;
mod pool_box;
mod registry;
mod statistics;
mod system;

pub use allocator::*;
pub(crate) use arena::*;
pub use block_table::BlockInfo;
pub(crate) use bookkeeping::*;
pub use builder::*;
pub use constants::*;
pub use current::*;
pub use drop_policy::*;
pub use error::*;
pub use facade::*;
pub use fail_on_free::{failonfree, unfailonfree};
pub use pool::{Pool, PoolId};
pub(crate) use pool::{PoolShared, PoolState};
pub use pool_box::PoolBox;
pub use registry::{PoolInfo, all_pools};
pub(crate) use registry::{PoolRegistry, register_thread_pools_reaper};
pub use statistics::Statistics;
