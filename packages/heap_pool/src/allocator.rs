//! Global allocator that routes every Rust allocation through the pools.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::{fmt, process};

use crate::current::current_target;
use crate::facade::{allocate_routed, reallocate, release};
use crate::fail_on_free;

/// A [`GlobalAlloc`] that sends allocations to the current pool of the allocating thread, or to
/// the system heap if no pool is current.
///
/// Deallocation finds the owning pool from the address alone, so memory may be dropped on any
/// thread. Memory allocated before a pool became current (or after it stopped being current)
/// stays where it was allocated.
///
/// If the current pool is over budget or no longer accepts allocations, the allocation fails
/// and the standard library reports it through
/// [`handle_alloc_error()`][std::alloc::handle_alloc_error].
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, PoolAllocator, PoolHold};
///
/// #[global_allocator]
/// static ALLOCATOR: PoolAllocator = PoolAllocator::new();
///
/// fn main() {
///     let pool = Pool::builder().build();
///
///     let text = {
///         let _hold = PoolHold::new(Some(&pool));
///         String::from("allocated from the pool")
///     };
///
///     let bytes = std::ptr::NonNull::from(text.as_bytes()).cast::<u8>();
///     assert_eq!(heap_pool::owner_of(bytes), Some(pool.id()));
/// }
/// ```
pub struct PoolAllocator {
    _private: (),
}

impl PoolAllocator {
    /// Creates the allocator, typically as the initializer of a `#[global_allocator]` static.
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator").finish_non_exhaustive()
    }
}

// SAFETY: Every block we return satisfies the requested layout: pools align to the requested
// alignment and the system heap path uses posix_memalign() for anything beyond the malloc()
// guarantee. Blocks stay valid until released through the same routing.
unsafe impl GlobalAlloc for PoolAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate_routed(current_target(), layout.size(), layout.align(), false, None)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        allocate_routed(current_target(), layout.size(), layout.align(), true, None)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };

        abort_if_marked(block);

        // SAFETY: The caller guarantees the block came from this allocator, so it is either a
        // pool block or a system heap block.
        unsafe { release(block, None) };
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(block) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };

        // Moving the block releases the original.
        abort_if_marked(block);

        // SAFETY: The caller guarantees the block came from this allocator with `layout`.
        unsafe {
            reallocate(
                block,
                new_size,
                layout.align(),
                current_target(),
                Some(layout.size()),
                None,
            )
        }
        .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

/// Stops the process if `block` was marked with [`failonfree()`][crate::failonfree].
///
/// Unwinding out of the allocator is not allowed, so this cannot be an assertion.
#[cfg_attr(test, mutants::skip)] // Aborting cannot be observed from within the test process.
fn abort_if_marked(block: NonNull<u8>) {
    if fail_on_free::is_marked(block.as_ptr().addr()) {
        eprintln!("block at {block:p} was marked with failonfree() and must not be freed");
        process::abort();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Pool, PoolHold, owner_of};

    assert_impl_all!(PoolAllocator: Send, Sync, fmt::Debug, Default);

    // The unit test binary keeps the standard allocator, so these call the trait methods directly.

    #[test]
    fn routes_to_current_pool() {
        let allocator = PoolAllocator::new();
        let pool = Pool::builder().build();
        let layout = Layout::from_size_align(100, 64).expect("valid layout");

        let block = {
            let _hold = PoolHold::new(Some(&pool));
            // SAFETY: The layout has a nonzero size.
            unsafe { allocator.alloc(layout) }
        };

        let block = NonNull::new(block).expect("unbounded pool has room");
        assert_eq!(block.as_ptr().addr() % 64, 0);
        assert_eq!(owner_of(block), Some(pool.id()));

        // Released without the pool being current.
        // SAFETY: The block came from this allocator with this layout.
        unsafe { allocator.dealloc(block.as_ptr(), layout) };
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn routes_to_system_heap_without_current_pool() {
        let allocator = PoolAllocator::new();
        let layout = Layout::from_size_align(100, 8).expect("valid layout");

        // SAFETY: The layout has a nonzero size.
        let block = NonNull::new(unsafe { allocator.alloc_zeroed(layout) })
            .expect("system heap has room");
        assert_eq!(owner_of(block), None);

        // SAFETY: We just allocated 100 bytes there.
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 100) };
        assert!(bytes.iter().all(|b| *b == 0));

        // SAFETY: The block came from this allocator with this layout.
        unsafe { allocator.dealloc(block.as_ptr(), layout) };
    }

    #[test]
    fn over_budget_returns_null() {
        let allocator = PoolAllocator::new();
        let pool = Pool::builder().max_size(1024).build();
        let layout = Layout::from_size_align(4096, 16).expect("valid layout");

        let _hold = PoolHold::new(Some(&pool));

        // SAFETY: The layout has a nonzero size.
        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }

    #[test]
    fn realloc_keeps_alignment_and_content() {
        let allocator = PoolAllocator::new();
        let pool = Pool::builder().build();
        let layout = Layout::from_size_align(64, 256).expect("valid layout");

        let _hold = PoolHold::new(Some(&pool));

        // SAFETY: The layout has a nonzero size.
        let block = unsafe { allocator.alloc(layout) };
        assert!(!block.is_null());

        // SAFETY: We just allocated 64 bytes there.
        unsafe { block.write_bytes(0x5A, 64) };

        // SAFETY: The block came from this allocator with this layout.
        let grown = unsafe { allocator.realloc(block, layout, 10_000) };
        let grown = NonNull::new(grown).expect("unbounded pool has room");

        assert_eq!(grown.as_ptr().addr() % 256, 0);
        assert_eq!(owner_of(grown), Some(pool.id()));

        // SAFETY: The block holds at least 64 initialized bytes.
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0x5A));

        let grown_layout = Layout::from_size_align(10_000, 256).expect("valid layout");

        // SAFETY: The block came from this allocator with this layout.
        unsafe { allocator.dealloc(grown.as_ptr(), grown_layout) };
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn realloc_moves_system_block_into_current_pool() {
        let allocator = PoolAllocator::new();
        let layout = Layout::from_size_align(32, 8).expect("valid layout");

        // SAFETY: The layout has a nonzero size.
        let block = unsafe { allocator.alloc(layout) };
        assert!(!block.is_null());

        // SAFETY: We just allocated 32 bytes there.
        unsafe { block.write_bytes(0x7E, 32) };

        let pool = Pool::builder().build();
        let _hold = PoolHold::new(Some(&pool));

        // SAFETY: The block came from this allocator with this layout.
        let moved = NonNull::new(unsafe { allocator.realloc(block, layout, 48) })
            .expect("unbounded pool has room");
        assert_eq!(owner_of(moved), Some(pool.id()));

        // SAFETY: The block holds at least 32 initialized bytes.
        let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == 0x7E));

        let moved_layout = Layout::from_size_align(48, 8).expect("valid layout");

        // SAFETY: The block came from this allocator with this layout.
        unsafe { allocator.dealloc(moved.as_ptr(), moved_layout) };
    }
}
