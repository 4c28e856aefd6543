//! The system heap, reached through the C library allocator.
//!
//! Blocks from here carry no bookkeeping at all. Anything we cannot attribute to a pool is
//! assumed to have come from here (directly or via the Rust system allocator, which uses the same
//! C library functions on Unix) and is released with `free()`.

use std::mem;
use std::ptr::{self, NonNull};

use crate::Statistics;

/// Alignment that every `malloc()` result is guaranteed to satisfy.
pub(crate) const GUARANTEED_ALIGN: usize = 2 * mem::size_of::<usize>();

/// Allocates `size` bytes aligned to `align` (a power of two).
///
/// Zero-sized requests are served as one-byte requests.
pub(crate) fn allocate(size: usize, align: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);

    if align <= GUARANTEED_ALIGN && align <= size {
        // SAFETY: malloc() accepts any size and returns null on failure.
        return NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>());
    }

    let mut out: *mut libc::c_void = ptr::null_mut();
    let align = align.max(mem::size_of::<usize>());

    // SAFETY: `align` is a power of two and a multiple of the pointer size, as posix_memalign()
    // requires. The output pointer is a valid local.
    let status = unsafe { libc::posix_memalign(&raw mut out, align, size) };

    if status == 0 {
        NonNull::new(out.cast::<u8>())
    } else {
        None
    }
}

/// Allocates `size` zeroed bytes aligned to `align` (a power of two).
pub(crate) fn allocate_zeroed(size: usize, align: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);

    if align <= GUARANTEED_ALIGN && align <= size {
        // SAFETY: calloc() accepts any count and size and returns null on failure.
        return NonNull::new(unsafe { libc::calloc(1, size) }.cast::<u8>());
    }

    let block = allocate(size, align)?;

    // SAFETY: We just allocated `size` bytes at `block`.
    unsafe {
        block.as_ptr().write_bytes(0, size);
    }

    Some(block)
}

/// Resizes a block previously obtained from the system heap.
///
/// On failure the original block remains valid. The result is only guaranteed to have the
/// natural `malloc()` alignment.
///
/// # Safety
///
/// `block` must be a live block from the C library allocator.
pub(crate) unsafe fn reallocate(block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
    // SAFETY: Forwarding the caller's guarantee that the block came from the C allocator.
    let resized = unsafe { libc::realloc(block.as_ptr().cast(), new_size.max(1)) };
    NonNull::new(resized.cast::<u8>())
}

/// Releases a block previously obtained from the system heap.
///
/// # Safety
///
/// `block` must be a live block from the C library allocator.
pub(crate) unsafe fn release(block: NonNull<u8>) {
    // SAFETY: Forwarding the caller's guarantee that the block came from the C allocator.
    unsafe {
        libc::free(block.as_ptr().cast());
    }
}

/// Returns the usable size of a system heap block, or zero if the platform cannot tell.
///
/// # Safety
///
/// `block` must be a live block from the C library allocator.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn usable_size(block: NonNull<u8>) -> usize {
    // SAFETY: Forwarding the caller's guarantee that the block came from the C allocator.
    unsafe { libc::malloc_usable_size(block.as_ptr().cast()) }
}

/// Returns the usable size of a system heap block, or zero if the platform cannot tell.
///
/// # Safety
///
/// `block` must be a live block from the C library allocator.
#[cfg(target_vendor = "apple")]
pub(crate) unsafe fn usable_size(block: NonNull<u8>) -> usize {
    // SAFETY: Forwarding the caller's guarantee that the block came from the C allocator.
    unsafe { libc::malloc_size(block.as_ptr().cast_const().cast()) }
}

/// Returns the usable size of a system heap block, or zero if the platform cannot tell.
///
/// # Safety
///
/// `block` must be a live block from the C library allocator.
#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
pub(crate) unsafe fn usable_size(_block: NonNull<u8>) -> usize {
    0
}

/// Statistics reported by the C library for the system heap.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) fn statistics() -> Statistics {
    // SAFETY: mallinfo2() has no preconditions.
    let info = unsafe { libc::mallinfo2() };

    Statistics {
        arena: info.arena,
        free_chunks: info.ordblks,
        fast_chunks: info.smblks,
        mmap_regions: info.hblks,
        mmap_bytes: info.hblkhd,
        max_alloc: info.usmblks,
        total_fast: info.fsmblks,
        total_alloc: info.uordblks,
        total_free: info.fordblks,
        keep_cost: info.keepcost,
    }
}

/// Statistics reported by the C library for the system heap.
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub(crate) fn statistics() -> Statistics {
    Statistics::default()
}

/// Asks the C library to return free memory to the operating system, keeping `keep` bytes.
///
/// Returns whether any memory was released.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[cfg_attr(test, mutants::skip)] // Whether anything is released depends on the heap state.
pub(crate) fn trim(keep: usize) -> bool {
    // SAFETY: malloc_trim() has no preconditions.
    unsafe { libc::malloc_trim(keep) != 0 }
}

/// Asks the C library to return free memory to the operating system, keeping `keep` bytes.
///
/// Returns whether any memory was released.
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub(crate) fn trim(_keep: usize) -> bool {
    false
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let block = allocate(100, 8).expect("system heap has 100 bytes to spare");

        // SAFETY: We own the 100 byte block.
        unsafe {
            block.as_ptr().write_bytes(0xAB, 100);
            release(block);
        }
    }

    #[test]
    fn zero_size_is_served() {
        let block = allocate(0, 1).expect("zero-sized requests are served");

        // SAFETY: We own the block.
        unsafe { release(block) };
    }

    #[test]
    fn over_aligned_allocation_is_aligned() {
        for align in [32_usize, 64, 4096] {
            let block = allocate(10, align).expect("aligned allocation succeeds");
            assert_eq!(block.as_ptr() as usize % align, 0);

            // SAFETY: We own the block.
            unsafe { release(block) };
        }
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        for align in [8_usize, 128] {
            let block = allocate_zeroed(256, align).expect("allocation succeeds");

            // SAFETY: We own the 256 byte block.
            let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 256) };
            assert!(bytes.iter().all(|b| *b == 0));

            // SAFETY: We own the block.
            unsafe { release(block) };
        }
    }

    #[test]
    fn reallocate_preserves_prefix() {
        let block = allocate(16, 8).expect("allocation succeeds");

        // SAFETY: We own the 16 byte block, then hand it to realloc().
        let grown = unsafe {
            block.as_ptr().copy_from_nonoverlapping([7_u8; 16].as_ptr(), 16);
            reallocate(block, 4096).expect("realloc succeeds")
        };

        // SAFETY: The grown block holds at least 16 bytes.
        let prefix = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 16) };
        assert_eq!(prefix, &[7_u8; 16]);

        // SAFETY: We own the block.
        unsafe { release(grown) };
    }

    #[cfg(any(target_os = "linux", target_vendor = "apple"))]
    #[test]
    fn usable_size_covers_request() {
        let block = allocate(100, 8).expect("allocation succeeds");

        // SAFETY: We own the block.
        unsafe {
            assert!(usable_size(block) >= 100);
            release(block);
        }
    }

    #[test]
    fn statistics_do_not_panic() {
        let stats = statistics();
        assert!(stats.total_alloc <= stats.total_alloc.saturating_add(stats.total_free));
    }
}
