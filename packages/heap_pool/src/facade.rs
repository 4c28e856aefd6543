//! C-style allocation entry points that route between pools and the system heap.
//!
//! Allocations go to an explicitly named pool, else to the current pool of the calling thread,
//! else to the system heap. Releases and size queries recover the owning pool from the block
//! address alone, so they work from any thread regardless of which pool is current there.
//! Blocks that no pool issued are handed to the system heap.

use std::fmt::Write as _;
use std::panic::Location;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::warn;

use crate::block_table::{BlockTable, in_table_operation};
use crate::current::{Target, current_target};
use crate::{
    BlockInfo, Error, MIN_ALIGN, Pool, PoolId, PoolRegistry, PoolShared, Result, Statistics,
    all_pools, fail_on_free, in_bookkeeping, system, with_bookkeeping,
};

/// Allocates `size` bytes from the current pool of this thread, or from the system heap if no
/// pool is current.
///
/// Zero-byte requests are served with a minimal block. Returns `None` if the current pool is
/// over budget or no longer accepts allocations, or if the system is out of memory.
///
/// # Examples
///
/// ```
/// let block = heap_pool::malloc(64).expect("system heap has 64 bytes to spare");
///
/// // SAFETY: The block came from malloc() and is not used afterwards.
/// unsafe { heap_pool::free(block) };
/// ```
#[must_use]
#[track_caller]
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    allocate_routed(current_target(), size, MIN_ALIGN, false, Some(Location::caller())).ok()
}

/// Allocates `size` bytes from `pool`, regardless of which pool is current.
#[must_use]
#[track_caller]
pub fn malloc_in(size: usize, pool: &Pool) -> Option<NonNull<u8>> {
    allocate_routed(explicit(pool), size, MIN_ALIGN, false, Some(Location::caller())).ok()
}

/// Allocates `size` bytes aligned to `align` from `pool` if given, else with the same routing as
/// [`malloc()`].
///
/// Returns `None` if `align` is not a power of two or the memory cannot be allocated.
#[must_use]
#[track_caller]
pub fn aligned_malloc(size: usize, align: usize, pool: Option<&Pool>) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
        return None;
    }

    let target = pool.map_or_else(current_target, explicit);
    allocate_routed(target, size, align, false, Some(Location::caller())).ok()
}

/// Allocates zero-initialized memory for `count` elements of `size` bytes each, with the same
/// routing as [`malloc()`].
///
/// Returns `None` if `count * size` overflows or the memory cannot be allocated.
#[must_use]
#[track_caller]
pub fn calloc(count: usize, size: usize) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    allocate_routed(current_target(), total, MIN_ALIGN, true, Some(Location::caller())).ok()
}

/// Allocates zero-initialized memory for `count` elements of `size` bytes each from `pool`.
#[must_use]
#[track_caller]
pub fn calloc_in(count: usize, size: usize, pool: &Pool) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    allocate_routed(explicit(pool), total, MIN_ALIGN, true, Some(Location::caller())).ok()
}

/// Resizes a block, preserving its content up to the smaller of the old and new sizes.
///
/// The target heap is chosen with the same routing as [`malloc()`]. If the block is owned by
/// that heap, it is resized there (in place if possible). Otherwise it is moved to the target
/// heap: a new block is allocated there, the content copied and the original block released.
///
/// Returns `None` if the memory cannot be allocated, in which case the original block remains
/// valid and unchanged.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator.
/// On success, the caller must use the returned pointer instead of `block` from then on.
///
/// # Panics
///
/// In builds with debug assertions, panics if the block was marked with
/// [`failonfree()`][crate::failonfree], as resizing may release it.
#[must_use]
#[track_caller]
pub unsafe fn realloc(block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
    let origin = Some(Location::caller());

    // SAFETY: Forwarding the caller's guarantees.
    unsafe { reallocate(block, new_size, MIN_ALIGN, current_target(), None, origin) }
}

/// Resizes a block, moving it into `pool` if it is not already owned by it.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator.
/// On success, the caller must use the returned pointer instead of `block` from then on.
///
/// # Panics
///
/// In builds with debug assertions, panics if the block was marked with
/// [`failonfree()`][crate::failonfree].
#[must_use]
#[track_caller]
pub unsafe fn realloc_in(block: NonNull<u8>, new_size: usize, pool: &Pool) -> Option<NonNull<u8>> {
    let origin = Some(Location::caller());

    // SAFETY: Forwarding the caller's guarantees.
    unsafe { reallocate(block, new_size, MIN_ALIGN, explicit(pool), None, origin) }
}

/// Releases a block, whichever pool (or the system heap) it came from and whichever thread
/// allocated it.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator and
/// must not be used afterwards.
///
/// # Panics
///
/// In builds with debug assertions, panics if the block was marked with
/// [`failonfree()`][crate::failonfree].
pub unsafe fn free(block: NonNull<u8>) {
    assert!(
        !fail_on_free::is_marked(block.as_ptr().addr()),
        "block at {block:p} was marked with failonfree() and must not be freed"
    );

    // SAFETY: Forwarding the caller's guarantees.
    unsafe { release(block, None) };
}

/// Releases a block that the caller knows to be owned by `pool`.
///
/// The owner is still recovered from the block itself; in builds with debug assertions, a
/// mismatch fails an assertion.
///
/// # Safety
///
/// `block` must be a live block of `pool` and must not be used afterwards.
///
/// # Panics
///
/// In builds with debug assertions, panics if the block was marked with
/// [`failonfree()`][crate::failonfree].
pub unsafe fn free_in(block: NonNull<u8>, pool: &Pool) {
    assert!(
        !fail_on_free::is_marked(block.as_ptr().addr()),
        "block at {block:p} was marked with failonfree() and must not be freed"
    );

    // SAFETY: Forwarding the caller's guarantees.
    unsafe { release(block, Some(pool.id())) };
}

/// The usable size of a block, which is at least the size that was requested.
///
/// For system heap blocks this is whatever the C library reports, which is zero on platforms
/// where it cannot tell.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator.
#[must_use]
pub unsafe fn memsize(block: NonNull<u8>) -> usize {
    if let Some(owner) = owner(block) {
        return with_bookkeeping(|| owner.block_size(block)).unwrap_or(0);
    }

    // SAFETY: Not owned by any pool, so the caller guarantees it is a C library block.
    unsafe { system::usable_size(block) }
}

/// The pool that owns `block`, or `None` if no pool issued it.
///
/// Any pointer may be passed. Pointers into the middle of a block, or to blocks that were
/// already released, are reported as not owned by any pool.
#[must_use]
pub fn owner_of(block: NonNull<u8>) -> Option<PoolId> {
    owner(block).map(|owner| owner.id())
}

/// Every live block of every pool, ordered by address.
///
/// In builds with debug assertions, each block carries the source location that allocated it.
#[must_use]
pub fn leaked_blocks() -> Vec<BlockInfo> {
    with_bookkeeping(|| {
        let mut blocks: Vec<BlockInfo> = BlockTable::global()
            .snapshot()
            .into_iter()
            .filter_map(|(address, pool, origin)| {
                let block = NonNull::new(ptr::without_provenance_mut::<u8>(address))?;

                Some(BlockInfo {
                    address,
                    size: pool.block_size(block)?,
                    pool: pool.id(),
                    origin,
                })
            })
            .collect();

        blocks.sort_unstable_by_key(|block| block.address);
        blocks
    })
}

/// Reports every live block of every pool to standard error and as `warn` level log events,
/// returning how many there were.
#[cfg_attr(test, mutants::skip)] // Output only.
pub fn print_leaked_blocks() -> usize {
    let blocks = leaked_blocks();

    with_bookkeeping(|| {
        for block in &blocks {
            warn!(%block, "leaked block");
            eprintln!("leaked block: {block}");
        }
    });

    blocks.len()
}

/// Statistics of the system heap, as far as the C library reports them.
///
/// Pools are not included; see [`Pool::statistics()`] and [`all_pools()`].
#[must_use]
pub fn global_statistics() -> Statistics {
    system::statistics()
}

/// A human-readable report of the system heap statistics followed by one line per pool.
#[must_use]
pub fn global_statistics_string() -> String {
    with_bookkeeping(|| {
        let mut report = format!("system heap: {}", global_statistics());

        for pool in all_pools() {
            // Writing to a String cannot fail.
            _ = write!(report, "\n{pool}");
        }

        report
    })
}

/// Asks the system heap to return free memory to the operating system, keeping at least
/// `keep` bytes of padding. Returns whether any memory was released.
///
/// Pools are trimmed individually with [`Pool::trim()`].
#[expect(
    clippy::must_use_candidate,
    reason = "trimming is done for its effect, the outcome is informational"
)]
pub fn trim(keep: usize) -> bool {
    system::trim(keep)
}

fn explicit(pool: &Pool) -> Target {
    Target::Pool(Arc::clone(pool.shared()))
}

/// The pool that owns the block at `block`, if any.
fn owner(block: NonNull<u8>) -> Option<Arc<PoolShared>> {
    if BlockTable::global().is_empty() || in_table_operation() {
        return None;
    }

    with_bookkeeping(|| BlockTable::global().resolve(block.as_ptr().addr()))
}

/// Allocates from the given target.
pub(crate) fn allocate_routed(
    target: Target,
    size: usize,
    align: usize,
    zeroed: bool,
    origin: Option<&'static Location<'static>>,
) -> Result<NonNull<u8>> {
    match target {
        Target::Pool(pool) => {
            with_bookkeeping(move || pool.allocate(size, align, zeroed, origin))
        }
        Target::SystemHeap => {
            let block = if zeroed {
                system::allocate_zeroed(size, align)
            } else {
                system::allocate(size, align)
            };

            block.ok_or(Error::OutOfMemory {
                requested: size,
                pool: None,
            })
        }
        Target::Unavailable(pool) => Err(Error::PoolUnavailable { pool }),
    }
}

/// Resizes a block, moving it to `target` if it is owned by a different heap.
///
/// `old_size` is the size of the block if the caller knows it.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator.
///
/// # Panics
///
/// In builds with debug assertions, panics if the block was marked with
/// [`failonfree()`][crate::failonfree]. Any path here may release the original block.
#[track_caller]
pub(crate) unsafe fn reallocate(
    block: NonNull<u8>,
    new_size: usize,
    align: usize,
    target: Target,
    old_size: Option<usize>,
    origin: Option<&'static Location<'static>>,
) -> Option<NonNull<u8>> {
    assert!(
        !fail_on_free::is_marked(block.as_ptr().addr()),
        "block at {block:p} was marked with failonfree() and must not be freed"
    );

    let owner = owner(block);

    match (owner, target) {
        (Some(owner), Target::Pool(pool)) if Arc::ptr_eq(&owner, &pool) => {
            with_bookkeeping(|| owner.resize(block, new_size)).ok()
        }
        // A delete-pending pool still resizes the blocks it owns.
        (Some(owner), Target::Unavailable(id)) if owner.id() == id => {
            with_bookkeeping(|| owner.resize(block, new_size)).ok()
        }
        (None, Target::SystemHeap) if align <= system::GUARANTEED_ALIGN => {
            // SAFETY: Not owned by any pool, so the caller guarantees it is a C library block.
            unsafe { system::reallocate(block, new_size) }
        }
        (_, Target::Unavailable(_)) => None,
        (owner, target) => {
            let moved = allocate_routed(target, new_size, align, false, origin).ok()?;

            // SAFETY: Forwarding the caller's guarantees; `moved` is a fresh block of at least
            // `new_size` bytes.
            unsafe { move_content(block, owner, old_size, moved, new_size) }
        }
    }
}

/// Copies the content of `block` into `moved` and releases `block`.
///
/// # Safety
///
/// `block` must be a live block of `owner` (or of the C library allocator if `owner` is `None`)
/// and `moved` a distinct live block of at least `new_size` bytes.
unsafe fn move_content(
    block: NonNull<u8>,
    owner: Option<Arc<PoolShared>>,
    old_size: Option<usize>,
    moved: NonNull<u8>,
    new_size: usize,
) -> Option<NonNull<u8>> {
    if let Some(owner) = owner {
        let old_size = with_bookkeeping(|| owner.block_size(block)).unwrap_or(0);

        // SAFETY: Both blocks are live and distinct, each holding at least the copied length.
        unsafe { moved.copy_from_nonoverlapping(block, old_size.min(new_size)) };

        with_bookkeeping(|| {
            let tag = BlockTable::global().untag(block.as_ptr().addr());
            owner.release_untagged(block);
            drop(tag);
        });

        return Some(moved);
    }

    // SAFETY: Not owned by any pool, so the caller guarantees it is a C library block.
    let old_size = old_size.unwrap_or_else(|| unsafe { system::usable_size(block) });

    if old_size > 0 {
        // SAFETY: Both blocks are live and distinct, each holding at least the copied length.
        unsafe { moved.copy_from_nonoverlapping(block, old_size.min(new_size)) };

        // SAFETY: The caller guarantees it is a C library block that is not used afterwards.
        unsafe { system::release(block) };

        return Some(moved);
    }

    // The C library cannot tell us the size of the block. Resizing it in place first gives us
    // a block of exactly `new_size` bytes whose prefix is the original content.
    // SAFETY: The caller guarantees it is a C library block.
    let Some(staged) = (unsafe { system::reallocate(block, new_size) }) else {
        // SAFETY: We just allocated `moved` and nobody else knows about it.
        unsafe { release(moved, None) };
        return None;
    };

    // SAFETY: Both blocks are live, distinct and at least `new_size` bytes long.
    unsafe { moved.copy_from_nonoverlapping(staged, new_size) };

    // SAFETY: `staged` came from the C library and is not used afterwards.
    unsafe { system::release(staged) };

    Some(moved)
}

/// Releases a block to its owner, or to the system heap if no pool owns it.
///
/// # Safety
///
/// `block` must be a live block obtained from this package or from the C library allocator and
/// must not be used afterwards.
pub(crate) unsafe fn release(block: NonNull<u8>, expected_owner: Option<PoolId>) {
    let table = BlockTable::global();

    // Memory of the shard maps themselves is always system memory and must not touch the table.
    if table.is_empty() || in_table_operation() {
        // SAFETY: No pool owns it, so the caller guarantees it is a C library block.
        unsafe { system::release(block) };
        return;
    }

    // Our own locks may be held during bookkeeping, so the address range check must not run.
    let may_inspect_pools = cfg!(debug_assertions) && !in_bookkeeping();

    with_bookkeeping(|| {
        let addr = block.as_ptr().addr();

        if let Some(tag) = table.untag(addr) {
            debug_assert!(
                expected_owner.is_none_or(|expected| expected == tag.pool.id()),
                "block at {block:p} belongs to {}, not to the pool it was released into",
                tag.pool.id()
            );

            tag.pool.release_untagged(block);
            return;
        }

        if may_inspect_pools {
            if let Some(holder) = PoolRegistry::global().pool_holding(addr) {
                warn!(
                    pool = %holder,
                    address = addr,
                    "release of an address inside pool memory that is not a live block"
                );

                panic!(
                    "block at {block:p} lies inside {holder} but is not a live block; \
                     double free or interior pointer?"
                );
            }
        }

        // SAFETY: No pool owns it, so the caller guarantees it is a C library block.
        unsafe { system::release(block) };
    });
}
