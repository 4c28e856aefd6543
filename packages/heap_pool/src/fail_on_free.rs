//! Debug aid that makes freeing specific blocks fail loudly.
//!
//! Marking a block turns a later, unexpected release of it into an immediate assertion failure
//! at the offending call site instead of a crash somewhere else much later. Only active in
//! builds with debug assertions.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// How many blocks can be marked at the same time.
const SLOTS: usize = 32;

/// Addresses of marked blocks. Zero means an empty slot.
static MARKED: Mutex<[usize; SLOTS]> = Mutex::new([0; SLOTS]);

/// Number of occupied slots, so that the free path can skip the lock while nothing is marked.
static MARKED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Marks a block so that freeing it triggers an assertion failure.
///
/// Up to 32 blocks can be marked at once; further marks are ignored. Does nothing in builds
/// without debug assertions.
///
/// # Examples
///
/// ```
/// use heap_pool::{failonfree, unfailonfree};
///
/// let block = heap_pool::malloc(16).unwrap();
///
/// failonfree(block);
/// // ... heap_pool::free(block) here would fail an assertion ...
/// unfailonfree(block);
///
/// // SAFETY: The block came from malloc() and is not used afterwards.
/// unsafe { heap_pool::free(block) };
/// ```
#[cfg_attr(test, mutants::skip)] // Mutations only change which debug builds notice a bug.
pub fn failonfree(block: NonNull<u8>) {
    if !cfg!(debug_assertions) {
        return;
    }

    let addr = block.as_ptr().addr();
    let mut marked = MARKED.lock();

    if marked.contains(&addr) {
        return;
    }

    if let Some(slot) = marked.iter_mut().find(|slot| **slot == 0) {
        *slot = addr;
        MARKED_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Removes a mark placed by [`failonfree()`].
pub fn unfailonfree(block: NonNull<u8>) {
    if !cfg!(debug_assertions) {
        return;
    }

    let addr = block.as_ptr().addr();

    if let Some(slot) = MARKED.lock().iter_mut().find(|slot| **slot == addr) {
        *slot = 0;
        MARKED_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Whether releasing the block at `addr` must fail.
#[inline]
pub(crate) fn is_marked(addr: usize) -> bool {
    cfg!(debug_assertions)
        && MARKED_COUNT.load(Ordering::Relaxed) > 0
        && MARKED.lock().contains(&addr)
}

#[cfg(all(test, debug_assertions))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn fake_block(addr: usize) -> NonNull<u8> {
        NonNull::new(std::ptr::without_provenance_mut(addr)).expect("address is not null")
    }

    #[test]
    fn mark_and_unmark() {
        let block = fake_block(0xF00D_0000);

        assert!(!is_marked(0xF00D_0000));

        failonfree(block);
        assert!(is_marked(0xF00D_0000));

        // Marking twice takes one slot.
        failonfree(block);
        unfailonfree(block);
        assert!(!is_marked(0xF00D_0000));
    }

    #[test]
    fn unmarking_unknown_block_is_harmless() {
        unfailonfree(fake_block(0xBEEF_0000));
        assert!(!is_marked(0xBEEF_0000));
    }
}
