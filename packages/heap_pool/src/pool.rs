use std::fmt;
use std::num::NonZero;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block_table::{BlockTable, BlockTag};
use crate::{
    Arena, DropPolicy, Error, PoolBuilder, PoolInfo, PoolRegistry, Result, Statistics,
    clear_current_if, in_bookkeeping, with_bookkeeping,
};

/// Global counter for generating unique pool IDs.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Uniquely identifies a [`Pool`] for the lifetime of the process.
///
/// IDs are never reused, so an ID held after its pool is destroyed simply stops resolving.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(NonZero<u64>);

impl PoolId {
    fn generate() -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        Self(NonZero::new(id).expect("a 64-bit pool counter cannot wrap around in practice"))
    }

    /// The numeric value of the ID.
    #[must_use]
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Lifecycle of a pool.
///
/// A pool starts out live. Destroying a pool that must keep its remaining blocks makes it
/// delete-pending until the last block is freed. A destroyed pool owns no memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum PoolState {
    Live = 0,
    DeletePending = 1,
    Destroyed = 2,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::DeletePending,
            _ => Self::Destroyed,
        }
    }
}

/// Why a pool is being destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DestroyReason {
    /// The [`Pool`] handle was dropped.
    Dropped,

    /// The thread owning the pool exited.
    Reaped,
}

/// The state of a pool shared between its handle, the registry and the tags of its blocks.
///
/// The arena mutex may be held while taking a block table shard lock, never the other way
/// around.
#[derive(Debug)]
pub(crate) struct PoolShared {
    id: PoolId,
    identifier: Option<Box<str>>,
    owner: Option<ThreadId>,
    max_size: usize,
    lazy_delete: bool,
    drop_policy: DropPolicy,

    // PoolState, only ever changed while holding the arena lock.
    state: AtomicU8,

    arena: Mutex<Arena>,
}

impl PoolShared {
    pub(crate) fn new(
        identifier: Option<Box<str>>,
        owner: Option<ThreadId>,
        max_size: usize,
        lazy_delete: bool,
        drop_policy: DropPolicy,
    ) -> Self {
        Self {
            id: PoolId::generate(),
            identifier,
            owner,
            max_size,
            lazy_delete,
            drop_policy,
            state: AtomicU8::new(PoolState::Live as u8),
            arena: Mutex::new(Arena::new(max_size)),
        }
    }

    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    pub(crate) fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.arena.lock().allocated()
    }

    pub(crate) fn info(&self) -> PoolInfo {
        PoolInfo {
            id: self.id,
            identifier: self.identifier.as_deref().map(str::to_owned),
            owner: self.owner,
            maximum: self.max_size,
            allocated: self.allocated(),
            delete_pending: self.state() == PoolState::DeletePending,
        }
    }

    /// Allocates and tags a block. Must be called inside a bookkeeping scope.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        size: usize,
        align: usize,
        zeroed: bool,
        origin: Option<&'static Location<'static>>,
    ) -> Result<NonNull<u8>> {
        debug_assert!(in_bookkeeping());

        let (ptr, grew) = {
            let mut arena = self.arena.lock();

            if self.state() != PoolState::Live {
                return Err(Error::PoolUnavailable { pool: self.id });
            }

            let segments_before = arena.segment_count();

            let ptr = arena.allocate(size, align).ok_or(Error::OutOfMemory {
                requested: size,
                pool: Some(self.id),
            })?;

            // Tagged while the arena is locked so that a concurrent destroy sees the tag.
            BlockTable::global().tag(
                ptr.as_ptr().addr(),
                BlockTag {
                    pool: Arc::clone(self),
                    origin: origin.filter(|_| cfg!(debug_assertions)),
                },
            );

            (ptr, arena.segment_count() > segments_before)
        };

        // Logged without holding the arena lock, as a subscriber may free memory.
        if grew {
            trace!(pool = %self.id, bytes = crate::MIN_HEAP_VIRTUAL_SPACE, "pool segment reserved");
        }

        if zeroed {
            // SAFETY: The block holds at least `size` bytes and nobody else knows about it yet.
            unsafe {
                ptr.write_bytes(0, size);
            }
        }

        Ok(ptr)
    }

    /// Resizes a block of this pool. Must be called inside a bookkeeping scope.
    ///
    /// On failure, the original block is untouched.
    pub(crate) fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        debug_assert!(in_bookkeeping());

        let mut arena = self.arena.lock();

        let resized = arena.resize(ptr, new_size).ok_or(Error::OutOfMemory {
            requested: new_size,
            pool: Some(self.id),
        })?;

        if resized.moved {
            BlockTable::global().retag(ptr.as_ptr().addr(), resized.ptr.as_ptr().addr());
        }

        Ok(resized.ptr)
    }

    /// Releases a block that has already been untagged. Must be called inside a bookkeeping
    /// scope.
    ///
    /// If this was the last block of a delete-pending pool, the pool is destroyed.
    pub(crate) fn release_untagged(self: &Arc<Self>, ptr: NonNull<u8>) {
        debug_assert!(in_bookkeeping());

        let teardown = {
            let mut arena = self.arena.lock();

            let released = arena.release(ptr);
            debug_assert!(
                released.is_some() || self.state() == PoolState::Destroyed,
                "block at {ptr:p} is not live in {}; double free?",
                self.id
            );

            (self.state() == PoolState::DeletePending && arena.live_count() == 0)
                .then(|| self.tear_down(&mut arena))
        };

        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
    }

    /// Usable size of a live block of this pool.
    pub(crate) fn block_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.arena.lock().block_size(ptr)
    }

    /// Whether `addr` falls anywhere within memory held by this pool.
    pub(crate) fn holds_address(&self, addr: usize) -> bool {
        self.arena.lock().contains(addr)
    }

    pub(crate) fn statistics(&self) -> Statistics {
        self.arena.lock().statistics()
    }

    pub(crate) fn trim(&self) -> usize {
        let released = self.arena.lock().trim();

        if released > 0 {
            trace!(pool = %self.id, bytes = released, "pool segments returned to the system");
        }

        released
    }

    /// Starts destroying the pool. Must be called inside a bookkeeping scope.
    ///
    /// A pool that must keep its remaining blocks (lazy deletion or
    /// [`DropPolicy::MustNotReleaseBlocks`]) becomes delete-pending instead and is destroyed when
    /// its last block is freed.
    ///
    /// # Panics
    ///
    /// Panics if the handle of a [`DropPolicy::MustNotReleaseBlocks`] pool without lazy deletion
    /// is dropped while blocks are still live. The pool remains delete-pending.
    pub(crate) fn destroy(self: &Arc<Self>, reason: DestroyReason) {
        debug_assert!(in_bookkeeping());

        // Decided and carried out under one lock, so no allocation can slip in between.
        let outcome = {
            let mut arena = self.arena.lock();

            if self.state() != PoolState::Live {
                return;
            }

            let live = arena.live_count();
            let keeps_blocks =
                self.lazy_delete || self.drop_policy == DropPolicy::MustNotReleaseBlocks;

            if live > 0 && keeps_blocks {
                self.set_state(PoolState::DeletePending);
                DestroyOutcome::Deferred { live }
            } else {
                DestroyOutcome::TornDown(self.tear_down(&mut arena))
            }
        };

        let live = match outcome {
            DestroyOutcome::TornDown(teardown) => {
                self.finish_teardown(teardown);
                return;
            }
            DestroyOutcome::Deferred { live } => live,
        };

        clear_current_if(self.id);

        debug!(
            pool = %self.id,
            identifier = self.identifier().unwrap_or_default(),
            live_blocks = live,
            "pool deletion deferred until its remaining blocks are freed"
        );

        // If we are already panicking, we do not want to panic again because that would
        // obscure the original panic.
        if !self.lazy_delete && reason == DestroyReason::Dropped && !thread::panicking() {
            panic!(
                "dropped {} with {live} live blocks - this is forbidden by DropPolicy::MustNotReleaseBlocks",
                self.id
            );
        }
    }

    /// Marks the pool destroyed and releases all of its memory, invalidating live blocks.
    ///
    /// The caller holds the arena lock from the moment it decided to destroy the pool.
    fn tear_down(&self, arena: &mut Arena) -> Teardown {
        self.set_state(PoolState::Destroyed);

        let table = BlockTable::global();
        let tags = arena
            .live_addresses()
            .into_iter()
            .filter_map(|addr| table.untag(addr))
            .collect();

        let leaked = arena.live_count();
        arena.release_all();

        Teardown { tags, leaked }
    }

    /// Completes a teardown once the arena lock has been released.
    fn finish_teardown(&self, teardown: Teardown) {
        // The tags refer back to us, so they are dropped only after the arena lock is released.
        drop(teardown.tags);

        clear_current_if(self.id);
        PoolRegistry::global().unregister(self.id);

        debug!(
            pool = %self.id,
            identifier = self.identifier().unwrap_or_default(),
            leaked_blocks = teardown.leaked,
            "pool destroyed"
        );
    }
}

enum DestroyOutcome {
    Deferred { live: usize },
    TornDown(Teardown),
}

/// What is left to do after a pool has released its memory.
struct Teardown {
    tags: Vec<BlockTag>,
    leaked: usize,
}

/// An independently managed heap with its own budget.
///
/// Blocks are obtained from a pool either directly through its methods, through the
/// [`malloc_in()`][crate::malloc_in] family of functions or, while the pool is the
/// [current pool][crate::PoolHold] of a thread, through any unqualified allocation on that
/// thread. Any block may be freed from any thread via [`free()`][crate::free]; the owning pool
/// is recovered from the block address.
///
/// Dropping the handle destroys the pool. By default this releases all of its memory, including
/// blocks that were never freed. See [`PoolBuilder::lazy_deleted()`] and [`DropPolicy`] for
/// ways to keep such blocks alive until they are freed.
///
/// # Examples
///
/// ```
/// use heap_pool::Pool;
///
/// let pool = Pool::builder().max_size(4096).identifier("example").build();
///
/// let block = pool.allocate(1024).expect("pool has room for 1024 bytes");
/// assert_eq!(pool.size(), 1024);
///
/// // SAFETY: The block came from this pool and is not used afterwards.
/// unsafe { pool.release(block) };
/// assert_eq!(pool.size(), 0);
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). Allocations from multiple threads are
/// serialized by an internal lock.
#[derive(Debug)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Creates a builder for configuring and constructing a [`Pool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// The unique ID of the pool.
    #[must_use]
    #[inline]
    pub fn id(&self) -> PoolId {
        self.shared.id
    }

    /// The human-readable identifier given to the pool at creation, if any.
    #[must_use]
    #[inline]
    pub fn identifier(&self) -> Option<&str> {
        self.shared.identifier()
    }

    /// The thread that owns the pool, if it was created with
    /// [`owned_by_current_thread()`][PoolBuilder::owned_by_current_thread].
    #[must_use]
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        self.shared.owner
    }

    /// The budget of the pool in bytes.
    #[must_use]
    #[inline]
    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    /// The number of bytes currently allocated from the pool.
    ///
    /// This is the sum of the usable sizes of all live blocks. The per-block
    /// [overhead][crate::BLOCK_OVERHEAD] charged against the budget is not included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.allocated()
    }

    /// Whether the owning thread has exited and the pool is waiting for its remaining blocks to
    /// be freed before it is destroyed.
    #[must_use]
    pub fn is_delete_pending(&self) -> bool {
        self.shared.state() == PoolState::DeletePending
    }

    /// Allocates a block of at least `size` bytes aligned to [`MIN_ALIGN`][crate::MIN_ALIGN].
    ///
    /// Returns `None` if the block would take the pool over its budget, if the system cannot
    /// provide the memory or if the pool is delete-pending.
    #[must_use]
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_with(size, 1, false, Location::caller())
    }

    /// Allocates a block of at least `size` bytes aligned to at least `align` bytes.
    ///
    /// Returns `None` if `align` is not a power of two, if the block would take the pool over
    /// its budget, if the system cannot provide the memory or if the pool is delete-pending.
    #[must_use]
    #[track_caller]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }

        self.allocate_with(size, align, false, Location::caller())
    }

    /// Allocates a zero-initialized block for `count` elements of `size` bytes each.
    ///
    /// Returns `None` if `count * size` overflows or the block cannot be allocated.
    #[must_use]
    #[track_caller]
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.allocate_with(count.checked_mul(size)?, 1, true, Location::caller())
    }

    fn allocate_with(
        &self,
        size: usize,
        align: usize,
        zeroed: bool,
        origin: &'static Location<'static>,
    ) -> Option<NonNull<u8>> {
        with_bookkeeping(|| self.shared.allocate(size, align, zeroed, Some(origin))).ok()
    }

    /// Resizes a block of this pool, preserving its content up to the smaller of the two sizes.
    ///
    /// The block is resized in place if possible and moved otherwise. Returns `None` if the new
    /// size would take the pool over its budget, in which case the original block remains valid.
    ///
    /// # Safety
    ///
    /// `block` must be a live block allocated from this pool. On success, the caller must use
    /// the returned pointer instead of `block` from then on.
    #[must_use]
    pub unsafe fn resize(&self, block: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        with_bookkeeping(|| {
            debug_assert_eq!(
                BlockTable::global()
                    .resolve(block.as_ptr().addr())
                    .map(|owner| owner.id()),
                Some(self.id()),
                "block at {block:p} does not belong to {}",
                self.id()
            );

            self.shared.resize(block, new_size).ok()
        })
    }

    /// Releases a block of this pool.
    ///
    /// # Safety
    ///
    /// `block` must be a live block allocated from this pool and must not be used afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `block` is known to belong to a different pool.
    pub unsafe fn release(&self, block: NonNull<u8>) {
        with_bookkeeping(|| {
            let table = BlockTable::global();
            let addr = block.as_ptr().addr();

            let owner = table.resolve(addr).map(|owner| owner.id());
            assert!(
                owner.is_none_or(|owner| owner == self.id()),
                "block at {block:p} belongs to {} and cannot be released into {}",
                owner.map_or_else(String::new, |owner| owner.to_string()),
                self.id()
            );

            let tag = table.untag(addr);
            self.shared.release_untagged(block);
            drop(tag);
        });
    }

    /// Whether `block` is a live block allocated from this pool.
    #[must_use]
    pub fn owns(&self, block: NonNull<u8>) -> bool {
        with_bookkeeping(|| self.shared.block_size(block).is_some())
    }

    /// Usage statistics of the pool.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        with_bookkeeping(|| self.shared.statistics())
    }

    /// Returns wholly unused memory of the pool to the system, returning the number of bytes
    /// released.
    pub fn trim(&self) -> usize {
        with_bookkeeping(|| self.shared.trim())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        with_bookkeeping(|| self.shared.destroy(DestroyReason::Dropped));
    }
}
