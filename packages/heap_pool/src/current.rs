//! The per-thread current pool.
//!
//! Each thread has a register naming the pool that receives its unqualified allocations. An
//! empty register means the system heap. The register holds a pool ID rather than a reference,
//! so a pool that is destroyed while current simply stops receiving allocations.
//!
//! Next to the register, each thread caches a weak reference to the pool it last resolved, so
//! that routing an allocation does not need the process-wide registry.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::{Pool, PoolId, PoolRegistry, PoolShared, PoolState, in_bookkeeping, with_bookkeeping};

thread_local! {
    // No destructor and a const initializer, so this remains accessible during thread teardown.
    static CURRENT_POOL: Cell<Option<PoolId>> = const { Cell::new(None) };

    // Only touched inside bookkeeping scopes, as registering its destructor may allocate.
    static RESOLVED_POOL: RefCell<Weak<PoolShared>> = const { RefCell::new(Weak::new()) };
}

/// The pool that unqualified allocations on the current thread go to, or `None` for the system
/// heap.
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, PoolHold, current_pool};
///
/// let pool = Pool::builder().build();
/// assert_eq!(current_pool(), None);
///
/// let _hold = PoolHold::new(Some(&pool));
/// assert_eq!(current_pool(), Some(pool.id()));
/// ```
#[must_use]
#[inline]
pub fn current_pool() -> Option<PoolId> {
    CURRENT_POOL.try_with(Cell::get).ok().flatten()
}

/// Makes `pool` the current pool of this thread (or the system heap if `None`), returning the
/// previously current pool.
///
/// Prefer [`PoolHold`], which restores the previous pool automatically.
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, set_current_pool};
///
/// let pool = Pool::builder().build();
///
/// let previous = set_current_pool(Some(&pool));
/// // ... unqualified allocations on this thread now come from `pool` ...
/// set_current_pool(None);
///
/// assert_eq!(previous, None);
/// ```
#[expect(
    clippy::must_use_candidate,
    reason = "the previous pool is informational, ignoring it is normal"
)]
pub fn set_current_pool(pool: Option<&Pool>) -> Option<PoolId> {
    if let Some(pool) = pool {
        remember(pool.shared());
    }

    replace_current(pool.map(Pool::id))
}

pub(crate) fn replace_current(pool: Option<PoolId>) -> Option<PoolId> {
    CURRENT_POOL
        .try_with(|current| current.replace(pool))
        .ok()
        .flatten()
}

/// Empties the register of this thread if it names `pool`.
pub(crate) fn clear_current_if(pool: PoolId) {
    _ = CURRENT_POOL.try_with(|current| {
        if current.get() == Some(pool) {
            current.set(None);
        }
    });
}

/// Where an allocation is routed.
#[derive(Debug)]
pub(crate) enum Target {
    Pool(Arc<PoolShared>),
    SystemHeap,

    /// The register names a pool that no longer accepts allocations.
    Unavailable(PoolId),
}

/// Where unqualified allocations on this thread go right now.
///
/// While the thread is doing internal bookkeeping, this is always the system heap.
pub(crate) fn current_target() -> Target {
    if in_bookkeeping() {
        return Target::SystemHeap;
    }

    let Some(id) = current_pool() else {
        return Target::SystemHeap;
    };

    match resolve(id) {
        Some(pool) if pool.state() == PoolState::Live => Target::Pool(pool),
        _ => Target::Unavailable(id),
    }
}

/// The pool with the given ID, from the cache of this thread if possible.
fn resolve(id: PoolId) -> Option<Arc<PoolShared>> {
    with_bookkeeping(|| {
        let cached = RESOLVED_POOL
            .try_with(|resolved| resolved.borrow().upgrade())
            .ok()
            .flatten()
            .filter(|pool| pool.id() == id);

        if cached.is_some() {
            return cached;
        }

        let pool = PoolRegistry::global().get(id)?;
        remember(&pool);
        Some(pool)
    })
}

/// Caches `pool` as the most recently resolved pool of this thread.
fn remember(pool: &Arc<PoolShared>) {
    with_bookkeeping(|| {
        let previous = RESOLVED_POOL
            .try_with(|resolved| resolved.replace(Arc::downgrade(pool)))
            .ok();

        // Dropped outside the borrow, as this may release the last reference.
        drop(previous);
    });
}

/// Makes a pool current on this thread until dropped, then restores the previously current pool.
///
/// Holds nest. Each hold restores exactly what was current when it was created, also when the
/// scope is left by unwinding.
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, PoolHold, current_pool};
///
/// let outer = Pool::builder().build();
/// let inner = Pool::builder().build();
///
/// let _outer_hold = PoolHold::new(Some(&outer));
///
/// {
///     let _inner_hold = PoolHold::new(Some(&inner));
///     assert_eq!(current_pool(), Some(inner.id()));
///
///     {
///         // Temporarily back to the system heap.
///         let _system = PoolHold::new(None);
///         assert_eq!(current_pool(), None);
///     }
///
///     assert_eq!(current_pool(), Some(inner.id()));
/// }
///
/// assert_eq!(current_pool(), Some(outer.id()));
/// ```
///
/// # Thread safety
///
/// A hold is bound to the thread whose register it changed and is neither [`Send`] nor
/// [`Sync`].
#[derive(Debug)]
#[must_use = "the previous pool is restored as soon as the hold is dropped"]
pub struct PoolHold<'a> {
    previous: Option<PoolId>,

    _pool: PhantomData<&'a Pool>,
    _single_threaded: PhantomData<*const ()>,
}

impl<'a> PoolHold<'a> {
    /// Makes `pool` current on this thread, or the system heap if `None`.
    pub fn new(pool: Option<&'a Pool>) -> Self {
        Self {
            previous: set_current_pool(pool),
            _pool: PhantomData,
            _single_threaded: PhantomData,
        }
    }

    /// The pool that was current when the hold was created and will be restored when it is
    /// dropped.
    #[must_use]
    #[inline]
    pub fn previous(&self) -> Option<PoolId> {
        self.previous
    }
}

impl Drop for PoolHold<'_> {
    fn drop(&mut self) {
        replace_current(self.previous);
    }
}
