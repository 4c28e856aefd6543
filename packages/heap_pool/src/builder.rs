use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::{
    DropPolicy, Pool, PoolRegistry, PoolShared, register_thread_pools_reaper, replace_current,
    with_bookkeeping,
};

/// Builder for creating an instance of [`Pool`].
///
/// All settings are optional. By default, a pool has an unlimited budget, no identifier and no
/// owning thread, and releases all of its memory when dropped.
///
/// # Examples
///
/// ```
/// use heap_pool::Pool;
///
/// let pool = Pool::builder()
///     .max_size(16 * 1024 * 1024)
///     .identifier("image decoder")
///     .build();
///
/// assert_eq!(pool.identifier(), Some("image decoder"));
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder {
    max_size: usize,
    identifier: Option<String>,
    owned_by_current_thread: bool,
    lazy_deleted: bool,
    drop_policy: DropPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl PoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            max_size: usize::MAX,
            identifier: None,
            owned_by_current_thread: false,
            lazy_deleted: false,
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the budget of the pool in bytes.
    ///
    /// The budget covers the usable size of every live block plus a fixed
    /// [per-block overhead][crate::BLOCK_OVERHEAD]. Requests that would exceed it fail.
    /// The default is unlimited.
    ///
    /// # Examples
    ///
    /// ```
    /// use heap_pool::Pool;
    ///
    /// let pool = Pool::builder().max_size(4096).build();
    ///
    /// assert!(pool.allocate(1024).is_some());
    /// assert!(pool.allocate(8192).is_none());
    /// ```
    #[inline]
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    /// Sets a human-readable name for the pool, reported in statistics and logs.
    #[inline]
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Makes the pool owned by the thread that calls [`build()`][Self::build].
    ///
    /// The pool becomes the current pool of that thread as soon as it is built. When the thread
    /// exits, the pool is destroyed just as if its handle had been dropped, except that a pool
    /// with [`DropPolicy::MustNotReleaseBlocks`] becomes delete-pending instead of panicking.
    ///
    /// # Examples
    ///
    /// ```
    /// use heap_pool::{Pool, current_pool};
    ///
    /// std::thread::spawn(|| {
    ///     let pool = Pool::builder().owned_by_current_thread().build();
    ///
    ///     assert_eq!(pool.owner(), Some(std::thread::current().id()));
    ///     assert_eq!(current_pool(), Some(pool.id()));
    /// })
    /// .join()
    /// .unwrap();
    /// ```
    #[inline]
    pub fn owned_by_current_thread(mut self) -> Self {
        self.owned_by_current_thread = true;
        self
    }

    /// Sets whether destroying the pool waits for its remaining blocks to be freed.
    ///
    /// A lazily deleted pool that still has live blocks when destroyed becomes delete-pending:
    /// it accepts no new allocations but its blocks stay valid. The pool is destroyed when its
    /// last block is freed, on whichever thread frees it.
    #[inline]
    pub fn lazy_deleted(mut self, lazy: bool) -> Self {
        self.lazy_deleted = lazy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how to treat live blocks
    /// when the pool is destroyed.
    ///
    /// # Examples
    ///
    /// ```
    /// use heap_pool::{DropPolicy, Pool};
    ///
    /// let pool = Pool::builder()
    ///     .drop_policy(DropPolicy::MustNotReleaseBlocks)
    ///     .build();
    /// ```
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration and registers it.
    ///
    /// No memory is reserved until the first allocation.
    #[must_use]
    pub fn build(self) -> Pool {
        with_bookkeeping(|| {
            let owner = self
                .owned_by_current_thread
                .then(|| thread::current().id());

            let shared = Arc::new(PoolShared::new(
                self.identifier.map(String::into_boxed_str),
                owner,
                self.max_size,
                self.lazy_deleted,
                self.drop_policy,
            ));

            PoolRegistry::global().register(Arc::clone(&shared));

            if owner.is_some() {
                register_thread_pools_reaper();
                replace_current(Some(shared.id()));
            }

            debug!(
                pool = %shared.id(),
                identifier = shared.identifier().unwrap_or_default(),
                max_size = self.max_size,
                owned = owner.is_some(),
                lazy_deleted = self.lazy_deleted,
                "pool created"
            );

            Pool::from_shared(shared)
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{all_pools, current_pool};

    assert_impl_all!(PoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolBuilder::new();

        assert_eq!(builder.max_size, usize::MAX);
        assert!(builder.identifier.is_none());
        assert!(!builder.owned_by_current_thread);
        assert!(!builder.lazy_deleted);
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn setters_store_values() {
        let builder = PoolBuilder::new()
            .max_size(1234)
            .identifier("named")
            .owned_by_current_thread()
            .lazy_deleted(true)
            .drop_policy(DropPolicy::MustNotReleaseBlocks);

        assert_eq!(builder.max_size, 1234);
        assert_eq!(builder.identifier.as_deref(), Some("named"));
        assert!(builder.owned_by_current_thread);
        assert!(builder.lazy_deleted);
        assert_eq!(builder.drop_policy, DropPolicy::MustNotReleaseBlocks);
    }

    #[test]
    fn build_registers_pool() {
        let pool = PoolBuilder::new().max_size(999).identifier("registered").build();

        let info = all_pools()
            .into_iter()
            .find(|info| info.id == pool.id())
            .expect("pool is registered");

        assert_eq!(info.identifier.as_deref(), Some("registered"));
        assert_eq!(info.maximum, 999);
        assert_eq!(info.allocated, 0);
        assert_eq!(info.owner, None);
        assert!(!info.delete_pending);
    }

    #[test]
    fn unowned_pool_does_not_become_current() {
        let _pool = PoolBuilder::new().build();

        assert_eq!(current_pool(), None);
    }

    #[test]
    fn owned_pool_becomes_current_on_owner_thread() {
        testing::with_watchdog(|| {
            std::thread::spawn(|| {
                let pool = PoolBuilder::new().owned_by_current_thread().build();

                assert_eq!(pool.owner(), Some(thread::current().id()));
                assert_eq!(current_pool(), Some(pool.id()));

                drop(pool);
                assert_eq!(current_pool(), None);
            })
            .join()
            .expect("thread does not panic");
        });
    }
}
