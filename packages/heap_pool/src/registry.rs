//! The process-wide list of pools.
//!
//! Every pool is registered from creation until it is destroyed, including while it is
//! delete-pending. The registry lets the current-pool register refer to pools by ID, provides
//! the statistics listing and destroys pools owned by a thread when that thread exits.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::RwLock;
use tracing::debug;

use crate::pool::DestroyReason;
use crate::{PoolId, PoolShared, PoolState, with_bookkeeping};

static REGISTRY: PoolRegistry = PoolRegistry::new();

pub(crate) struct PoolRegistry {
    pools: RwLock<Vec<Arc<PoolShared>>>,
}

impl PoolRegistry {
    const fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn global() -> &'static Self {
        &REGISTRY
    }

    pub(crate) fn register(&self, pool: Arc<PoolShared>) {
        self.pools.write().push(pool);
    }

    pub(crate) fn unregister(&self, id: PoolId) {
        let removed = {
            let mut pools = self.pools.write();

            pools
                .iter()
                .position(|pool| pool.id() == id)
                .map(|index| pools.swap_remove(index))
        };

        // Dropped after the lock is released, as this may be the last reference.
        drop(removed);
    }

    /// The registered pool with the given ID, if it has not been destroyed.
    pub(crate) fn get(&self, id: PoolId) -> Option<Arc<PoolShared>> {
        self.pools
            .read()
            .iter()
            .find(|pool| pool.id() == id)
            .map(Arc::clone)
    }

    /// All registered pools, including delete-pending ones.
    pub(crate) fn pools(&self) -> Vec<Arc<PoolShared>> {
        self.pools.read().clone()
    }

    /// The registered pool whose memory contains `addr`, live block or not.
    pub(crate) fn pool_holding(&self, addr: usize) -> Option<PoolId> {
        self.pools()
            .into_iter()
            .find(|pool| pool.holds_address(addr))
            .map(|pool| pool.id())
    }

    /// Destroys every live pool owned by the given thread.
    pub(crate) fn reap_thread_pools(&self, thread: ThreadId) {
        let owned: Vec<_> = self
            .pools()
            .into_iter()
            .filter(|pool| pool.owner() == Some(thread) && pool.state() == PoolState::Live)
            .collect();

        if owned.is_empty() {
            return;
        }

        debug!(
            thread = ?thread,
            pools = owned.len(),
            "destroying pools owned by exiting thread"
        );

        for pool in owned {
            pool.destroy(DestroyReason::Reaped);
        }
    }
}

/// Destroys the pools owned by a thread when the thread exits.
struct ThreadPoolsReaper {
    thread: ThreadId,
}

impl Drop for ThreadPoolsReaper {
    #[cfg_attr(test, mutants::skip)] // Only observable after the owning thread has exited.
    fn drop(&mut self) {
        with_bookkeeping(|| REGISTRY.reap_thread_pools(self.thread));
    }
}

thread_local! {
    static THREAD_POOLS_REAPER: ThreadPoolsReaper = ThreadPoolsReaper {
        thread: thread::current().id(),
    };
}

/// Ensures that the pools owned by the current thread are destroyed when it exits.
pub(crate) fn register_thread_pools_reaper() {
    // Fails only if the thread is already being torn down, in which case the pool simply
    // outlives its owner.
    _ = THREAD_POOLS_REAPER.try_with(|_| {});
}

/// Describes a registered pool, as reported by [`all_pools()`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolInfo {
    /// The unique ID of the pool.
    pub id: PoolId,

    /// The human-readable identifier given to the pool at creation, if any.
    pub identifier: Option<String>,

    /// The owning thread, if the pool is owned by a thread.
    pub owner: Option<ThreadId>,

    /// The budget of the pool in bytes.
    pub maximum: usize,

    /// The number of bytes currently allocated from the pool.
    pub allocated: usize,

    /// Whether the pool has been destroyed and only waits for its remaining blocks to be freed.
    pub delete_pending: bool,
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;

        if let Some(identifier) = &self.identifier {
            write!(f, " '{identifier}'")?;
        }

        if self.maximum == usize::MAX {
            write!(f, ": {} bytes allocated", self.allocated)?;
        } else {
            write!(f, ": {} of {} bytes allocated", self.allocated, self.maximum)?;
        }

        if let Some(owner) = self.owner {
            write!(f, ", owned by {owner:?}")?;
        }

        if self.delete_pending {
            write!(f, ", delete pending")?;
        }

        Ok(())
    }
}

/// Lists every pool that currently exists, including pools waiting for their remaining blocks
/// to be freed. The system heap is not included.
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, all_pools};
///
/// let pool = Pool::builder().identifier("listed").build();
///
/// let info = all_pools()
///     .into_iter()
///     .find(|info| info.id == pool.id())
///     .unwrap();
///
/// assert_eq!(info.identifier.as_deref(), Some("listed"));
/// assert_eq!(info.allocated, 0);
/// ```
#[must_use]
pub fn all_pools() -> Vec<PoolInfo> {
    with_bookkeeping(|| {
        REGISTRY
            .pools()
            .iter()
            .map(|pool| pool.info())
            .collect()
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::{DropPolicy, Pool, current_pool, free, owner_of};

    fn find(id: PoolId) -> Option<PoolInfo> {
        all_pools().into_iter().find(|info| info.id == id)
    }

    #[test]
    fn pools_are_listed_until_dropped() {
        let pool = Pool::builder().identifier("listed").max_size(8192).build();
        let id = pool.id();

        let block = pool.allocate(100).expect("within budget");

        let info = find(id).expect("pool is registered");
        assert_eq!(info.allocated, 112);
        assert_eq!(info.maximum, 8192);

        // SAFETY: The block came from this pool and is not used afterwards.
        unsafe { pool.release(block) };
        drop(pool);

        assert!(find(id).is_none());
        assert!(with_bookkeeping(|| REGISTRY.get(id)).is_none());
    }

    #[test]
    fn get_resolves_registered_pool() {
        let pool = Pool::builder().build();

        let shared = with_bookkeeping(|| REGISTRY.get(pool.id())).expect("pool is registered");
        assert_eq!(shared.id(), pool.id());
    }

    #[test]
    fn pool_holding_finds_interior_address() {
        let pool = Pool::builder().build();
        let block = pool.allocate(1000).expect("unbounded pool has room");

        let interior = block.as_ptr().addr() + 500;
        assert_eq!(
            with_bookkeeping(|| REGISTRY.pool_holding(interior)),
            Some(pool.id())
        );

        // SAFETY: The block came from this pool and is not used afterwards.
        unsafe { pool.release(block) };
    }

    #[test]
    fn owned_pool_is_destroyed_when_thread_exits() {
        testing::with_watchdog(|| {
            let (pool, addr) = thread::spawn(|| {
                let pool = Pool::builder().owned_by_current_thread().build();

                // The pool is current, so this comes from the pool.
                let block = crate::malloc(64).expect("unbounded pool has room");
                assert_eq!(owner_of(block), Some(pool.id()));

                (pool, block.as_ptr().addr())
            })
            .join()
            .expect("thread does not panic");

            assert!(find(pool.id()).is_none());
            assert_eq!(pool.size(), 0);

            let block = NonNull::new(std::ptr::without_provenance_mut::<u8>(addr))
                .expect("address is not null");
            assert_eq!(owner_of(block), None);

            // Dropping the handle of a reaped pool is a no-op.
            drop(pool);
        });
    }

    #[test]
    fn reaped_pool_must_not_release_waits_for_blocks() {
        testing::with_watchdog(|| {
            let (id, addr) = thread::spawn(|| {
                let pool = Pool::builder()
                    .owned_by_current_thread()
                    .drop_policy(DropPolicy::MustNotReleaseBlocks)
                    .build();

                let block = pool.allocate(64).expect("unbounded pool has room");
                let id = pool.id();

                // Only the thread exit may destroy the pool.
                std::mem::forget(pool);

                (id, block.as_ptr().expose_provenance())
            })
            .join()
            .expect("thread does not panic");

            let info = find(id).expect("pool waits for its remaining block");
            assert!(info.delete_pending);

            let block = NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(addr))
                .expect("address is not null");
            assert_eq!(owner_of(block), Some(id));

            // SAFETY: The block is live and not used afterwards.
            unsafe { free(block) };

            assert!(find(id).is_none());
        });
    }

    #[test]
    fn reaping_other_thread_leaves_our_pools_alone() {
        let ours = Pool::builder().build();

        testing::with_watchdog(|| {
            thread::spawn(|| {
                let _theirs = Pool::builder().owned_by_current_thread().build();
                assert!(current_pool().is_some());
            })
            .join()
            .expect("thread does not panic");
        });

        assert!(find(ours.id()).is_some());
    }

    #[test]
    fn info_display() {
        let pool = Pool::builder().identifier("shown").max_size(4096).build();
        let info = find(pool.id()).expect("pool is registered");

        assert_eq!(
            info.to_string(),
            format!("{} 'shown': 0 of 4096 bytes allocated", pool.id())
        );
    }
}
