//! Recovers the owning pool of a block from its address alone.
//!
//! Every block issued by a pool is recorded here together with a reference to its pool. Blocks
//! that are not recorded were not issued by any live pool and belong to the system heap.
//!
//! The table is sharded by address to keep lock contention low when many threads allocate and
//! free concurrently. Each shard is created lazily so that the table can live in a `static`
//! without any runtime initialization on the allocation path. A global counter of tagged blocks
//! lets the free path skip the table entirely while no pool has live blocks.
//!
//! Callers must be inside a bookkeeping scope, as the shard maps allocate.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use foldhash::fast::FixedState;
use parking_lot::Mutex;

use crate::{PoolId, PoolShared, in_bookkeeping};

const SHARD_COUNT: usize = 64;

type ShardMap = HashMap<usize, BlockTag, FixedState>;
type Shard = Mutex<Option<ShardMap>>;

static TABLE: BlockTable = BlockTable::new();

thread_local! {
    // No destructor and a const initializer, so this remains accessible during thread teardown.
    static IN_TABLE_OPERATION: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread holds a shard lock.
///
/// Memory released in that state belongs to the shard maps themselves and must go straight
/// back to the system heap without consulting the table.
#[inline]
pub(crate) fn in_table_operation() -> bool {
    IN_TABLE_OPERATION.try_with(Cell::get).unwrap_or(true)
}

/// What we remember about every block issued by a pool.
#[derive(Debug)]
pub(crate) struct BlockTag {
    pub(crate) pool: Arc<PoolShared>,

    /// Where the block was requested from, for leak reports.
    pub(crate) origin: Option<&'static Location<'static>>,
}

pub(crate) struct BlockTable {
    shards: [Shard; SHARD_COUNT],

    /// Number of entries across all shards.
    tagged: AtomicUsize,
}

impl BlockTable {
    const fn new() -> Self {
        Self {
            shards: [const { Mutex::new(None) }; SHARD_COUNT],
            tagged: AtomicUsize::new(0),
        }
    }

    pub(crate) fn global() -> &'static Self {
        &TABLE
    }

    /// Records that the block at `addr` was issued by `tag.pool`.
    pub(crate) fn tag(&self, addr: usize, tag: BlockTag) {
        debug_assert!(in_bookkeeping());

        let replaced = self.with_shard(addr, |shard| {
            shard
                .get_or_insert_with(|| HashMap::with_hasher(FixedState::default()))
                .insert(addr, tag)
        });

        debug_assert!(
            replaced.is_none(),
            "block at {addr:#x} was tagged twice; a pool must have issued overlapping blocks"
        );

        if replaced.is_none() {
            self.tagged.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The pool that issued the block at `addr`, if any.
    pub(crate) fn resolve(&self, addr: usize) -> Option<Arc<PoolShared>> {
        debug_assert!(in_bookkeeping());

        if self.is_empty() {
            return None;
        }

        self.with_shard(addr, |shard| {
            shard
                .as_ref()?
                .get(&addr)
                .map(|tag| Arc::clone(&tag.pool))
        })
    }

    /// Forgets the block at `addr`, returning what we knew about it.
    ///
    /// The returned tag should be dropped by the caller after any pool locks are released.
    pub(crate) fn untag(&self, addr: usize) -> Option<BlockTag> {
        debug_assert!(in_bookkeeping());

        if self.is_empty() {
            return None;
        }

        let removed = self.with_shard(addr, |shard| shard.as_mut()?.remove(&addr));

        if removed.is_some() {
            self.tagged.fetch_sub(1, Ordering::Relaxed);
        }

        removed
    }

    /// Moves the record of a block to a new address after the block was relocated.
    pub(crate) fn retag(&self, from: usize, to: usize) {
        if let Some(tag) = self.untag(from) {
            self.tag(to, tag);
        }
    }

    /// Whether no pool currently has any live blocks.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.tagged.load(Ordering::Relaxed) == 0
    }

    /// Every tagged block with its pool and origin, in no particular order.
    ///
    /// Block sizes are not known here; the caller asks the pools.
    pub(crate) fn snapshot(
        &self,
    ) -> Vec<(usize, Arc<PoolShared>, Option<&'static Location<'static>>)> {
        debug_assert!(in_bookkeeping());

        let mut blocks = Vec::new();

        for shard in &self.shards {
            let _operation = TableOperation::enter();

            if let Some(map) = shard.lock().as_ref() {
                blocks.extend(
                    map.iter()
                        .map(|(addr, tag)| (*addr, Arc::clone(&tag.pool), tag.origin)),
                );
            }
        }

        blocks
    }

    fn with_shard<R>(&self, addr: usize, f: impl FnOnce(&mut Option<ShardMap>) -> R) -> R {
        // Blocks are at least 16-byte aligned, so the low bits carry no information.
        let index = ((addr >> 4) ^ (addr >> 12)) % SHARD_COUNT;

        #[expect(
            clippy::indexing_slicing,
            reason = "the modulo keeps the index within the array"
        )]
        let shard = &self.shards[index];

        // Entered before locking and left after unlocking.
        let _operation = TableOperation::enter();
        f(&mut shard.lock())
    }
}

/// Marks the current thread as holding a shard lock until dropped.
struct TableOperation {
    was_active: bool,
}

impl TableOperation {
    fn enter() -> Self {
        Self {
            was_active: IN_TABLE_OPERATION
                .try_with(|flag| flag.replace(true))
                .unwrap_or(true),
        }
    }
}

impl Drop for TableOperation {
    fn drop(&mut self) {
        _ = IN_TABLE_OPERATION.try_with(|flag| flag.set(self.was_active));
    }
}

/// A live block issued by a pool, as reported by [`leaked_blocks()`][crate::leaked_blocks].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct BlockInfo {
    /// Address of the first byte of the block.
    pub address: usize,

    /// Usable size of the block in bytes.
    pub size: usize,

    /// The pool that issued the block.
    pub pool: PoolId,

    /// The source location that requested the block, if it came through a tracked entry point.
    pub origin: Option<&'static Location<'static>>,
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes at {:#x} in {}",
            self.size, self.address, self.pool
        )?;

        if let Some(origin) = self.origin {
            write!(f, " allocated at {origin}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{Pool, with_bookkeeping};

    // Addresses far away from anything a real allocator would hand out, distinct per test.
    const FAKE_BASE: usize = 0x10;

    fn tag_for(pool: &Pool) -> BlockTag {
        BlockTag {
            pool: Arc::clone(pool.shared()),
            origin: Some(Location::caller()),
        }
    }

    #[test]
    fn tag_resolve_untag() {
        let pool = Pool::builder().build();
        let addr = FAKE_BASE;

        with_bookkeeping(|| {
            let table = BlockTable::global();

            table.tag(addr, tag_for(&pool));
            assert!(!table.is_empty());

            let owner = table.resolve(addr).expect("block was tagged");
            assert_eq!(owner.id(), pool.id());

            let tag = table.untag(addr).expect("block was tagged");
            assert_eq!(tag.pool.id(), pool.id());
            assert!(tag.origin.is_some());

            assert!(table.resolve(addr).is_none());
            assert!(table.untag(addr).is_none());
        });
    }

    #[test]
    fn retag_moves_record() {
        let pool = Pool::builder().build();
        let from = FAKE_BASE + 0x100;
        let to = FAKE_BASE + 0x200;

        with_bookkeeping(|| {
            let table = BlockTable::global();

            table.tag(from, tag_for(&pool));
            table.retag(from, to);

            assert!(table.resolve(from).is_none());
            assert_eq!(
                table.resolve(to).map(|owner| owner.id()),
                Some(pool.id())
            );

            table.untag(to);
        });
    }

    #[test]
    fn unknown_address_is_not_resolved() {
        with_bookkeeping(|| {
            let local = 0_u64;
            let addr = (&raw const local).addr();

            assert!(BlockTable::global().resolve(addr).is_none());
        });
    }

    #[test]
    fn snapshot_contains_tagged_blocks() {
        let pool = Pool::builder().build();
        let addrs = [FAKE_BASE + 0x300, FAKE_BASE + 0x310, FAKE_BASE + 0x1300];

        with_bookkeeping(|| {
            let table = BlockTable::global();

            for addr in addrs {
                table.tag(addr, tag_for(&pool));
            }

            // Other tests may be tagging blocks concurrently, so only look at our own pool.
            let mut ours: Vec<usize> = table
                .snapshot()
                .into_iter()
                .filter(|(_, owner, _)| owner.id() == pool.id())
                .map(|(addr, _, _)| addr)
                .collect();
            ours.sort_unstable();

            assert_eq!(ours, addrs);

            for addr in addrs {
                table.untag(addr);
            }
        });
    }

    #[test]
    fn table_operation_flag_is_scoped() {
        assert!(!in_table_operation());

        with_bookkeeping(|| {
            let seen = BlockTable::global().with_shard(FAKE_BASE + 0x400, |_| in_table_operation());
            assert!(seen);
        });

        assert!(!in_table_operation());
    }

    #[test]
    fn block_info_display() {
        let pool = Pool::builder().build();

        let info = BlockInfo {
            address: 0x1000,
            size: 32,
            pool: pool.id(),
            origin: None,
        };

        assert_eq!(info.to_string(), format!("32 bytes at 0x1000 in {}", pool.id()));
    }
}
