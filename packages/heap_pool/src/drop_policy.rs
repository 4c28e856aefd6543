/// Determines what happens to live blocks when a [`Pool`][crate::Pool] is destroyed.
///
/// By default, the pool releases its memory, including any blocks that were never freed.
/// Pools created with [`lazy_deleted()`][crate::PoolBuilder::lazy_deleted] never release live
/// blocks; they wait for the last one to be freed instead, whatever the drop policy.
///
/// # Examples
///
/// ```
/// use heap_pool::{DropPolicy, Pool};
///
/// // The drop policy is set at pool creation time.
/// let pool = Pool::builder()
///     .drop_policy(DropPolicy::MustNotReleaseBlocks)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases all of its memory when destroyed, leaving any live blocks dangling.
    /// This is the default.
    #[default]
    MayReleaseBlocks,

    /// Dropping the pool handle panics if the pool still has live blocks.
    ///
    /// This is useful when unsafe code holds pointers into the pool and the owner wants to be
    /// told about a destruction order mistake instead of silently invalidating them. When the
    /// pool is destroyed because its owning thread exits, a panic is not an option, so the pool
    /// is marked delete-pending and lives on until its last block is freed.
    MustNotReleaseBlocks,
}
