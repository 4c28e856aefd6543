use std::alloc::{Layout, handle_alloc_error};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::current::{Target, current_target};
use crate::facade::{allocate_routed, release};
use crate::{Pool, PoolId, Result, owner_of};

/// An owning pointer to a value stored in a pool (or the system heap).
///
/// The value is placed with the same routing as [`malloc()`][crate::malloc]: into the current
/// pool of the creating thread unless a pool is named explicitly. The box may be dropped on any
/// thread and returns its memory to whichever heap it came from.
///
/// Allocation failure is reported the way [`Box`] reports it: [`new()`][Self::new] and
/// [`new_in()`][Self::new_in] call [`handle_alloc_error()`], while
/// [`try_new()`][Self::try_new] and [`try_new_in()`][Self::try_new_in] return an
/// [`Error`][crate::Error].
///
/// # Examples
///
/// ```
/// use heap_pool::{Pool, PoolBox};
///
/// let pool = Pool::builder().max_size(1024).build();
///
/// let small = PoolBox::new_in([0_u8; 100], &pool);
/// assert_eq!(small.owner(), Some(pool.id()));
///
/// // Does not fit into what remains of the budget.
/// assert!(PoolBox::try_new_in([0_u8; 1000], &pool).is_err());
/// ```
pub struct PoolBox<T> {
    ptr: NonNull<T>,

    _owned: PhantomData<T>,
}

impl<T> PoolBox<T> {
    /// Moves `value` into the current pool of this thread, or the system heap if none is current.
    ///
    /// # Panics
    ///
    /// Calls [`handle_alloc_error()`] if the memory cannot be allocated.
    #[must_use]
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::place(value, current_target(), Location::caller())
            .unwrap_or_else(|_| handle_alloc_error(Self::layout()))
    }

    /// Moves `value` into `pool`.
    ///
    /// # Panics
    ///
    /// Calls [`handle_alloc_error()`] if the memory cannot be allocated.
    #[must_use]
    #[track_caller]
    pub fn new_in(value: T, pool: &Pool) -> Self {
        Self::place(value, Target::Pool(Arc::clone(pool.shared())), Location::caller())
            .unwrap_or_else(|_| handle_alloc_error(Self::layout()))
    }

    /// Moves `value` into the current pool of this thread, or the system heap if none is current.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the memory cannot be
    /// allocated and [`Error::PoolUnavailable`][crate::Error::PoolUnavailable] if the current
    /// pool no longer accepts allocations. The value is dropped in either case.
    #[track_caller]
    pub fn try_new(value: T) -> Result<Self> {
        Self::place(value, current_target(), Location::caller())
    }

    /// Moves `value` into `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the pool cannot hold the
    /// value and [`Error::PoolUnavailable`][crate::Error::PoolUnavailable] if the pool no longer
    /// accepts allocations. The value is dropped in either case.
    #[track_caller]
    pub fn try_new_in(value: T, pool: &Pool) -> Result<Self> {
        Self::place(value, Target::Pool(Arc::clone(pool.shared())), Location::caller())
    }

    /// The pool that holds the value, or `None` if it is on the system heap.
    #[must_use]
    pub fn owner(&self) -> Option<PoolId> {
        owner_of(self.ptr.cast())
    }

    /// Moves the value out of the box, releasing its memory.
    #[must_use]
    pub fn into_inner(this: Self) -> T {
        let ptr = this.ptr;
        mem::forget(this);

        // SAFETY: The box owned an initialized value, which we now take over. The box itself is
        // forgotten so the value is not dropped twice.
        let value = unsafe { ptr.read() };

        // SAFETY: The memory came from our routing and nothing refers to it any more.
        unsafe { release(ptr.cast(), None) };

        value
    }

    fn place(value: T, target: Target, origin: &'static Location<'static>) -> Result<Self> {
        let layout = Self::layout();

        // Zero-sized values still get a distinct block, so that the owner can be recovered.
        let block = allocate_routed(
            target,
            layout.size().max(1),
            layout.align(),
            false,
            Some(origin),
        )?;
        let ptr = block.cast::<T>();

        // SAFETY: The block is fresh, large enough and aligned for `T`.
        unsafe { ptr.write(value) };

        Ok(Self {
            ptr,
            _owned: PhantomData,
        })
    }

    fn layout() -> Layout {
        Layout::new::<T>()
    }
}

impl<T> Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The box owns an initialized value for as long as it exists.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The box owns an initialized value and we have exclusive access to the box.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolBox").field(&**self).finish()
    }
}

impl<T> Drop for PoolBox<T> {
    fn drop(&mut self) {
        // SAFETY: The box owns an initialized value that nothing else refers to.
        unsafe { self.ptr.drop_in_place() };

        // SAFETY: The memory came from our routing and the value in it has been dropped.
        unsafe { release(self.ptr.cast(), None) };
    }
}

// SAFETY: The box owns its value exclusively, like `Box<T>`. Blocks may be released from any
// thread.
unsafe impl<T: Send> Send for PoolBox<T> {}

// SAFETY: Shared access to the box only gives shared access to the value, like `Box<T>`.
unsafe impl<T: Sync> Sync for PoolBox<T> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{Error, PoolHold};

    assert_impl_all!(PoolBox<u32>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(PoolBox<Cell<u32>>: Sync);
    assert_not_impl_any!(PoolBox<Rc<u32>>: Send, Sync);

    #[test]
    fn new_uses_current_pool() {
        let pool = Pool::builder().build();

        let boxed = {
            let _hold = PoolHold::new(Some(&pool));
            PoolBox::new(42_u64)
        };

        assert_eq!(*boxed, 42);
        assert_eq!(boxed.owner(), Some(pool.id()));

        drop(boxed);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn new_without_current_pool_uses_system_heap() {
        let boxed = PoolBox::new(String::from("hello"));

        assert_eq!(boxed.owner(), None);
        assert_eq!(boxed.as_str(), "hello");
    }

    #[test]
    fn try_new_in_reports_budget() {
        let pool = Pool::builder().max_size(256).build();

        let result = PoolBox::try_new_in([0_u8; 1024], &pool);

        assert!(matches!(
            result,
            Err(Error::OutOfMemory { requested: 1024, pool: Some(id) }) if id == pool.id()
        ));
    }

    #[test]
    fn try_new_reports_unavailable_pool() {
        let pool = Pool::builder().lazy_deleted(true).build();
        let id = pool.id();
        let block = pool.allocate(10).expect("unbounded pool has room");
        drop(pool);

        crate::replace_current(Some(id));
        let result = PoolBox::try_new(1_u8);
        crate::replace_current(None);

        assert!(matches!(result, Err(Error::PoolUnavailable { pool }) if pool == id));

        // SAFETY: The block is live and not used afterwards.
        unsafe { crate::free(block) };
    }

    struct Counted(Rc<Cell<u32>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get().wrapping_add(1));
        }
    }

    #[test]
    fn value_is_dropped_once() {
        let drops = Rc::new(Cell::new(0));

        let pool = Pool::builder().build();
        drop(PoolBox::new_in(Counted(Rc::clone(&drops)), &pool));

        assert_eq!(drops.get(), 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn into_inner_releases_memory() {
        let pool = Pool::builder().build();

        let boxed = PoolBox::new_in(vec![1, 2, 3], &pool);
        assert!(pool.size() > 0);

        let value = PoolBox::into_inner(boxed);

        assert_eq!(value, [1, 2, 3]);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn zero_sized_values_have_owner() {
        let pool = Pool::builder().build();

        let a = PoolBox::new_in((), &pool);
        let b = PoolBox::new_in((), &pool);

        assert_eq!(a.owner(), Some(pool.id()));
        assert_ne!(a.ptr.cast::<u8>(), b.ptr.cast::<u8>());
    }

    #[test]
    fn deref_mut_updates_value() {
        let pool = Pool::builder().build();
        let mut boxed = PoolBox::new_in(1_u32, &pool);

        *boxed += 1;

        assert_eq!(*boxed, 2);
        assert_eq!(format!("{boxed:?}"), "PoolBox(2)");
    }

    #[test]
    fn dropped_on_another_thread() {
        let pool = Pool::builder().build();
        let boxed = PoolBox::new_in([7_u64; 16], &pool);

        thread::spawn(move || drop(boxed))
            .join()
            .expect("thread does not panic");

        assert_eq!(pool.size(), 0);
    }
}
