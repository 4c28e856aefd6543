//! Reentrancy protection for internal bookkeeping.
//!
//! When this package is installed as the global allocator, every allocation made by our own
//! data structures (side table growth, arena maps, registry vectors, log formatting) would
//! re-enter the allocator. While a bookkeeping scope is active on a thread, nested allocations
//! bypass the pools and go straight to the system heap without being tagged. Such blocks are
//! later recognized as "not pool-managed" and released back to the system heap.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // No destructor and a const initializer, so this remains accessible during thread teardown.
    static IN_BOOKKEEPING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside a bookkeeping scope.
///
/// If the thread-local cannot be accessed we report `true`, sending the caller down the
/// system heap path, which never touches any of our own state.
#[inline]
pub(crate) fn in_bookkeeping() -> bool {
    IN_BOOKKEEPING.try_with(Cell::get).unwrap_or(true)
}

/// Marks the current thread as performing internal bookkeeping until dropped.
///
/// Scopes nest; dropping an inner scope restores the state observed when it was entered.
#[derive(Debug)]
#[must_use = "the scope ends when the value is dropped"]
pub(crate) struct BookkeepingScope {
    was_active: bool,

    _single_threaded: PhantomData<*const ()>,
}

impl BookkeepingScope {
    pub(crate) fn enter() -> Self {
        let was_active = IN_BOOKKEEPING.try_with(|flag| flag.replace(true)).unwrap_or(true);

        Self {
            was_active,
            _single_threaded: PhantomData,
        }
    }
}

impl Drop for BookkeepingScope {
    fn drop(&mut self) {
        // Inaccessible only during thread teardown, at which point nothing is left to restore.
        _ = IN_BOOKKEEPING.try_with(|flag| flag.set(self.was_active));
    }
}

/// Runs `f` inside a bookkeeping scope.
#[inline]
pub(crate) fn with_bookkeeping<R>(f: impl FnOnce() -> R) -> R {
    let _scope = BookkeepingScope::enter();
    f()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic;

    use super::*;

    static_assertions::assert_not_impl_any!(BookkeepingScope: Send, Sync);

    #[test]
    fn inactive_by_default() {
        assert!(!in_bookkeeping());
    }

    #[test]
    fn scope_activates_and_restores() {
        {
            let _scope = BookkeepingScope::enter();
            assert!(in_bookkeeping());
        }

        assert!(!in_bookkeeping());
    }

    #[test]
    fn nested_scopes_restore_outer_state() {
        let outer = BookkeepingScope::enter();

        {
            let _inner = BookkeepingScope::enter();
            assert!(in_bookkeeping());
        }

        // Still inside the outer scope.
        assert!(in_bookkeeping());

        drop(outer);
        assert!(!in_bookkeeping());
    }

    #[test]
    fn with_bookkeeping_returns_value() {
        let value = with_bookkeeping(|| {
            assert!(in_bookkeeping());
            42
        });

        assert_eq!(value, 42);
        assert!(!in_bookkeeping());
    }

    #[test]
    fn scope_is_restored_on_unwind() {
        let result = panic::catch_unwind(|| {
            with_bookkeeping(|| panic!("intentional panic"));
        });

        assert!(result.is_err());
        assert!(!in_bookkeeping());
    }

    #[test]
    fn flag_is_per_thread() {
        let _scope = BookkeepingScope::enter();

        let other = std::thread::spawn(in_bookkeeping)
            .join()
            .expect("thread does not panic");

        assert!(!other);
        assert!(in_bookkeeping());
    }
}
