use thiserror::Error;

use crate::PoolId;

/// Errors that can occur when allocating memory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The allocation would exceed the budget of the pool or the system could not provide the
    /// memory.
    #[error("out of memory: {requested} bytes could not be allocated from {}", describe(.pool))]
    OutOfMemory {
        /// The number of bytes requested by the caller.
        requested: usize,

        /// The pool the request was routed to, or `None` for the system heap.
        pool: Option<PoolId>,
    },

    /// The pool is no longer accepting allocations because its destruction has begun.
    #[error("{pool} is being destroyed and no longer accepts allocations")]
    PoolUnavailable {
        /// The pool that rejected the request.
        pool: PoolId,
    },
}

fn describe(pool: &Option<PoolId>) -> String {
    pool.map_or_else(|| "the system heap".to_string(), |pool| pool.to_string())
}

/// A specialized `Result` type for allocation operations, returning the crate's [`Error`] type
/// as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Pool;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn out_of_memory_names_the_system_heap() {
        let error = Error::OutOfMemory {
            requested: 100,
            pool: None,
        };

        assert_eq!(
            error.to_string(),
            "out of memory: 100 bytes could not be allocated from the system heap"
        );
    }

    #[test]
    fn out_of_memory_names_the_pool() {
        let pool = Pool::builder().build();

        let error = Error::OutOfMemory {
            requested: 4096,
            pool: Some(pool.id()),
        };

        let result: Result<()> = Err(error);
        let message = result.expect_err("constructed as an error").to_string();

        assert!(message.contains("4096 bytes"));
        assert!(message.contains(&pool.id().to_string()));
    }

    #[test]
    fn pool_unavailable_names_the_pool() {
        let pool = Pool::builder().build();

        let error = Error::PoolUnavailable { pool: pool.id() };

        assert!(error.to_string().starts_with(&pool.id().to_string()));
    }
}
