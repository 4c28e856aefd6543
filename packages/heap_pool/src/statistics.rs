use std::fmt;

/// Usage statistics of a heap, modelled on the `mallinfo` family of allocator reports.
///
/// For a [`Pool`][crate::Pool], "segments" are the granules of address space the pool obtained
/// from the system and "dedicated regions" are the separately allocated homes of large blocks.
/// For the system heap (see [`global_statistics()`][crate::global_statistics]), the values are
/// taken from the C library where it reports them and are zero elsewhere.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Statistics {
    /// Bytes of address space held in segments (excluding dedicated regions).
    pub arena: usize,

    /// Number of free chunks available for general reuse.
    pub free_chunks: usize,

    /// Number of small chunks held for fast reuse.
    pub fast_chunks: usize,

    /// Number of dedicated regions in use.
    pub mmap_regions: usize,

    /// Bytes held in dedicated regions.
    pub mmap_bytes: usize,

    /// Highest footprint ever reached.
    pub max_alloc: usize,

    /// Bytes held in chunks available for fast reuse.
    pub total_fast: usize,

    /// Bytes currently allocated to callers.
    pub total_alloc: usize,

    /// Bytes held but not allocated to callers.
    pub total_free: usize,

    /// Bytes that could be returned to the system right now.
    pub keep_cost: usize,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap peaked at {} bytes; {} bytes in use, {} bytes free; {} bytes in segments, \
             {} bytes in {} dedicated regions; {} bytes held by {} fast reuse chunks; \
             {} bytes could be returned to the system",
            self.max_alloc,
            self.total_alloc,
            self.total_free,
            self.arena,
            self.mmap_bytes,
            self.mmap_regions,
            self.total_fast,
            self.fast_chunks,
            self.keep_cost
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Statistics: Send, Sync, Copy);

    #[test]
    fn default_is_all_zero() {
        let stats = Statistics::default();

        assert_eq!(stats.arena, 0);
        assert_eq!(stats.total_alloc, 0);
        assert_eq!(stats.keep_cost, 0);
    }

    #[test]
    fn display_mentions_key_figures() {
        let stats = Statistics {
            arena: 1_048_576,
            total_alloc: 3072,
            total_free: 1_045_504,
            mmap_regions: 2,
            ..Statistics::default()
        };

        let text = stats.to_string();

        assert!(text.contains("3072 bytes in use"));
        assert!(text.contains("1045504 bytes free"));
        assert!(text.contains("1048576 bytes in segments"));
        assert!(text.contains("in 2 dedicated regions"));
    }
}
