/// Pools reserve address space from the system in segments of this many bytes.
///
/// Creating a pool does not reserve anything; the first segment is obtained on the first
/// allocation that does not fit into an existing segment.
pub const MIN_HEAP_VIRTUAL_SPACE: usize = 1024 * 1024;

/// The alignment of every block handed out, unless a stricter alignment is requested.
///
/// Block sizes are also rounded up to a multiple of this value.
pub const MIN_ALIGN: usize = 16;

/// Bytes charged against a pool's budget for every live block, in addition to the block size.
///
/// This models the chunk header that a traditional allocator stores in front of each block.
/// It is accounted for but not stored in the pool memory itself.
pub const BLOCK_OVERHEAD: usize = 16;

/// Blocks at least this large are served from dedicated regions instead of pool segments.
pub const LARGE_BLOCK_THRESHOLD: usize = 128 * 1024;

/// Alignments above this are served from dedicated regions instead of pool segments.
pub(crate) const MAX_SEGMENT_ALIGN: usize = 4096;

/// Freed blocks up to this size are kept in fast-reuse bins without being coalesced.
pub(crate) const FAST_BIN_MAX: usize = 64;

/// One fast-reuse bin per granule size up to [`FAST_BIN_MAX`].
pub(crate) const FAST_BIN_COUNT: usize = FAST_BIN_MAX / MIN_ALIGN;

/// Byte written over released pool memory in debug builds.
pub(crate) const POISON_BYTE: u8 = 0xDD;
