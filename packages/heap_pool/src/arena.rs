//! Memory management inside a single pool.
//!
//! An arena obtains address space from the system in segments of [`MIN_HEAP_VIRTUAL_SPACE`]
//! bytes and carves blocks out of them first-fit. Freed blocks are returned to their segment and
//! merged with free neighbours, except for small blocks which are parked in per-size fast-reuse
//! bins until the arena runs out of space or is trimmed. Large or very strictly aligned blocks
//! get dedicated regions of their own.
//!
//! The arena is not synchronized; the owning pool wraps it in a mutex. All of its own data
//! structures allocate, so every method must be called inside a bookkeeping scope.

use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::{array, mem};

use foldhash::fast::RandomState;

use crate::{
    BLOCK_OVERHEAD, FAST_BIN_COUNT, FAST_BIN_MAX, LARGE_BLOCK_THRESHOLD, MAX_SEGMENT_ALIGN,
    MIN_ALIGN, MIN_HEAP_VIRTUAL_SPACE, Statistics,
};

#[derive(Debug)]
pub(crate) struct Arena {
    /// Upper bound for the footprint (allocated bytes plus per-block overhead).
    max_size: usize,

    /// Sorted by base address so that we can find the segment containing an address quickly.
    segments: Vec<Segment>,

    /// Every block currently handed out, keyed by address.
    live: HashMap<usize, LiveBlock, RandomState>,

    /// Freed small blocks awaiting reuse, one LIFO stack per granule size.
    fast_bins: [Vec<NonNull<u8>>; FAST_BIN_COUNT],

    /// Sum of the sizes of all live blocks.
    allocated: usize,

    /// Highest footprint ever reached.
    peak_footprint: usize,

    /// Number and total size of live blocks in dedicated regions.
    large_regions: usize,
    large_bytes: usize,
}

// SAFETY: The raw pointers refer to memory exclusively owned by the arena, which is not tied to
// any particular thread. All access goes through `&mut self`.
unsafe impl Send for Arena {}

#[derive(Clone, Copy, Debug)]
struct LiveBlock {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    large: bool,
}

/// The outcome of a successful [`Arena::resize()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Resized {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) moved: bool,
}

impl Arena {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size,
            segments: Vec::new(),
            live: HashMap::with_hasher(RandomState::default()),
            fast_bins: array::from_fn(|_| Vec::new()),
            allocated: 0,
            peak_footprint: 0,
            large_regions: 0,
            large_bytes: 0,
        }
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bytes charged against the budget: live block sizes plus per-block overhead.
    pub(crate) fn footprint(&self) -> usize {
        // Cannot overflow: every live block occupies more than BLOCK_OVERHEAD bytes of memory.
        self.allocated
            .wrapping_add(self.live.len().wrapping_mul(BLOCK_OVERHEAD))
    }

    /// The size of a live block, if `ptr` is one.
    pub(crate) fn block_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.live.get(&ptr.as_ptr().addr()).map(|block| block.size)
    }

    /// Allocates a block of at least `size` bytes aligned to at least `align` (a power of two).
    ///
    /// Returns `None` if the block would take the footprint over the budget or if the system
    /// cannot provide more memory.
    pub(crate) fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let chunk = chunk_size(size)?;

        if !self.fits_budget(chunk.checked_add(BLOCK_OVERHEAD)?) {
            return None;
        }

        self.allocate_unchecked(chunk, align.max(MIN_ALIGN))
    }

    /// Releases a live block, returning its size, or `None` if `ptr` is not a live block.
    pub(crate) fn release(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let block = self.live.remove(&ptr.as_ptr().addr())?;

        // Cannot underflow: the block size was added when the block was allocated.
        self.allocated = self.allocated.wrapping_sub(block.size);

        if block.large {
            self.release_large(block);
            return Some(block.size);
        }

        poison(block.ptr, block.size);

        if block.align == MIN_ALIGN {
            if let Some(bin) = bin_index(block.size).and_then(|index| self.fast_bins.get_mut(index))
            {
                bin.push(block.ptr);
                return Some(block.size);
            }
        }

        self.return_to_segment(block.ptr, block.size);
        Some(block.size)
    }

    /// Resizes a live block, preferring to do so in place.
    ///
    /// Returns `None` (leaving the block untouched) if `ptr` is not a live block, if the new size
    /// would take the footprint over the budget or if the system cannot provide more memory.
    pub(crate) fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<Resized> {
        let addr = ptr.as_ptr().addr();
        let block = *self.live.get(&addr)?;
        let new_chunk = chunk_size(new_size)?;

        if new_chunk == block.size {
            return Some(Resized {
                ptr,
                size: block.size,
                moved: false,
            });
        }

        if new_chunk > block.size && !self.fits_budget(new_chunk.wrapping_sub(block.size)) {
            return None;
        }

        if block.large {
            return self.resize_large(block, new_chunk);
        }

        if new_chunk < block.size {
            // Cannot underflow: guarded by the comparison above.
            let surplus = block.size.wrapping_sub(new_chunk);
            // SAFETY: The surplus lies within the block, which lies within a segment.
            let tail = unsafe { block.ptr.add(new_chunk) };
            poison(tail, surplus);
            self.return_to_segment(tail, surplus);
            self.set_block_size(addr, new_chunk);
            return Some(Resized {
                ptr,
                size: new_chunk,
                moved: false,
            });
        }

        if self.grow_in_place(block, new_chunk) {
            self.set_block_size(addr, new_chunk);
            return Some(Resized {
                ptr,
                size: new_chunk,
                moved: false,
            });
        }

        let moved_to = self.allocate_unchecked(new_chunk, block.align)?;

        // SAFETY: Both blocks are live and distinct; the old one holds `block.size` bytes and the
        // new one is larger.
        unsafe {
            moved_to.copy_from_nonoverlapping(block.ptr, block.size);
        }

        self.release(block.ptr);

        Some(Resized {
            ptr: moved_to,
            size: new_chunk,
            moved: true,
        })
    }

    /// Moves fast-reuse chunks back into their segments and returns wholly unused segments to the
    /// system. Returns the number of bytes returned to the system.
    #[cfg_attr(test, mutants::skip)] // Mutations leak memory rather than fail observably.
    pub(crate) fn trim(&mut self) -> usize {
        self.consolidate_fast_bins();

        let before: usize = self.segments.iter().map(|segment| segment.len).sum();
        self.segments.retain(|segment| !segment.is_unused());
        let after: usize = self.segments.iter().map(|segment| segment.len).sum();

        // Cannot underflow: retaining a subset cannot increase the sum.
        before.wrapping_sub(after)
    }

    pub(crate) fn statistics(&self) -> Statistics {
        let total_fast: usize = self
            .fast_bins
            .iter()
            .enumerate()
            .map(|(index, bin)| bin.len().wrapping_mul(bin_chunk_size(index)))
            .sum();

        let segment_free: usize = self.segments.iter().map(|segment| segment.free_bytes).sum();

        Statistics {
            arena: self.segments.iter().map(|segment| segment.len).sum(),
            free_chunks: self.segments.iter().map(|segment| segment.free.len()).sum(),
            fast_chunks: self.fast_bins.iter().map(Vec::len).sum(),
            mmap_regions: self.large_regions,
            mmap_bytes: self.large_bytes,
            max_alloc: self.peak_footprint,
            total_fast,
            total_alloc: self.allocated,
            total_free: segment_free.wrapping_add(total_fast),
            keep_cost: self
                .segments
                .iter()
                .filter(|segment| segment.is_unused())
                .map(|segment| segment.len)
                .sum(),
        }
    }

    /// Whether `addr` lies anywhere within memory owned by this arena, live or not.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.segment_index(addr).is_some()
            || self.live.values().any(|block| {
                let start = block.ptr.as_ptr().addr();
                block.large && addr >= start && addr < start.wrapping_add(block.size)
            })
    }

    /// Addresses of all live blocks.
    pub(crate) fn live_addresses(&self) -> Vec<usize> {
        self.live.keys().copied().collect()
    }

    /// Returns all memory to the system, invalidating every live block.
    pub(crate) fn release_all(&mut self) {
        let live = mem::take(&mut self.live);

        for block in live.into_values().filter(|block| block.large) {
            self.release_large(block);
        }

        for bin in &mut self.fast_bins {
            bin.clear();
        }

        // Dropping a segment returns its memory to the system.
        self.segments.clear();
        self.allocated = 0;
    }

    fn fits_budget(&self, additional: usize) -> bool {
        self.footprint()
            .checked_add(additional)
            .is_some_and(|footprint| footprint <= self.max_size)
    }

    fn allocate_unchecked(&mut self, chunk: usize, align: usize) -> Option<NonNull<u8>> {
        let large = chunk >= LARGE_BLOCK_THRESHOLD || align > MAX_SEGMENT_ALIGN;

        let ptr = if large {
            self.allocate_large(chunk, align)?
        } else {
            self.allocate_small(chunk, align)?
        };

        self.live.insert(
            ptr.as_ptr().addr(),
            LiveBlock {
                ptr,
                size: chunk,
                align,
                large,
            },
        );

        // Cannot overflow: the allocated memory exists, so its total size fits in usize.
        self.allocated = self.allocated.wrapping_add(chunk);
        self.peak_footprint = self.peak_footprint.max(self.footprint());

        Some(ptr)
    }

    fn allocate_small(&mut self, chunk: usize, align: usize) -> Option<NonNull<u8>> {
        if align == MIN_ALIGN {
            let reused = bin_index(chunk)
                .and_then(|index| self.fast_bins.get_mut(index))
                .and_then(Vec::pop);

            if reused.is_some() {
                return reused;
            }
        }

        if let Some(ptr) = self.carve(chunk, align) {
            return Some(ptr);
        }

        if self.consolidate_fast_bins() > 0 {
            if let Some(ptr) = self.carve(chunk, align) {
                return Some(ptr);
            }
        }

        let segment = Segment::new(MIN_HEAP_VIRTUAL_SPACE)?;

        let index = self
            .segments
            .partition_point(|existing| existing.addr() < segment.addr());
        self.segments.insert(index, segment);

        self.segments.get_mut(index)?.carve(chunk, align)
    }

    fn carve(&mut self, chunk: usize, align: usize) -> Option<NonNull<u8>> {
        self.segments
            .iter_mut()
            .filter(|segment| segment.free_bytes >= chunk)
            .find_map(|segment| segment.carve(chunk, align))
    }

    fn allocate_large(&mut self, chunk: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(chunk, align).ok()?;

        // SAFETY: The layout has a non-zero size because chunk_size() never returns zero.
        let ptr = NonNull::new(unsafe { System.alloc(layout) })?;

        self.large_regions = self.large_regions.wrapping_add(1);
        self.large_bytes = self.large_bytes.wrapping_add(chunk);

        Some(ptr)
    }

    fn release_large(&mut self, block: LiveBlock) {
        // SAFETY: The same layout was accepted by allocate_large() or resize_large().
        let layout = unsafe { Layout::from_size_align_unchecked(block.size, block.align) };

        // SAFETY: The block was allocated from System with this layout and is not used again.
        unsafe {
            System.dealloc(block.ptr.as_ptr(), layout);
        }

        self.large_regions = self.large_regions.wrapping_sub(1);
        self.large_bytes = self.large_bytes.wrapping_sub(block.size);
    }

    fn resize_large(&mut self, block: LiveBlock, new_chunk: usize) -> Option<Resized> {
        // SAFETY: The same layout was accepted when the region was allocated.
        let layout = unsafe { Layout::from_size_align_unchecked(block.size, block.align) };

        // A layout of this size must not overflow isize once rounded up to the alignment.
        Layout::from_size_align(new_chunk, block.align).ok()?;

        // SAFETY: The region came from System with `layout`, the new size is non-zero and we just
        // checked that it forms a valid layout with the same alignment.
        let ptr = NonNull::new(unsafe { System.realloc(block.ptr.as_ptr(), layout, new_chunk) })?;

        self.live.remove(&block.ptr.as_ptr().addr());
        self.live.insert(
            ptr.as_ptr().addr(),
            LiveBlock {
                ptr,
                size: new_chunk,
                ..block
            },
        );

        self.allocated = self
            .allocated
            .wrapping_sub(block.size)
            .wrapping_add(new_chunk);
        self.large_bytes = self
            .large_bytes
            .wrapping_sub(block.size)
            .wrapping_add(new_chunk);
        self.peak_footprint = self.peak_footprint.max(self.footprint());

        Some(Resized {
            ptr,
            size: new_chunk,
            moved: ptr != block.ptr,
        })
    }

    fn grow_in_place(&mut self, block: LiveBlock, new_chunk: usize) -> bool {
        let addr = block.ptr.as_ptr().addr();

        let Some(segment) = self
            .segment_index(addr)
            .and_then(|index| self.segments.get_mut(index))
        else {
            return false;
        };

        // Cannot underflow: the segment contains the address.
        let offset = addr.wrapping_sub(segment.addr());

        segment.extend(offset, block.size, new_chunk)
    }

    fn set_block_size(&mut self, addr: usize, new_size: usize) {
        if let Some(block) = self.live.get_mut(&addr) {
            self.allocated = self
                .allocated
                .wrapping_sub(block.size)
                .wrapping_add(new_size);
            block.size = new_size;
        }

        self.peak_footprint = self.peak_footprint.max(self.footprint());
    }

    fn return_to_segment(&mut self, ptr: NonNull<u8>, len: usize) {
        let addr = ptr.as_ptr().addr();

        let Some(segment) = self
            .segment_index(addr)
            .and_then(|index| self.segments.get_mut(index))
        else {
            debug_assert!(false, "block at {addr:#x} does not belong to any segment");
            return;
        };

        // Cannot underflow: the segment contains the address.
        segment.give_back(addr.wrapping_sub(segment.addr()), len);
    }

    /// Moves every fast-reuse chunk back into its segment, returning how many were moved.
    fn consolidate_fast_bins(&mut self) -> usize {
        let mut moved = 0_usize;

        let bins = mem::replace(&mut self.fast_bins, array::from_fn(|_| Vec::new()));

        for (index, bin) in bins.into_iter().enumerate() {
            for ptr in bin {
                self.return_to_segment(ptr, bin_chunk_size(index));
                moved = moved.wrapping_add(1);
            }
        }

        moved
    }

    fn segment_index(&self, addr: usize) -> Option<usize> {
        let after = self
            .segments
            .partition_point(|segment| segment.addr() <= addr);

        let index = after.checked_sub(1)?;
        let segment = self.segments.get(index)?;

        segment.contains(addr).then_some(index)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// A granule of address space obtained from the system.
#[derive(Debug)]
struct Segment {
    base: NonNull<u8>,
    len: usize,

    /// Offset to length of every free range. Adjacent free ranges are always merged.
    free: BTreeMap<usize, usize>,

    free_bytes: usize,
}

impl Segment {
    fn new(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len, MAX_SEGMENT_ALIGN).ok()?;

        // SAFETY: Segments are never zero-sized.
        let base = NonNull::new(unsafe { System.alloc(layout) })?;

        let mut free = BTreeMap::new();
        free.insert(0, len);

        Some(Self {
            base,
            len,
            free,
            free_bytes: len,
        })
    }

    fn addr(&self) -> usize {
        self.base.as_ptr().addr()
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr().wrapping_add(self.len)
    }

    fn is_unused(&self) -> bool {
        self.free_bytes == self.len
    }

    /// Takes `chunk` bytes aligned to `align` from the first free range that can hold them.
    fn carve(&mut self, chunk: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.addr();

        let (offset, len, padding) = self.free.iter().find_map(|(&offset, &len)| {
            let start = base.checked_add(offset)?;
            let padding = start.checked_next_multiple_of(align)?.checked_sub(start)?;
            (padding.checked_add(chunk)? <= len).then_some((offset, len, padding))
        })?;

        self.free.remove(&offset);

        if padding > 0 {
            self.free.insert(offset, padding);
        }

        // None of this can overflow: everything lies within the free range found above.
        let start = offset.wrapping_add(padding);
        let end = start.wrapping_add(chunk);
        let tail = offset.wrapping_add(len).wrapping_sub(end);

        if tail > 0 {
            self.free.insert(end, tail);
        }

        self.free_bytes = self.free_bytes.wrapping_sub(chunk);

        // SAFETY: `start` is within the segment as established above.
        Some(unsafe { self.base.add(start) })
    }

    /// Extends the block at `offset` from `old_len` to `new_len` bytes if the space directly
    /// after it is free.
    fn extend(&mut self, offset: usize, old_len: usize, new_len: usize) -> bool {
        let next = offset.wrapping_add(old_len);
        let needed = new_len.wrapping_sub(old_len);

        let Some(&available) = self.free.get(&next) else {
            return false;
        };

        if available < needed {
            return false;
        }

        self.free.remove(&next);

        let remaining = available.wrapping_sub(needed);
        if remaining > 0 {
            self.free.insert(next.wrapping_add(needed), remaining);
        }

        self.free_bytes = self.free_bytes.wrapping_sub(needed);
        true
    }

    /// Returns a range to the free set, merging it with adjacent free ranges.
    fn give_back(&mut self, offset: usize, len: usize) {
        debug_assert!(
            offset.wrapping_add(len) <= self.len,
            "range returned to a segment extends past its end"
        );

        self.free_bytes = self.free_bytes.wrapping_add(len);

        let mut start = offset;
        let mut merged_len = len;

        if let Some(next_len) = self.free.remove(&offset.wrapping_add(len)) {
            merged_len = merged_len.wrapping_add(next_len);
        }

        if let Some((&previous, &previous_len)) = self.free.range(..offset).next_back() {
            debug_assert!(
                previous.wrapping_add(previous_len) <= offset,
                "double free: range at offset {offset} is already free"
            );

            if previous.wrapping_add(previous_len) == offset {
                self.free.remove(&previous);
                start = previous;
                merged_len = merged_len.wrapping_add(previous_len);
            }
        }

        self.free.insert(start, merged_len);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: The same layout was accepted when the segment was created.
        let layout = unsafe { Layout::from_size_align_unchecked(self.len, MAX_SEGMENT_ALIGN) };

        // SAFETY: The segment memory came from System with this layout. Nothing may refer to it
        // once the segment is dropped.
        unsafe {
            System.dealloc(self.base.as_ptr(), layout);
        }
    }
}

/// Rounds a request up to the allocation granule. Zero-byte requests get one granule.
fn chunk_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(MIN_ALIGN)
}

fn bin_index(chunk: usize) -> Option<usize> {
    (chunk <= FAST_BIN_MAX).then(|| (chunk / MIN_ALIGN).wrapping_sub(1))
}

fn bin_chunk_size(index: usize) -> usize {
    index.wrapping_add(1).wrapping_mul(MIN_ALIGN)
}

/// Overwrites released memory in debug builds so that use-after-free shows up quickly.
fn poison(ptr: NonNull<u8>, len: usize) {
    if cfg!(debug_assertions) {
        // SAFETY: Callers only pass memory that the arena owns and nobody else may use.
        unsafe {
            ptr.write_bytes(crate::POISON_BYTE, len);
        }
    }
}
