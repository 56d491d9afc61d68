//! Variable-size free-list heap engine
//!
//! The region is tiled by blocks, each prefixed by an in-band header
//! carrying its size and status. Free blocks form a singly-linked
//! freelist threaded through their headers. Allocation searches the
//! freelist under a pluggable [`Strategy`], splits oversized blocks,
//! and absorbs remainders too small to stand alone; deallocation
//! coalesces address-adjacent free neighbours back together.
//!
//! Header recovery on free stores the alignment pad in a single byte,
//! which bounds the supported alignment at [`MAX_SUPPORTED_ALIGN`].

use std::mem::{align_of, offset_of, size_of};
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::error::AllocError;
use crate::layout::{align_up, is_power_of_two, padding};
use crate::region::Region;
use crate::traits::ByteAllocator;

/// Largest alignment the heap engine can serve.
///
/// The pad between header and user pointer is recorded in one byte, so
/// requests above 256 are a contract violation (debug assertion).
pub const MAX_SUPPORTED_ALIGN: usize = 256;

/// Rule for choosing among free blocks large enough for a request.
///
/// Ties are broken by first discovery in freelist order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Take the first block that fits. Cheapest search.
    #[default]
    FirstFit,
    /// Take the smallest block that fits; stops early on an exact fit.
    /// Least waste, full scan otherwise.
    BestFit,
    /// Take the largest block that fits. Keeps mid-sized blocks around.
    WorstFit,
}

/// In-band bookkeeping preceding every block's payload.
#[repr(C)]
struct BlockHeader {
    /// Payload bytes, header excluded.
    size: usize,
    /// Freelist successor; meaningful only while the block is free.
    next: *mut BlockHeader,
    /// Block status.
    is_free: bool,
    /// Bytes between header end and the user pointer of a live block.
    pad: u8,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A freed block must be able to hold its freelist link.
const MIN_BLOCK_SIZE: usize = size_of::<*mut u8>();

/// Variable-size allocator with split, coalesce and pluggable fit.
///
/// Single-owner: all mutation goes through `&mut self`.
pub struct FreeListAllocator {
    region: Region,
    strategy: Strategy,
    free_list: *mut BlockHeader,
    used: usize,
}

// SAFETY: the engine is a plain value; moving it between threads moves
// exclusive access to the region with it.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    /// Creates an engine owning a fresh `cap`-byte region under the given
    /// fit strategy.
    ///
    /// # Errors
    ///
    /// [`AllocError::RegionTooSmall`] unless `cap` exceeds the block
    /// header size; [`AllocError::BackingAcquisitionFailed`] when the
    /// host allocator cannot supply the region.
    pub fn new(cap: usize, strategy: Strategy) -> Result<Self, AllocError> {
        if cap <= HEADER_SIZE {
            return Err(AllocError::RegionTooSmall {
                cap,
                min: HEADER_SIZE,
            });
        }
        let region = Region::acquire(cap, align_of::<BlockHeader>())?;

        let mut heap = Self {
            region,
            strategy,
            free_list: ptr::null_mut(),
            used: 0,
        };
        // SAFETY: the region spans cap > HEADER_SIZE writable bytes.
        unsafe { heap.init() };

        debug!("free-list allocator created ({cap} bytes, {strategy:?})");
        Ok(heap)
    }

    /// Creates an engine over a caller-supplied buffer.
    ///
    /// The buffer start is aligned up for the block header; a buffer too
    /// small to hold a header plus one byte yields an inert engine whose
    /// allocations all fail. The buffer is not released when the engine
    /// drops.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads and writes of `len` bytes for the
    /// engine's lifetime and must not be accessed through any other path
    /// while the engine is live.
    #[must_use]
    pub unsafe fn from_raw(buf: *mut u8, len: usize, strategy: Strategy) -> Self {
        let region = if buf.is_null() {
            Region::adopt(ptr::null_mut(), 0)
        } else {
            let skip = padding(buf as usize, align_of::<BlockHeader>());
            Region::adopt(buf.add(skip), len.saturating_sub(skip))
        };

        let mut heap = Self {
            region,
            strategy,
            free_list: ptr::null_mut(),
            used: 0,
        };
        if heap.region.cap() > HEADER_SIZE {
            heap.init();
        }
        heap
    }

    /// Lays down the single whole-region free block.
    ///
    /// # Safety
    ///
    /// The region must span more than `HEADER_SIZE` writable bytes and no
    /// handed-out pointer may be used afterwards.
    unsafe fn init(&mut self) {
        let head = self.region.base_ptr().cast::<BlockHeader>();
        write_free_header(head, self.region.cap() - HEADER_SIZE, ptr::null_mut());
        self.free_list = head;
        self.used = 0;
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns `None` for zero-size requests and when no free block can
    /// fit the request; engine state is unchanged in both cases. `align`
    /// must be a power of two no greater than [`MAX_SUPPORTED_ALIGN`].
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        debug_assert!(is_power_of_two(align), "alignment must be a power of two");
        debug_assert!(
            align <= MAX_SUPPORTED_ALIGN,
            "alignment above {MAX_SUPPORTED_ALIGN} is unsupported"
        );

        // Round up so split headers always land header-aligned; a freed
        // block must also be able to hold its freelist link.
        let size = align_up(size.max(MIN_BLOCK_SIZE), align_of::<BlockHeader>());

        let block = match self.strategy {
            Strategy::FirstFit => self.find_first_fit(size, align),
            Strategy::BestFit => self.find_best_fit(size, align),
            Strategy::WorstFit => self.find_worst_fit(size, align),
        }?;

        // SAFETY: block came off the freelist, so it is a valid free
        // header inside the region with capacity for pad + size bytes.
        unsafe {
            let pad = padding(block as usize + HEADER_SIZE, align);

            if (*block).size >= pad + size + HEADER_SIZE + MIN_BLOCK_SIZE {
                self.split_block(block, size, pad);
            }

            self.remove_free_block(block);
            ptr::addr_of_mut!((*block).is_free).write(false);
            // pad < MAX_SUPPORTED_ALIGN, fits in one byte.
            ptr::addr_of_mut!((*block).pad).write(pad as u8);
            if pad > 0 {
                // Non-zero fill keeps the pad gap distinguishable from a
                // live header during recovery.
                (block as *mut u8).add(HEADER_SIZE).write_bytes(0xFF, pad);
            }
            self.used += HEADER_SIZE + (*block).size;

            Some(NonNull::new_unchecked(
                (block as *mut u8).add(HEADER_SIZE + pad),
            ))
        }
    }

    /// Returns a block to the freelist and coalesces adjacent free
    /// neighbours.
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this engine and not already freed; both are debug contracts.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.owns(ptr), "pointer does not belong to this heap");

        // SAFETY: by contract ptr is a live allocation, so a valid header
        // precedes it inside the region.
        unsafe {
            let block = self.resolve_header(ptr);
            debug_assert!(!(*block).is_free, "double free");

            self.used -= HEADER_SIZE + (*block).size;
            ptr::addr_of_mut!((*block).is_free).write(true);
            ptr::addr_of_mut!((*block).next).write(self.free_list);
            self.free_list = block;

            self.coalesce();
        }
    }

    /// Walks candidate offsets behind `ptr` until the stored pad agrees
    /// with the distance walked.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this engine.
    unsafe fn resolve_header(&self, ptr: NonNull<u8>) -> *mut BlockHeader {
        let data = ptr.as_ptr() as usize;
        let base = self.region.base_addr();

        for offset in HEADER_SIZE..HEADER_SIZE + MAX_SUPPORTED_ALIGN {
            let addr = data - offset;
            if addr < base {
                break;
            }
            // Raw byte reads: a rejected candidate may overlay payload or
            // padding, which must never be materialized as a bool.
            let candidate = addr as *const u8;
            let status = candidate.add(offset_of!(BlockHeader, is_free)).read();
            let pad = candidate.add(offset_of!(BlockHeader, pad)).read();
            if status == 0 && usize::from(pad) == offset - HEADER_SIZE {
                return addr as *mut BlockHeader;
            }
        }

        // Unscannable input; assume an unpadded block.
        (data - HEADER_SIZE) as *mut BlockHeader
    }

    fn find_first_fit(&self, size: usize, align: usize) -> Option<*mut BlockHeader> {
        let mut current = self.free_list;
        while !current.is_null() {
            // SAFETY: freelist nodes are valid headers inside the region.
            unsafe {
                let pad = padding(current as usize + HEADER_SIZE, align);
                if (*current).size >= pad + size {
                    return Some(current);
                }
                current = (*current).next;
            }
        }
        None
    }

    fn find_best_fit(&self, size: usize, align: usize) -> Option<*mut BlockHeader> {
        let mut best: Option<*mut BlockHeader> = None;
        let mut best_size = usize::MAX;

        let mut current = self.free_list;
        while !current.is_null() {
            // SAFETY: freelist nodes are valid headers inside the region.
            unsafe {
                let pad = padding(current as usize + HEADER_SIZE, align);
                let required = pad + size;
                if (*current).size >= required && (*current).size < best_size {
                    best = Some(current);
                    best_size = (*current).size;
                    if (*current).size == required {
                        break;
                    }
                }
                current = (*current).next;
            }
        }
        best
    }

    fn find_worst_fit(&self, size: usize, align: usize) -> Option<*mut BlockHeader> {
        let mut worst: Option<*mut BlockHeader> = None;
        let mut worst_size = 0;

        let mut current = self.free_list;
        while !current.is_null() {
            // SAFETY: freelist nodes are valid headers inside the region.
            unsafe {
                let pad = padding(current as usize + HEADER_SIZE, align);
                if (*current).size >= pad + size && (*current).size > worst_size {
                    worst = Some(current);
                    worst_size = (*current).size;
                }
                current = (*current).next;
            }
        }
        worst
    }

    /// Carves the tail of `block` into a new free block and pushes it
    /// onto the freelist.
    ///
    /// # Safety
    ///
    /// `block` must be a free block with
    /// `size >= pad + size + HEADER_SIZE + MIN_BLOCK_SIZE`.
    unsafe fn split_block(&mut self, block: *mut BlockHeader, size: usize, pad: usize) {
        let remaining = (*block).size - pad - size - HEADER_SIZE;

        let sliver = (block as *mut u8)
            .add(HEADER_SIZE + pad + size)
            .cast::<BlockHeader>();
        write_free_header(sliver, remaining, self.free_list);
        self.free_list = sliver;

        ptr::addr_of_mut!((*block).size).write(pad + size);
    }

    /// Unlinks `block` from the freelist.
    ///
    /// # Safety
    ///
    /// `block` must be on the freelist.
    unsafe fn remove_free_block(&mut self, block: *mut BlockHeader) {
        if self.free_list == block {
            self.free_list = (*block).next;
            return;
        }

        let mut current = self.free_list;
        while !current.is_null() && (*current).next != block {
            current = (*current).next;
        }
        if !current.is_null() {
            (*current).next = (*block).next;
        }
    }

    /// Merges every run of address-adjacent free blocks.
    ///
    /// The freelist is insertion-sorted by address first, so one merge
    /// pass leaves no two adjacent blocks both free.
    ///
    /// # Safety
    ///
    /// Freelist must contain only valid free headers.
    unsafe fn coalesce(&mut self) {
        self.sort_free_list();

        let mut current = self.free_list;
        while !current.is_null() {
            let next = (*current).next;
            if next.is_null() {
                break;
            }
            let current_end = current as usize + HEADER_SIZE + (*current).size;
            if current_end == next as usize {
                ptr::addr_of_mut!((*current).size)
                    .write((*current).size + HEADER_SIZE + (*next).size);
                ptr::addr_of_mut!((*current).next).write((*next).next);
                // Stay put: the grown block may now touch its new successor.
            } else {
                current = next;
            }
        }
    }

    /// Insertion-sorts the freelist into ascending address order.
    ///
    /// # Safety
    ///
    /// Freelist must contain only valid free headers.
    unsafe fn sort_free_list(&mut self) {
        let mut sorted: *mut BlockHeader = ptr::null_mut();

        let mut current = self.free_list;
        while !current.is_null() {
            let next = (*current).next;
            if sorted.is_null() || (current as usize) < (sorted as usize) {
                ptr::addr_of_mut!((*current).next).write(sorted);
                sorted = current;
            } else {
                let mut scan = sorted;
                while !(*scan).next.is_null() && ((*scan).next as usize) < (current as usize) {
                    scan = (*scan).next;
                }
                ptr::addr_of_mut!((*current).next).write((*scan).next);
                ptr::addr_of_mut!((*scan).next).write(current);
            }
            current = next;
        }
        self.free_list = sorted;
    }

    /// Reinitializes to the single whole-region free block, invalidating
    /// every outstanding allocation.
    pub fn reset(&mut self) {
        if self.region.cap() > HEADER_SIZE {
            // SAFETY: region geometry is unchanged since construction.
            unsafe { self.init() };
        }
    }

    /// Whether `ptr` points into the managed region.
    #[inline]
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr.as_ptr() as usize)
    }

    /// Total bytes in the region.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.cap()
    }

    /// Bytes held by live blocks, their headers included. Free-block
    /// headers are not counted.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of blocks on the freelist. O(freelist length).
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.free_list;
        while !current.is_null() {
            count += 1;
            // SAFETY: freelist nodes are valid headers inside the region.
            current = unsafe { (*current).next };
        }
        count
    }

    /// Payload size of the largest free block. O(freelist length).
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut current = self.free_list;
        while !current.is_null() {
            // SAFETY: freelist nodes are valid headers inside the region.
            unsafe {
                largest = largest.max((*current).size);
                current = (*current).next;
            }
        }
        largest
    }
}

/// Writes a fully-initialized free header, padding bytes included, so
/// later header-recovery scans never read garbage.
///
/// # Safety
///
/// `at` must be header-aligned with `HEADER_SIZE` writable bytes.
unsafe fn write_free_header(at: *mut BlockHeader, size: usize, next: *mut BlockHeader) {
    (at as *mut u8).write_bytes(0, HEADER_SIZE);
    ptr::addr_of_mut!((*at).size).write(size);
    ptr::addr_of_mut!((*at).next).write(next);
    ptr::addr_of_mut!((*at).is_free).write(true);
    ptr::addr_of_mut!((*at).pad).write(0);
}

impl ByteAllocator for FreeListAllocator {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        Self::allocate(self, size, align)
    }

    /// `size` is ignored; the block header tracks it.
    #[inline]
    fn deallocate(&mut self, ptr: NonNull<u8>, _size: usize) {
        Self::deallocate(self, ptr);
    }

    fn reset(&mut self) {
        Self::reset(self);
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        Self::owns(self, ptr)
    }

    fn capacity(&self) -> usize {
        Self::capacity(self)
    }

    fn used(&self) -> usize {
        Self::used(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocation() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        let p1 = heap.allocate(100, 1).unwrap();
        assert!(heap.owns(p1));

        let p2 = heap.allocate(200, 1).unwrap();
        assert!(heap.owns(p2));
        assert_ne!(p1, p2);
        assert_eq!(heap.used(), 2 * HEADER_SIZE + 104 + 200);
    }

    #[test]
    fn test_deallocate_restores_used() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        let before = heap.used();
        let p = heap.allocate(100, 1).unwrap();
        assert!(heap.used() > before);

        heap.deallocate(p);
        assert_eq!(heap.used(), before);
    }

    #[test]
    fn test_variable_sizes() {
        let mut heap = FreeListAllocator::new(4096, Strategy::FirstFit).unwrap();

        let ptrs: Vec<_> = [16usize, 32, 64, 128, 256, 512]
            .iter()
            .map(|&size| heap.allocate(size, 1).unwrap())
            .collect();

        for p in ptrs {
            heap.deallocate(p);
        }
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_aligned_allocation_round_trips() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        for align in [16usize, 32, 64] {
            let before = heap.used();
            let p = heap.allocate(10, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");

            heap.deallocate(p);
            assert_eq!(heap.used(), before, "align {align}");
        }
    }

    #[test]
    fn test_zero_size_returns_none() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();
        assert!(heap.allocate(0, 8).is_none());
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_exhaustion_leaves_state_untouched() {
        let mut heap = FreeListAllocator::new(256, Strategy::FirstFit).unwrap();

        heap.allocate(64, 1).unwrap();
        let used = heap.used();
        let blocks = heap.free_block_count();

        assert!(heap.allocate(4096, 1).is_none());
        assert_eq!(heap.used(), used);
        assert_eq!(heap.free_block_count(), blocks);
    }

    #[test]
    fn test_split_creates_sliver() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        // 1000 free; taking 504 leaves room for a header plus payload.
        heap.allocate(500, 1).unwrap();
        assert_eq!(heap.free_block_count(), 1);
        assert_eq!(heap.largest_free_block(), 1024 - 2 * HEADER_SIZE - 504);
    }

    #[test]
    fn test_small_remainder_is_absorbed() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        heap.allocate(500, 1).unwrap();
        let remainder = heap.largest_free_block();

        // Request the remainder minus too little to host another block;
        // the whole block must be handed out instead of split.
        let p = heap.allocate(remainder - MIN_BLOCK_SIZE, 1).unwrap();
        assert_eq!(heap.free_block_count(), 0);
        assert_eq!(heap.used(), 1024);

        heap.deallocate(p);
        assert_eq!(heap.free_block_count(), 1);
    }

    #[test]
    fn test_full_coalesce_restores_single_block() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();

        let p1 = heap.allocate(100, 1).unwrap();
        let p2 = heap.allocate(200, 1).unwrap();
        let p3 = heap.allocate(300, 1).unwrap();

        // Free out of address order.
        heap.deallocate(p2);
        heap.deallocate(p1);
        heap.deallocate(p3);

        assert_eq!(heap.used(), 0);
        assert_eq!(heap.free_block_count(), 1);
        assert_eq!(heap.largest_free_block(), 1024 - HEADER_SIZE);
    }

    #[test]
    fn test_reset() {
        let mut heap = FreeListAllocator::new(1024, Strategy::BestFit).unwrap();

        heap.allocate(100, 1).unwrap();
        heap.allocate(200, 1).unwrap();
        heap.allocate(300, 1).unwrap();

        heap.reset();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.free_block_count(), 1);
        // The maximum supported size fits again.
        assert!(heap.allocate(1024 - HEADER_SIZE, 1).is_some());
    }

    #[test]
    fn test_region_too_small() {
        assert!(matches!(
            FreeListAllocator::new(HEADER_SIZE, Strategy::FirstFit),
            Err(AllocError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn test_borrowed_buffer() {
        let mut buf = [0u8; 512];
        // SAFETY: buf outlives the engine and is not aliased.
        let mut heap =
            unsafe { FreeListAllocator::from_raw(buf.as_mut_ptr(), buf.len(), Strategy::FirstFit) };

        let p = heap.allocate(64, 8).unwrap();
        assert!(heap.owns(p));
        heap.deallocate(p);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_tiny_borrowed_buffer_is_inert() {
        let mut buf = [0u8; 8];
        // SAFETY: buf outlives the engine and is not aliased.
        let mut heap =
            unsafe { FreeListAllocator::from_raw(buf.as_mut_ptr(), buf.len(), Strategy::FirstFit) };
        assert!(heap.allocate(1, 1).is_none());
    }

    #[test]
    fn test_memory_is_writable() {
        let mut heap = FreeListAllocator::new(1024, Strategy::FirstFit).unwrap();
        let p = heap.allocate(128, 1).unwrap();

        // SAFETY: p points at 128 exclusive bytes inside the region.
        let slice = unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), 128) };
        slice.fill(0xEF);
        assert!(slice.iter().all(|&b| b == 0xEF));

        heap.deallocate(p);
    }
}
