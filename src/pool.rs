//! Fixed-chunk pool engine
//!
//! Partitions the region into uniform slots and threads an intrusive
//! freelist through the free ones: a free slot's first pointer-sized
//! word stores the address of the next free slot. Allocation and
//! release are both a single O(1) link update, and uniform slots make
//! fragmentation impossible.
//!
//! The slot size is fixed at construction; the [`ByteAllocator`] impl
//! therefore ignores per-call size and alignment by design.

use std::mem::size_of;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::error::AllocError;
use crate::layout::{align_up, is_power_of_two, padding};
use crate::region::Region;
use crate::traits::ByteAllocator;

/// Pool of `slot_count` uniform slots with O(1) allocate/deallocate.
///
/// While a slot sits on the freelist its bytes are bookkeeping, not user
/// data; reading a freed slot is a caller contract violation.
pub struct PoolAllocator {
    region: Region,
    slot_size: usize,
    slot_count: usize,
    free_head: *mut u8,
    free_slots: usize,
}

// SAFETY: the engine is a plain value; moving it between threads moves
// exclusive access to the region with it.
unsafe impl Send for PoolAllocator {}

impl PoolAllocator {
    /// Creates a pool owning a fresh region of `chunk_count` slots.
    ///
    /// The effective slot size is `chunk_size` raised to at least one
    /// pointer (the intrusive link must fit) and rounded up to `align`
    /// (a power of two). The region is acquired already aligned, so every
    /// slot start satisfies `align`.
    ///
    /// # Errors
    ///
    /// [`AllocError::BackingAcquisitionFailed`] when the host allocator
    /// cannot supply the region.
    pub fn new(chunk_size: usize, chunk_count: usize, align: usize) -> Result<Self, AllocError> {
        debug_assert!(is_power_of_two(align), "alignment must be a power of two");

        let slot_size = align_up(chunk_size.max(size_of::<*mut u8>()), align);
        let bytes = slot_size
            .checked_mul(chunk_count)
            .ok_or(AllocError::BackingAcquisitionFailed { bytes: usize::MAX })?;
        let region = Region::acquire(bytes, align)?;

        let mut pool = Self {
            region,
            slot_size,
            slot_count: chunk_count,
            free_head: ptr::null_mut(),
            free_slots: 0,
        };
        if bytes == 0 {
            pool.slot_count = 0;
        }
        // SAFETY: the region spans slot_count * slot_size writable bytes.
        unsafe { pool.rebuild_free_list() };

        debug!(
            "pool allocator created ({} slots x {} bytes)",
            pool.slot_count, pool.slot_size
        );
        Ok(pool)
    }

    /// Creates a pool over a caller-supplied buffer.
    ///
    /// The buffer start is aligned up to `align`; the slot count is
    /// however many effective slots fit in what remains. The buffer is
    /// not released when the engine drops.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads and writes of `len` bytes for the
    /// engine's lifetime and must not be accessed through any other path
    /// while the engine is live.
    #[must_use]
    pub unsafe fn from_raw(buf: *mut u8, len: usize, chunk_size: usize, align: usize) -> Self {
        debug_assert!(is_power_of_two(align), "alignment must be a power of two");

        let slot_size = align_up(chunk_size.max(size_of::<*mut u8>()), align);
        let (region, slot_count) = if buf.is_null() {
            (Region::adopt(ptr::null_mut(), 0), 0)
        } else {
            let skip = padding(buf as usize, align);
            let usable = len.saturating_sub(skip);
            (Region::adopt(buf.add(skip), usable), usable / slot_size)
        };

        let mut pool = Self {
            region,
            slot_size,
            slot_count,
            free_head: ptr::null_mut(),
            free_slots: 0,
        };
        pool.rebuild_free_list();
        pool
    }

    /// Threads the freelist through every slot in address order.
    ///
    /// # Safety
    ///
    /// The region must span `slot_count * slot_size` writable bytes and
    /// no handed-out pointer may be used afterwards.
    unsafe fn rebuild_free_list(&mut self) {
        let base = self.region.base_ptr();
        for i in 0..self.slot_count {
            let slot = base.add(i * self.slot_size).cast::<*mut u8>();
            let next = if i + 1 < self.slot_count {
                base.add((i + 1) * self.slot_size)
            } else {
                ptr::null_mut()
            };
            // Unaligned store: slot starts honor `align`, which the
            // caller may have set below pointer alignment.
            slot.write_unaligned(next);
        }
        self.free_head = if self.slot_count > 0 {
            base
        } else {
            ptr::null_mut()
        };
        self.free_slots = self.slot_count;
    }

    /// Pops a slot off the freelist.
    ///
    /// Returns `None` when every slot is handed out.
    #[inline]
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.free_head)?;
        // SAFETY: head is a free slot, so its first word is the next link.
        self.free_head = unsafe { head.as_ptr().cast::<*mut u8>().read_unaligned() };
        self.free_slots -= 1;
        Some(head)
    }

    /// Pushes a slot back onto the freelist.
    ///
    /// `ptr` must be a slot previously returned by
    /// [`allocate`](Self::allocate) and not already freed; both are debug
    /// contracts. The freed slot is reused LIFO.
    #[inline]
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.owns(ptr), "pointer does not belong to this pool");
        // SAFETY: ptr is a slot in our region; its first word becomes the
        // intrusive link.
        unsafe { ptr.as_ptr().cast::<*mut u8>().write_unaligned(self.free_head) };
        self.free_head = ptr.as_ptr();
        self.free_slots += 1;
    }

    /// Returns every slot to the freelist, invalidating all outstanding
    /// pointers.
    pub fn reset(&mut self) {
        // SAFETY: region geometry is unchanged since construction.
        unsafe { self.rebuild_free_list() };
    }

    /// Whether `ptr` is a slot start inside the pool.
    #[inline]
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.region.base_addr();
        let span = self.slot_count * self.slot_size;
        self.slot_count > 0
            && addr >= base
            && addr < base + span
            && (addr - base) % self.slot_size == 0
    }

    /// Effective slot size in bytes (after minimum and alignment round-up).
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of slots.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slots currently on the freelist.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_slots
    }

    /// Whether every slot is handed out.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.free_slots == 0
    }

    /// Total bytes of backing memory.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.cap()
    }

    /// Bytes held by handed-out slots.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        (self.slot_count - self.free_slots) * self.slot_size
    }
}

impl ByteAllocator for PoolAllocator {
    /// Size and alignment are ignored: slots are fixed at construction.
    #[inline]
    fn allocate(&mut self, _size: usize, _align: usize) -> Option<NonNull<u8>> {
        Self::allocate(self)
    }

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
