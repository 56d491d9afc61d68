//! Bump (linear) allocation engine
//!
//! Hands out bytes by advancing a cursor through the region. There is no
//! per-allocation release: callers either rewind to a [`Savepoint`]
//! (LIFO scope discipline) or [`reset`](BumpAllocator::reset) the whole
//! region. Allocation is a pad computation and one addition; worst case
//! is identical to best case.
//!
//! Intended for per-tick scratch data: carve everything a cycle needs,
//! rewind when the cycle ends.

use std::ptr::NonNull;

use tracing::debug;

use crate::error::AllocError;
use crate::layout::{is_power_of_two, padding, MAX_SCALAR_ALIGN};
use crate::region::Region;
use crate::traits::ByteAllocator;

/// Opaque capture of the bump cursor, redeemable via
/// [`BumpAllocator::rewind`].
///
/// Savepoints taken later compare greater than savepoints taken earlier;
/// beyond that the contained value is meaningless to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Savepoint(usize);

/// Linear allocator over a fixed region with savepoint/rewind support.
///
/// Single-owner: all mutation goes through `&mut self`, so the borrow
/// checker provides the serialization the engine requires.
pub struct BumpAllocator {
    region: Region,
    cursor: usize,
}

// SAFETY: the engine is a plain value; moving it between threads moves
// exclusive access to the region with it.
unsafe impl Send for BumpAllocator {}

impl BumpAllocator {
    /// Creates an engine owning a fresh `cap`-byte region.
    ///
    /// `cap` of zero yields an inert engine whose allocations all fail.
    ///
    /// # Errors
    ///
    /// [`AllocError::BackingAcquisitionFailed`] when the host allocator
    /// cannot supply the region.
    pub fn new(cap: usize) -> Result<Self, AllocError> {
        let region = Region::acquire(cap, MAX_SCALAR_ALIGN)?;
        debug!("bump allocator created ({cap} bytes)");
        Ok(Self { region, cursor: 0 })
    }

    /// Creates an engine over a caller-supplied buffer.
    ///
    /// The buffer is not released when the engine drops.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads and writes of `cap` bytes for the
    /// engine's lifetime and must not be accessed through any other path
    /// while the engine is live.
    #[must_use]
    pub unsafe fn from_raw(buf: *mut u8, cap: usize) -> Self {
        Self {
            region: Region::adopt(buf, cap),
            cursor: 0,
        }
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns `None` for zero-size requests and on exhaustion; the
    /// cursor is untouched in both cases. `align` must be a power of two.
    #[inline]
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        debug_assert!(is_power_of_two(align), "alignment must be a power of two");

        let pad = padding(self.region.base_addr() + self.cursor, align);
        let free = self.region.cap() - self.cursor;
        if pad > free || size > free - pad {
            return None;
        }

        let offset = self.cursor + pad;
        self.cursor = offset + size;
        // SAFETY: offset + size <= cap, so the pointer stays inside the
        // region, which is valid for cap bytes.
        Some(unsafe { NonNull::new_unchecked(self.region.base_ptr().add(offset)) })
    }

    /// No-op. Bump memory is reclaimed through [`rewind`](Self::rewind)
    /// or [`reset`](Self::reset), never per pointer.
    #[inline]
    pub fn deallocate(&mut self, _ptr: NonNull<u8>, _size: usize) {}

    /// Captures the current cursor for a later [`rewind`](Self::rewind).
    #[inline]
    #[must_use]
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.cursor)
    }

    /// Rolls the cursor back to `savepoint`, invalidating every pointer
    /// handed out after it was taken.
    ///
    /// Rewinding to a savepoint ahead of the cursor is a contract
    /// violation (debug assertion).
    #[inline]
    pub fn rewind(&mut self, savepoint: Savepoint) {
        debug_assert!(
            savepoint.0 <= self.cursor,
            "cannot rewind to a future savepoint"
        );
        self.cursor = savepoint.0;
    }

    /// Invalidates every outstanding allocation and returns the cursor
    /// to the start of the region.
    pub fn reset(&mut self) {
        self.cursor = 0;
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

    /// Bytes consumed so far (cursor position, padding included).
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes still available ahead of the cursor.
    #[inline]
    #[must_use]
    pub fn free(&self) -> usize {
        self.region.cap() - self.cursor
    }
}

impl ByteAllocator for BumpAllocator {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        Self::allocate(self, size, align)
    }

    #[inline]
    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        Self::deallocate(self, ptr, size);
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
