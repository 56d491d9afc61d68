//! Fixed-region memory allocators for latency-critical paths
//!
//! PERFORMANCE FIRST: every engine manages one pre-acquired contiguous
//! byte region and hands out aligned sub-regions with deterministic,
//! allocation-free hot paths.
//!
//! Key Design Principles:
//! - NO host-allocator calls outside construction and destruction
//! - NO locks, NO atomics - engines are single-owner (`&mut self`)
//! - Exhaustion is a `None`, never a panic
//! - Unsafe pointer arithmetic confined to engine internals
//!
//! Engines (no runtime dependency between them):
//! - [`BumpAllocator`]: linear cursor, savepoint/rewind, O(1) everything
//! - [`PoolAllocator`]: uniform slots on an intrusive freelist, O(1)
//! - [`FreeListAllocator`]: variable-size blocks, split + coalesce,
//!   pluggable fit strategy (first/best/worst)

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]

pub mod bump;
pub mod error;
pub mod freelist;
pub mod layout;
pub mod pool;
mod region;
pub mod traits;

// Re-exports
pub use bump::{BumpAllocator, Savepoint};
pub use error::AllocError;
pub use freelist::{FreeListAllocator, Strategy, MAX_SUPPORTED_ALIGN};
pub use layout::MAX_SCALAR_ALIGN;
pub use pool::PoolAllocator;
pub use traits::ByteAllocator;
