//! Construction-failure errors
//!
//! Only constructors return `Result`. Every other public operation reports
//! exhaustion as `None` and treats contract violations as programmer
//! errors (debug assertions).

use thiserror::Error;

/// Errors raised while acquiring or adopting a backing region.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The host allocator could not supply the requested backing bytes.
    #[error("backing region acquisition failed ({bytes} bytes)")]
    BackingAcquisitionFailed {
        /// Bytes requested from the host allocator.
        bytes: usize,
    },

    /// The requested region cannot hold the engine's minimum bookkeeping.
    #[error("region of {cap} bytes is too small (need more than {min})")]
    RegionTooSmall {
        /// Capacity the caller asked for.
        cap: usize,
        /// Largest capacity that is still rejected.
        min: usize,
    },
}
