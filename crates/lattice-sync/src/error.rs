use thiserror::Error;

use crate::region::AccessMode;

/// Errors reported by [`SharedRegion`](crate::SharedRegion) operations.
///
/// A failed call never leaves the region half-modified: the buffer, the
/// copy flag and every counter are exactly as they were before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("Shared region size must be greater than zero.")]
    ZeroSize,

    #[error("Cannot acquire write access to a read-only region.")]
    ReadOnly,

    #[error("Resize is only permitted for locked-write regions (region mode is {0:?}).")]
    ResizeNotPermitted(AccessMode),

    #[error("Failed to allocate {requested} bytes for a shared region.")]
    AllocationFailed { requested: usize },

    #[error("Duplicate function returned {actual} bytes, expected {expected}.")]
    DuplicateMismatch { expected: usize, actual: usize },
}
