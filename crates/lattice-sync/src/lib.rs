//! Synchronization primitives for hierarchical coordinators and workers.
//!
//! # Architecture
//!
//! The crate provides the two pieces of shared state a tree of cooperating
//! threads needs:
//!
//! - [`SharedRegion`]: a byte region with a three-tier access discipline
//!   (read-only, copy-on-write, locked-write), versioned on every completed
//!   write so observers can cheaply detect change.
//! - [`ConcurrentQueue`]: an unbounded lock-free MPMC queue used to hand
//!   work items from a coordinator to its workers and results back up.
//!
//! # Thread Safety
//!
//! Both types are `Send + Sync` and are meant to be shared by reference
//! (scoped threads) or through an `Arc`. Region access is guarded by RAII
//! handles; the queue needs no handles at all.

pub mod error;
pub mod queue;
pub mod region;

pub use error::RegionError;
pub use queue::{ConcurrentQueue, QueueConfig, QueueStats, DEFAULT_POOL_CAPACITY};
pub use region::{
    AccessMode, BufferOps, ByteCopy, RegionReadGuard, RegionStats, RegionWriteGuard, SharedRegion,
};
