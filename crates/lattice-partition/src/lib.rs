//! Hierarchical residue-class range partitioning.
//!
//! # Architecture
//!
//! - [`PartitionNode`]: a generator over one [`Partition`] (a closed range,
//!   optionally restricted to a residue class mod 12) with a local cache
//!   that falls back to its ancestors on a miss.
//! - [`primes`]: primality and residue-distribution helpers.
//! - [`Hierarchy`]: the root / mid-level / leaf coordinator that runs twelve
//!   residue-class children in parallel, handing work through
//!   [`lattice_sync::ConcurrentQueue`]s and sharing configuration and
//!   per-class counters through [`lattice_sync::SharedRegion`]s.
//!
//! # Example
//!
//! ```
//! use lattice_partition::{PartitionNode, NO_FILTER};
//!
//! let root = PartitionNode::root(2, 100, NO_FILTER).unwrap();
//! root.prefill(5);
//!
//! let child = root.child(2, 100, 7).unwrap();
//! assert!(child.contains_cached(7));
//! assert_eq!(child.stats().parent_lookups, 1);
//! ```

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod node;
pub mod primes;

pub use config::HierarchyConfig;
pub use error::{ConfigError, HierarchyError, PartitionError};
pub use hierarchy::{Hierarchy, HierarchyReport, WorkItem};
pub use node::{NodeStats, Partition, PartitionNode, DEFAULT_CACHE_CAPACITY, NO_FILTER};
pub use primes::{is_prime, residue_distribution, verify_symmetry, PRIME_RESIDUES};
