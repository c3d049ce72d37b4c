//! Hierarchical range generators with parent-delegated caches.
//!
//! A [`PartitionNode`] owns one [`Partition`] of the number line (a closed
//! range, optionally narrowed to a single residue class mod 12) and walks it
//! in ascending order, yielding the primes it contains. Every value it finds
//! goes into its own cache. Nodes form a tree: a child borrows its parent
//! and, on a local cache miss, looks upward before giving up, so values the
//! root discovered early are visible to every descendant for free.
//!
//! The parent link is a plain borrow, which makes the tree's lifetime rule
//! a compile-time fact: a parent always outlives its children, and dropping
//! a child never touches its parent.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::PartitionError;
use crate::primes::{self, RESIDUE_CLASSES};

/// Initial number of cache slots; the cache doubles when full.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Filter value meaning "no residue filter".
pub const NO_FILTER: i32 = -1;

/// A closed range `[range_start, range_end]` with an optional residue filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
///
/// Only [`Partition::new`] and [`Partition::split`] build one, so a value of
/// this type always has `range_start <= range_end` and a residue below 12.
pub struct Partition {
    range_start: u64,
    range_end: u64,
    /// When set, only values `v` with `v % 12 == residue` belong here.
    residue: Option<u8>,
}

impl Partition {
    /// Builds a partition from explicit bounds and a filter in `-1..=11`,
    /// where `-1` disables filtering.
    pub fn new(range_start: u64, range_end: u64, filter: i32) -> Result<Self, PartitionError> {
        if range_start > range_end {
            return Err(PartitionError::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }
        let residue = match filter {
            NO_FILTER => None,
            0..=11 => Some(filter as u8),
            other => return Err(PartitionError::InvalidResidue(other)),
        };
        Ok(Partition {
            range_start,
            range_end,
            residue,
        })
    }

    #[inline]
    pub fn range_start(&self) -> u64 {
        self.range_start
    }

    #[inline]
    pub fn range_end(&self) -> u64 {
        self.range_end
    }

    #[inline]
    pub fn residue(&self) -> Option<u8> {
        self.residue
    }

    /// The filter as the `-1..=11` integer it was created from.
    pub fn filter(&self) -> i32 {
        self.residue.map_or(NO_FILTER, i32::from)
    }

    /// Range and residue membership.
    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        if value < self.range_start || value > self.range_end {
            return false;
        }
        match self.residue {
            Some(r) => primes::residue_of(value) == r,
            None => true,
        }
    }

    /// Distance between consecutive candidates.
    #[inline]
    fn step(&self) -> u64 {
        if self.residue.is_some() {
            RESIDUE_CLASSES as u64
        } else {
            1
        }
    }

    /// Smallest member of the partition, if any.
    fn first_candidate(&self) -> Option<u64> {
        let first = match self.residue {
            None => self.range_start,
            Some(r) => {
                let offset = (u64::from(r) + RESIDUE_CLASSES as u64
                    - self.range_start % RESIDUE_CLASSES as u64)
                    % RESIDUE_CLASSES as u64;
                self.range_start.checked_add(offset)?
            }
        };
        (first <= self.range_end).then_some(first)
    }

    /// Splits the range into up to `parts` contiguous sub-ranges with the
    /// same filter. Earlier pieces absorb the remainder, so lengths differ
    /// by at most one. A range shorter than `parts` yields one piece per
    /// value.
    pub fn split(&self, parts: usize) -> Result<Vec<Partition>, PartitionError> {
        if parts == 0 {
            return Err(PartitionError::InvalidSplit(parts));
        }
        if self.range_start > self.range_end {
            return Err(PartitionError::InvalidRange {
                start: self.range_start,
                end: self.range_end,
            });
        }
        let len = u128::from(self.range_end - self.range_start) + 1;
        let parts = (parts as u128).min(len);
        let base = len / parts;
        let remainder = len % parts;

        let mut pieces = Vec::with_capacity(parts as usize);
        let mut start = u128::from(self.range_start);
        for i in 0..parts {
            let width = base + u128::from(i < remainder);
            let end = start + width - 1;
            // Both bounds lie inside the source u64 range.
            pieces.push(Partition {
                range_start: start as u64,
                range_end: end as u64,
                residue: self.residue,
            });
            start = end + 1;
        }
        Ok(pieces)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.range_start, self.range_end)?;
        if let Some(r) = self.residue {
            write!(f, " residue {} (mod 12)", r)?;
        }
        Ok(())
    }
}

/// Point-in-time counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Values yielded by `next`.
    pub produced: u64,
    /// Lookups answered from this node's own cache.
    pub cache_hits: u64,
    /// Lookups that failed along the whole chain ending at this node.
    pub cache_misses: u64,
    /// Lookups this node passed on to its parent.
    pub parent_lookups: u64,
    /// Values currently cached.
    pub cached: usize,
    /// Cache slots currently allocated.
    pub cache_capacity: usize,
}

/// Scan position. `None` once the range is exhausted, which also covers a
/// cursor that would step past `u64::MAX`.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    next: Option<u64>,
}

/// Discovered values in discovery order, no duplicates.
#[derive(Debug, Default)]
struct ValueCache {
    values: Vec<u64>,
    /// Largest cached value. Anything above it is known to be absent,
    /// which keeps ascending inserts from `next` free of a full scan.
    largest: Option<u64>,
}

impl ValueCache {
    #[inline]
    fn contains(&self, value: u64) -> bool {
        match self.largest {
            Some(largest) if value <= largest => self.values.contains(&value),
            _ => false,
        }
    }

    fn insert(&mut self, value: u64) -> Result<bool, PartitionError> {
        if self.contains(value) {
            return Ok(false);
        }
        if self.values.len() == self.values.capacity() {
            let grow = self.values.capacity().max(1);
            self.values
                .try_reserve_exact(grow)
                .map_err(|_| PartitionError::AllocationFailed {
                    requested: self.values.capacity() + grow,
                })?;
        }
        self.values.push(value);
        self.largest = Some(self.largest.map_or(value, |l| l.max(value)));
        Ok(true)
    }
}

/// One generator in the partition tree.
pub struct PartitionNode<'p> {
    partition: Partition,
    parent: Option<&'p PartitionNode<'p>>,
    initial_capacity: usize,

    cache: RwLock<ValueCache>,
    cursor: Mutex<Cursor>,

    produced: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    parent_lookups: AtomicU64,
}

impl<'p> PartitionNode<'p> {
    /// Creates a parentless node.
    pub fn root(range_start: u64, range_end: u64, filter: i32) -> Result<Self, PartitionError> {
        Self::with_capacity(
            Partition::new(range_start, range_end, filter)?,
            None,
            DEFAULT_CACHE_CAPACITY,
        )
    }

    /// Creates a node that delegates cache misses to `self`.
    pub fn child(
        &'p self,
        range_start: u64,
        range_end: u64,
        filter: i32,
    ) -> Result<PartitionNode<'p>, PartitionError> {
        Self::with_capacity(
            Partition::new(range_start, range_end, filter)?,
            Some(self),
            self.initial_capacity,
        )
    }

    /// Creates a node with an explicit initial cache size.
    pub fn with_capacity(
        partition: Partition,
        parent: Option<&'p PartitionNode<'p>>,
        capacity: usize,
    ) -> Result<Self, PartitionError> {
        let partition = Partition::new(partition.range_start, partition.range_end, partition.filter())?;
        let mut cache = Vec::new();
        cache
            .try_reserve_exact(capacity)
            .map_err(|_| PartitionError::AllocationFailed { requested: capacity })?;

        log::trace!(
            "Created partition node {} ({})",
            partition,
            if parent.is_some() { "child" } else { "root" }
        );

        Ok(PartitionNode {
            partition,
            parent,
            initial_capacity: capacity,
            cache: RwLock::new(ValueCache {
                values: cache,
                largest: None,
            }),
            cursor: Mutex::new(Cursor {
                next: partition.first_candidate(),
            }),
            produced: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            parent_lookups: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    #[inline]
    pub fn parent(&self) -> Option<&'p PartitionNode<'p>> {
        self.parent
    }

    /// Yields the next prime in the partition, or `None` once the range is
    /// exhausted. Each value is produced exactly once, in ascending order.
    pub fn next(&self) -> Option<u64> {
        let mut cursor = self.cursor.lock();
        let step = self.partition.step();

        while let Some(candidate) = cursor.next {
            cursor.next = candidate
                .checked_add(step)
                .filter(|&c| c <= self.partition.range_end);

            // Filtered cursors only ever land on their own residue class.
            if primes::is_prime(candidate) {
                self.produced.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.insert_cached(candidate) {
                    log::warn!("Partition {} could not cache {}: {}", self.partition, candidate, e);
                }
                return Some(candidate);
            }
        }
        None
    }

    /// Calls `next` up to `max` times. Returns how many values were found.
    pub fn prefill(&self, max: usize) -> usize {
        let mut count = 0;
        while count < max && self.next().is_some() {
            count += 1;
        }
        log::debug!("Prefilled partition {} with {} values", self.partition, count);
        count
    }

    /// Looks `value` up in this node's cache and then each ancestor's.
    ///
    /// A hit is counted on the node that holds the value and every hop
    /// upward is counted as a parent lookup on the node that delegated. A
    /// value found nowhere counts one miss, on the topmost node. Delegated
    /// hits are not copied into this node's cache.
    pub fn contains_cached(&self, value: u64) -> bool {
        let mut node: &PartitionNode<'_> = self;
        loop {
            if node.cache.read().contains(value) {
                node.cache_hits.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            match node.parent {
                Some(parent) => {
                    node.parent_lookups.fetch_add(1, Ordering::Relaxed);
                    node = parent;
                }
                None => {
                    node.cache_misses.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }
    }

    /// Cache-first primality test. A prime found by trial division is
    /// cached here when it belongs to this partition.
    pub fn is_prime(&self, value: u64) -> bool {
        if self.contains_cached(value) {
            return true;
        }
        let prime = primes::is_prime(value);
        if prime && self.in_partition(value) {
            if let Err(e) = self.insert_cached(value) {
                log::warn!("Partition {} could not cache {}: {}", self.partition, value, e);
            }
        }
        prime
    }

    /// Adds `value` to the cache. Returns whether it was newly inserted.
    pub fn cache_value(&self, value: u64) -> Result<bool, PartitionError> {
        if !self.in_partition(value) {
            return Err(PartitionError::OutOfPartition {
                value,
                start: self.partition.range_start,
                end: self.partition.range_end,
                residue: self.partition.residue,
            });
        }
        self.insert_cached(value)
    }

    fn insert_cached(&self, value: u64) -> Result<bool, PartitionError> {
        self.cache.write().insert(value)
    }

    #[inline]
    pub fn in_partition(&self, value: u64) -> bool {
        self.partition.contains(value)
    }

    /// `hits / (hits + misses) * 100`, or 0 before any lookup.
    pub fn cache_efficiency(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64 * 100.0
    }

    pub fn stats(&self) -> NodeStats {
        let cache = self.cache.read();
        NodeStats {
            produced: self.produced.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            parent_lookups: self.parent_lookups.load(Ordering::Relaxed),
            cached: cache.values.len(),
            cache_capacity: cache.values.capacity(),
        }
    }

    /// Zeroes the counters. Cache contents and cursor are untouched.
    pub fn reset_stats(&self) {
        self.produced.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.parent_lookups.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the cache in discovery order.
    pub fn cached_values(&self) -> Vec<u64> {
        self.cache.read().values.clone()
    }

    /// The twelve children covering this node's range, one per residue
    /// class, in class order.
    pub fn residue_children(&'p self) -> Result<Vec<PartitionNode<'p>>, PartitionError> {
        (0..RESIDUE_CLASSES as i32)
            .map(|r| self.child(self.partition.range_start, self.partition.range_end, r))
            .collect()
    }

    /// Contiguous sub-range children sharing this node's filter.
    pub fn split(&'p self, parts: usize) -> Result<Vec<PartitionNode<'p>>, PartitionError> {
        self.partition
            .split(parts)?
            .into_iter()
            .map(|piece| Self::with_capacity(piece, Some(self), self.initial_capacity))
            .collect()
    }

    /// Checks that every cached value is unique and belongs to the
    /// partition.
    pub fn validate(&self) -> bool {
        let cache = self.cache.read();
        if let Some(&stray) = cache.values.iter().find(|&&v| !self.partition.contains(v)) {
            log::warn!("Partition {} caches out-of-range value {}", self.partition, stray);
            return false;
        }
        let mut sorted = cache.values.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            log::warn!("Partition {} caches a value twice", self.partition);
            return false;
        }
        true
    }
}

impl fmt::Debug for PartitionNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionNode")
            .field("partition", &self.partition)
            .field("has_parent", &self.parent.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl fmt::Display for PartitionNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        let cursor = self.cursor.lock().next;
        write!(f, "partition {}", self.partition)?;
        match cursor {
            Some(c) => write!(f, ", next candidate {}", c)?,
            None => write!(f, ", exhausted")?,
        }
        write!(
            f,
            ", {} produced, cache {}/{}, {} hits, {} misses, {} parent lookups, {:.2}% efficiency{}",
            stats.produced,
            stats.cached,
            stats.cache_capacity,
            stats.cache_hits,
            stats.cache_misses,
            stats.parent_lookups,
            self.cache_efficiency(),
            if self.parent.is_some() { ", has parent" } else { "" },
        )
    }
}
