//! Root / mid-level / leaf coordination.
//!
//! A run wires the three building blocks together:
//!
//! 1. The root node covers the whole configured range and discovers the
//!    first `seed_limit` primes on its own.
//! 2. The configuration is published as a `ReadOnly` region and a
//!    `LockedWrite` accumulator region holds one little-endian `u64`
//!    counter per residue class.
//! 3. One mid-level coordinator thread per residue class owns a child of
//!    the root, splits the child's range into [`WorkItem`]s on its own
//!    [`ConcurrentQueue`] and runs leaf workers that drain those items.
//!    `leaf_workers` sets the number of items; the number of leaf threads
//!    is capped at the CPU count, so extra items just queue up.
//!    Leaves push every value they find onto a shared results queue and ask
//!    the mid-level child whether an ancestor already knew it, which walks
//!    the delegation chain up to the root's seeded cache.
//! 4. Each coordinator adds its class total to the accumulator under the
//!    write lock, and the root collects everything into a
//!    [`HierarchyReport`].

use std::thread;

use lattice_sync::{AccessMode, ConcurrentQueue, QueueConfig, QueueStats, SharedRegion};

use crate::config::HierarchyConfig;
use crate::error::{ConfigError, HierarchyError, PartitionError};
use crate::node::{NodeStats, Partition, PartitionNode, NO_FILTER};
use crate::primes::RESIDUE_CLASSES;

const COUNTER_BYTES: usize = std::mem::size_of::<u64>();

/// One unit of leaf work: a contiguous slice of a residue class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub residue: u8,
    pub partition: Partition,
}

/// Outcome of a [`Hierarchy::run`].
#[derive(Debug, Clone)]
pub struct HierarchyReport {
    /// Every prime in the configured range, ascending.
    pub values: Vec<u64>,
    /// Primes found per residue class, read back from the accumulator.
    pub per_residue: [u64; RESIDUE_CLASSES],
    /// Values the leaves found that the root had already seeded.
    pub seeded: u64,
    /// Accumulator version after the run: one write per residue class.
    pub accumulator_version: u64,
    pub root_stats: NodeStats,
    /// Counters of the shared results queue.
    pub queue_stats: QueueStats,
}

/// Per-class outcome of one mid-level coordinator.
#[derive(Debug, Clone, Copy, Default)]
struct ClassTally {
    found: u64,
    seeded: u64,
}

/// Runs a full root → residue class → leaf pass.
pub struct Hierarchy;

impl Hierarchy {
    pub fn run(config: &HierarchyConfig) -> Result<HierarchyReport, HierarchyError> {
        config.validate()?;
        log::info!(
            "Starting hierarchy over [{}, {}] with {} leaf workers per class",
            config.range_start,
            config.range_end,
            config.leaf_workers
        );

        let root = PartitionNode::with_capacity(
            Partition::new(config.range_start, config.range_end, NO_FILTER)?,
            None,
            config.cache_capacity,
        )?;
        let seeded = root.prefill(config.seed_limit);
        log::debug!("Root seeded {} values", seeded);

        let published = SharedRegion::from_vec(
            config.to_toml_string()?.into_bytes(),
            AccessMode::ReadOnly,
        )?;
        let accumulator =
            SharedRegion::new(RESIDUE_CLASSES * COUNTER_BYTES, AccessMode::LockedWrite)?;
        let results = ConcurrentQueue::with_config(QueueConfig {
            pool_capacity: config.queue_pool_capacity,
        });

        let children = root.residue_children()?;

        let tallies = thread::scope(|s| {
            let handles: Vec<_> = children
                .iter()
                .enumerate()
                .map(|(residue, child)| {
                    let published = &published;
                    let accumulator = &accumulator;
                    let results = &results;
                    let handle = s.spawn(move || {
                        coordinate_class(residue as u8, child, published, accumulator, results)
                    });
                    (residue as u8, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(residue, handle)| {
                    handle
                        .join()
                        .map_err(|_| HierarchyError::WorkerPanicked { residue })
                        .and_then(|tally| tally)
                })
                .collect::<Result<Vec<ClassTally>, HierarchyError>>()
        })?;

        let per_residue = read_counters(&accumulator)?;
        let mut values = results.drain();
        values.sort_unstable();

        let report = HierarchyReport {
            seeded: tallies.iter().map(|t| t.seeded).sum(),
            values,
            per_residue,
            accumulator_version: accumulator.version(),
            root_stats: root.stats(),
            queue_stats: results.stats(),
        };
        log::info!(
            "Hierarchy finished: {} values, {} already seeded by the root",
            report.values.len(),
            report.seeded
        );
        Ok(report)
    }
}

/// Mid-level coordinator for one residue class.
fn coordinate_class(
    residue: u8,
    child: &PartitionNode<'_>,
    published: &SharedRegion<'_>,
    accumulator: &SharedRegion<'_>,
    results: &ConcurrentQueue<u64>,
) -> Result<ClassTally, HierarchyError> {
    let config = {
        let bytes = published.acquire_read();
        let text = std::str::from_utf8(&bytes).map_err(|e| ConfigError::Parse(e.to_string()))?;
        HierarchyConfig::from_toml_str(text)?
    };

    let work = ConcurrentQueue::with_config(QueueConfig {
        pool_capacity: config.queue_pool_capacity,
    });
    let items = child.partition().split(config.leaf_workers)?;
    let dispatched = work.enqueue_batch(items.into_iter().map(|partition| WorkItem { residue, partition }));
    let workers = leaf_threads(dispatched, num_cpus::get());
    log::debug!(
        "Class {} dispatched {} work items to {} leaf threads",
        residue,
        dispatched,
        workers
    );

    let tally = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| s.spawn(|| run_leaf(child, &work, results, config.cache_capacity)))
            .collect();

        let mut tally = ClassTally::default();
        for handle in handles {
            let leaf = handle
                .join()
                .map_err(|_| HierarchyError::WorkerPanicked { residue })??;
            tally.found += leaf.found;
            tally.seeded += leaf.seeded;
        }
        Ok::<_, HierarchyError>(tally)
    })?;

    add_to_counter(accumulator, residue, tally.found)?;
    log::debug!("Class {} found {} values ({} seeded)", residue, tally.found, tally.seeded);
    Ok(tally)
}

/// Number of leaf threads for `items` queued work items.
fn leaf_threads(items: usize, cpus: usize) -> usize {
    items.min(cpus.max(1))
}

/// Leaf worker: drains work items until the class queue runs dry.
fn run_leaf(
    parent: &PartitionNode<'_>,
    work: &ConcurrentQueue<WorkItem>,
    results: &ConcurrentQueue<u64>,
    cache_capacity: usize,
) -> Result<ClassTally, PartitionError> {
    let mut tally = ClassTally::default();
    while let Some(item) = work.dequeue() {
        let leaf = PartitionNode::with_capacity(item.partition, Some(parent), cache_capacity)?;
        while let Some(value) = leaf.next() {
            if parent.contains_cached(value) {
                tally.seeded += 1;
            }
            results.enqueue(value);
            tally.found += 1;
        }
        log::trace!("Leaf finished {} for class {}", item.partition, item.residue);
    }
    Ok(tally)
}

fn counter_range(residue: u8) -> std::ops::Range<usize> {
    let offset = residue as usize * COUNTER_BYTES;
    offset..offset + COUNTER_BYTES
}

fn add_to_counter(
    accumulator: &SharedRegion<'_>,
    residue: u8,
    amount: u64,
) -> Result<(), HierarchyError> {
    let mut guard = accumulator.acquire_write()?;
    let slot = guard
        .get_mut(counter_range(residue))
        .ok_or_else(|| HierarchyError::CorruptAccumulator(format!("no slot for class {}", residue)))?;
    let mut current = [0u8; COUNTER_BYTES];
    current.copy_from_slice(slot);
    let updated = u64::from_le_bytes(current).wrapping_add(amount);
    slot.copy_from_slice(&updated.to_le_bytes());
    Ok(())
}

fn read_counters(
    accumulator: &SharedRegion<'_>,
) -> Result<[u64; RESIDUE_CLASSES], HierarchyError> {
    let guard = accumulator.acquire_read();
    let mut counters = [0u64; RESIDUE_CLASSES];
    for (residue, counter) in counters.iter_mut().enumerate() {
        let slot = guard
            .get(counter_range(residue as u8))
            .ok_or_else(|| HierarchyError::CorruptAccumulator(format!("no slot for class {}", residue)))?;
        let mut bytes = [0u8; COUNTER_BYTES];
        bytes.copy_from_slice(slot);
        *counter = u64::from_le_bytes(bytes);
    }
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primes;

    fn small_config() -> HierarchyConfig {
        HierarchyConfig {
            range_start: 2,
            range_end: 2_000,
            seed_limit: 50,
            leaf_workers: 3,
            cache_capacity: 64,
            queue_pool_capacity: 32,
        }
    }

    #[test]
    fn finds_every_prime_once() {
        let config = small_config();
        let report = Hierarchy::run(&config).unwrap();

        let expected: Vec<u64> = (2..=2_000).filter(|&n| primes::is_prime(n)).collect();
        assert_eq!(report.values, expected);
        assert_eq!(report.queue_stats.enqueued, expected.len() as u64);
        assert_eq!(report.queue_stats.dequeued, expected.len() as u64);
    }

    #[test]
    fn accumulator_matches_distribution() {
        let report = Hierarchy::run(&small_config()).unwrap();
        let distribution = primes::residue_distribution(2, 2_000);
        for class in 0..RESIDUE_CLASSES {
            assert_eq!(report.per_residue[class], distribution[class] as u64);
        }
        assert_eq!(report.accumulator_version, RESIDUE_CLASSES as u64);
    }

    #[test]
    fn seeded_values_are_found_through_the_root() {
        let report = Hierarchy::run(&small_config()).unwrap();
        assert_eq!(report.root_stats.cached, 50);
        assert_eq!(report.seeded, 50);
        assert_eq!(report.root_stats.cache_hits, 50);
        assert_eq!(
            report.root_stats.cache_misses,
            report.values.len() as u64 - 50
        );
    }

    #[test]
    fn counter_slots_are_disjoint() {
        let region = SharedRegion::new(RESIDUE_CLASSES * COUNTER_BYTES, AccessMode::LockedWrite).unwrap();
        add_to_counter(&region, 0, 3).unwrap();
        add_to_counter(&region, 11, 9).unwrap();
        add_to_counter(&region, 11, 1).unwrap();
        let counters = read_counters(&region).unwrap();
        assert_eq!(counters[0], 3);
        assert_eq!(counters[11], 10);
        assert_eq!(counters[1..11].iter().sum::<u64>(), 0);
        assert_eq!(region.version(), 3);
    }

    #[test]
    fn leaf_threads_never_exceed_cpus() {
        assert_eq!(leaf_threads(100_000, 8), 8);
        assert_eq!(leaf_threads(3, 8), 3);
        assert_eq!(leaf_threads(0, 8), 0);
        assert_eq!(leaf_threads(5, 0), 1);
    }

    #[test]
    fn invalid_config_is_rejected_before_any_work() {
        let config = HierarchyConfig {
            leaf_workers: 0,
            ..small_config()
        };
        assert!(matches!(
            Hierarchy::run(&config),
            Err(HierarchyError::Config(ConfigError::NoLeafWorkers))
        ));
    }
}
