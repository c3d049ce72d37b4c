//! Property-based tests for partition nodes.
//!
//! Uses proptest to generate random ranges and filters and check that the
//! generators and caches keep their invariants.

use lattice_partition::{is_prime, Partition, PartitionNode, NO_FILTER, PRIME_RESIDUES};
use proptest::prelude::*;

/// Strategy for small, non-empty ranges.
fn range() -> impl Strategy<Value = (u64, u64)> {
    (0u64..20_000, 0u64..2_000).prop_map(|(start, len)| (start, start + len))
}

/// Strategy for filters: unfiltered or one of the twelve classes.
fn filter() -> impl Strategy<Value = i32> {
    prop_oneof![Just(NO_FILTER), 0i32..12]
}

fn drain(node: &PartitionNode<'_>) -> Vec<u64> {
    std::iter::from_fn(|| node.next()).collect()
}

proptest! {
    /// Draining yields a strictly increasing sequence inside the partition
    #[test]
    fn drain_is_sorted_and_in_partition((start, end) in range(), filter in filter()) {
        let node = PartitionNode::root(start, end, filter).unwrap();
        let values = drain(&node);

        prop_assert!(values.windows(2).all(|w| w[0] < w[1]));
        for &v in &values {
            prop_assert!(v >= start && v <= end);
            prop_assert!(is_prime(v));
            if filter >= 0 {
                prop_assert_eq!((v % 12) as i32, filter);
            }
        }
        prop_assert_eq!(node.stats().produced, values.len() as u64);
        prop_assert!(node.validate());
    }

    /// The sequence is complete: nothing qualifying is skipped
    #[test]
    fn drain_is_complete((start, end) in range(), filter in filter()) {
        let partition = Partition::new(start, end, filter).unwrap();
        let expected: Vec<u64> = (start..=end)
            .filter(|&n| partition.contains(n) && is_prime(n))
            .collect();
        let node = PartitionNode::root(start, end, filter).unwrap();
        prop_assert_eq!(drain(&node), expected);
    }

    /// Every prime above 3 sits in one of the four prime-bearing classes
    #[test]
    fn twelve_fold_symmetry(n in 4u64..1_000_000) {
        if is_prime(n) {
            prop_assert!(PRIME_RESIDUES.contains(&((n % 12) as u8)));
        }
    }

    /// A value the parent cached is found through exactly one parent lookup
    #[test]
    fn parent_cache_is_visible_to_child((start, end) in range(), seeds in 1usize..50) {
        let root = PartitionNode::root(start, end, NO_FILTER).unwrap();
        root.prefill(seeds);
        let child = root.child(start, end, NO_FILTER).unwrap();

        for (i, v) in root.cached_values().into_iter().enumerate() {
            prop_assert!(child.contains_cached(v));
            prop_assert_eq!(child.stats().parent_lookups, i as u64 + 1);
        }
        prop_assert_eq!(child.stats().cached, 0);
    }

    /// Splitting covers the range exactly, in order and without overlap
    #[test]
    fn split_covers_range((start, end) in range(), parts in 1usize..16, filter in filter()) {
        let partition = Partition::new(start, end, filter).unwrap();
        let pieces = partition.split(parts).unwrap();

        prop_assert!(!pieces.is_empty() && pieces.len() <= parts);
        prop_assert_eq!(pieces[0].range_start(), start);
        prop_assert_eq!(pieces[pieces.len() - 1].range_end(), end);
        for w in pieces.windows(2) {
            prop_assert_eq!(w[0].range_end() + 1, w[1].range_start());
        }
        prop_assert!(pieces.iter().all(|p| p.residue() == partition.residue()));
    }

    /// Out-of-domain filters are rejected
    #[test]
    fn bad_filters_are_rejected(filter in prop_oneof![i32::MIN..-1, 12i32..i32::MAX]) {
        prop_assert!(PartitionNode::root(0, 10, filter).is_err());
    }
}
