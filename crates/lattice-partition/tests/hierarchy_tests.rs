//! End-to-end runs of the hierarchy coordinator.

use lattice_partition::{
    is_prime, residue_distribution, Hierarchy, HierarchyConfig, HierarchyError, PartitionNode,
    NO_FILTER, PRIME_RESIDUES,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn default_config_from_toml() {
    init_logger();

    let config = HierarchyConfig::from_toml_str(
        r#"
        range_end = 20000
        seed_limit = 200
        leaf_workers = 4
        "#,
    )
    .unwrap();
    let report = Hierarchy::run(&config).unwrap();

    let expected: Vec<u64> = (2..=20_000).filter(|&n| is_prime(n)).collect();
    assert_eq!(report.values, expected);
    assert_eq!(report.seeded, 200);
    assert_eq!(report.per_residue.iter().sum::<u64>(), expected.len() as u64);
}

#[test]
fn only_prime_bearing_classes_grow_past_three() {
    init_logger();

    let config = HierarchyConfig {
        range_start: 4,
        range_end: 10_000,
        seed_limit: 0,
        leaf_workers: 2,
        ..HierarchyConfig::default()
    };
    let report = Hierarchy::run(&config).unwrap();

    for (class, &count) in report.per_residue.iter().enumerate() {
        if PRIME_RESIDUES.contains(&(class as u8)) {
            assert!(count > 0, "class {} is empty", class);
        } else {
            assert_eq!(count, 0, "class {} holds primes", class);
        }
    }
    assert_eq!(report.seeded, 0);
    assert_eq!(report.root_stats.cache_hits, 0);
}

#[test]
fn more_workers_than_values() {
    init_logger();

    let config = HierarchyConfig {
        range_start: 2,
        range_end: 30,
        seed_limit: 3,
        leaf_workers: 16,
        ..HierarchyConfig::default()
    };
    let report = Hierarchy::run(&config).unwrap();
    assert_eq!(report.values, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);

    let distribution = residue_distribution(2, 30);
    for class in 0..12 {
        assert_eq!(report.per_residue[class], distribution[class] as u64);
    }
}

#[test]
fn huge_leaf_worker_count_drains_on_few_threads() {
    init_logger();

    let config = HierarchyConfig {
        range_start: 2,
        range_end: 5_000,
        seed_limit: 20,
        leaf_workers: 100_000,
        cache_capacity: 16,
        ..HierarchyConfig::default()
    };
    let report = Hierarchy::run(&config).unwrap();

    let expected: Vec<u64> = (2..=5_000).filter(|&n| is_prime(n)).collect();
    assert_eq!(report.values, expected);
    assert_eq!(report.seeded, 20);
}

#[test]
fn empty_range_is_a_config_error() {
    let config = HierarchyConfig {
        range_start: 50,
        range_end: 10,
        ..HierarchyConfig::default()
    };
    assert!(matches!(Hierarchy::run(&config), Err(HierarchyError::Config(_))));
}

#[test]
fn residue_children_share_across_threads() {
    init_logger();

    let root = PartitionNode::root(2, 5_000, NO_FILTER).unwrap();
    root.prefill(100);
    let children = root.residue_children().unwrap();

    let found: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = children
            .iter()
            .map(|child| s.spawn(move || std::iter::from_fn(|| child.next()).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Every child asks the root about its own values concurrently.
    std::thread::scope(|s| {
        for (child, values) in children.iter().zip(&found) {
            s.spawn(move || {
                for &v in values {
                    assert!(child.contains_cached(v));
                }
            });
        }
    });

    let mut all: Vec<u64> = found.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all, (2..=5_000).filter(|&n| is_prime(n)).collect::<Vec<_>>());

    // Children hold their own values, so nothing reached the root.
    assert_eq!(root.stats().cache_hits + root.stats().cache_misses, 0);
    assert!(children.iter().all(|c| c.validate()));
}
