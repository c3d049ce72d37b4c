use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::node::DEFAULT_CACHE_CAPACITY;
use lattice_sync::DEFAULT_POOL_CAPACITY;

/// Settings for a [`Hierarchy`](crate::Hierarchy) run.
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HierarchyConfig {
    /// First value of the root partition.
    pub range_start: u64,

    /// Last value of the root partition (inclusive).
    pub range_end: u64,

    /// Upper bound on how many values the root discovers before the
    /// residue children are created.
    pub seed_limit: usize,

    /// Work items per residue class. Leaf threads are capped at the CPU
    /// count and drain these items from the class queue.
    pub leaf_workers: usize,

    /// Initial cache slots of every node.
    pub cache_capacity: usize,

    /// Recycled nodes kept by each work queue.
    pub queue_pool_capacity: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            range_start: 2,
            range_end: 100_000,
            seed_limit: 1_000,
            leaf_workers: 2,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            queue_pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl HierarchyConfig {
    /// Parses a TOML document and validates the result.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HierarchyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.range_start > self.range_end {
            return Err(ConfigError::EmptyRange {
                start: self.range_start,
                end: self.range_end,
            });
        }
        if self.leaf_workers == 0 {
            return Err(ConfigError::NoLeafWorkers);
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(HierarchyConfig::from_toml_str("").unwrap(), HierarchyConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = HierarchyConfig::from_toml_str(
            r#"
            range_end = 5000
            leaf_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.range_start, 2);
        assert_eq!(config.range_end, 5000);
        assert_eq!(config.leaf_workers, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(
            HierarchyConfig::from_toml_str("range_start = 10\nrange_end = 5"),
            Err(ConfigError::EmptyRange { start: 10, end: 5 })
        );
        assert_eq!(
            HierarchyConfig::from_toml_str("leaf_workers = 0"),
            Err(ConfigError::NoLeafWorkers)
        );
        assert_eq!(
            HierarchyConfig::from_toml_str("cache_capacity = 0"),
            Err(ConfigError::ZeroCacheCapacity)
        );
        assert!(matches!(
            HierarchyConfig::from_toml_str("unknown_key = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn serialized_form_parses_back() {
        let config = HierarchyConfig {
            range_end: 777,
            seed_limit: 10,
            ..HierarchyConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("range_end = 777"));
        assert_eq!(HierarchyConfig::from_toml_str(&text).unwrap(), config);
    }
}
