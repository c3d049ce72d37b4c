use lattice_sync::RegionError;
use thiserror::Error;

/// Errors produced while building or using partition nodes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Invalid range: start {start} is greater than end {end}.")]
    InvalidRange { start: u64, end: u64 },

    #[error("Invalid residue filter {0}: expected -1 (none) or 0..=11.")]
    InvalidResidue(i32),

    #[error("Value {value} lies outside partition [{start}, {end}]{}.", residue_suffix(.residue))]
    OutOfPartition {
        value: u64,
        start: u64,
        end: u64,
        residue: Option<u8>,
    },

    #[error("Failed to grow partition cache to {requested} entries.")]
    AllocationFailed { requested: usize },

    #[error("Cannot split a partition into {0} parts.")]
    InvalidSplit(usize),
}

fn residue_suffix(residue: &Option<u8>) -> String {
    match residue {
        Some(r) => format!(" (residue {} mod 12)", r),
        None => String::new(),
    }
}

/// Errors reported by [`HierarchyConfig`](crate::HierarchyConfig) loading
/// and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse hierarchy configuration: {0}")]
    Parse(String),

    #[error("Failed to serialize hierarchy configuration: {0}")]
    Serialize(String),

    #[error("Configured range is empty: start {start} is greater than end {end}.")]
    EmptyRange { start: u64, end: u64 },

    #[error("At least one leaf worker per residue class is required.")]
    NoLeafWorkers,

    #[error("Cache capacity must be greater than zero.")]
    ZeroCacheCapacity,
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::Serialize(err.to_string())
    }
}

/// Errors from a full [`Hierarchy`](crate::Hierarchy) run.
#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Shared region error: {0}")]
    Region(#[from] RegionError),

    #[error("Worker for residue class {residue} panicked.")]
    WorkerPanicked { residue: u8 },

    #[error("Accumulator region is corrupt: {0}")]
    CorruptAccumulator(String),
}
