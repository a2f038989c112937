//! CANOPY - Engine Configuration
//! Defines tunable parameters shared by every database and data source in a context.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CanopyError, Result};

/// Configuration for the Canopy storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database directory used when no explicit path is given.
    pub default_storage_dir: PathBuf,

    /// Number of table slots per database.
    pub max_tables: usize,

    /// Size of the compaction thread pool shared by all data sources of a context.
    pub compaction_threads: usize,

    /// Number of files in one size tier that triggers a merge.
    pub compaction_threshold: usize,

    /// Size multiplier between compaction tiers.
    pub compaction_size_ratio: u64,

    /// Upper bound of the smallest compaction tier, in bytes.
    pub compaction_base_tier_bytes: u64,

    /// Slots in the direct-mapped leaf record cache. Zero disables the cache.
    pub leaf_record_cache_size: usize,

    /// Rebuild path indices from data files even if index files exist.
    pub force_index_rebuilding: bool,

    /// Accept metadata files written in the legacy layout.
    pub legacy_metadata_fallback: bool,

    /// How long `close()` waits for a data source's executors to drain.
    pub executor_shutdown_timeout: Duration,

    /// Whether to fsync data files and metadata once they are complete.
    pub sync_writes: bool,

    /// Typical serialized key size, used for flush size estimates.
    pub estimated_key_size: usize,

    /// Typical serialized value size, used for flush size estimates.
    pub estimated_value_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_storage_dir: PathBuf::from("./data/canopy"),
            max_tables: 1024,
            compaction_threads: 3,
            compaction_threshold: 3,
            compaction_size_ratio: 10,
            compaction_base_tier_bytes: 4 * 1024 * 1024, // 4 MB
            leaf_record_cache_size: 1 << 16,
            force_index_rebuilding: false,
            legacy_metadata_fallback: true,
            executor_shutdown_timeout: Duration::from_secs(5 * 60),
            sync_writes: true,
            estimated_key_size: 32,
            estimated_value_size: 128,
        }
    }
}

impl Config {
    /// Create a new Config with a custom default storage directory.
    pub fn new(default_storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_storage_dir: default_storage_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables = max_tables;
        self
    }

    pub fn with_compaction_threads(mut self, threads: usize) -> Self {
        self.compaction_threads = threads;
        self
    }

    /// Set the number of same-tier files that triggers a merge.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_leaf_record_cache_size(mut self, size: usize) -> Self {
        self.leaf_record_cache_size = size;
        self
    }

    pub fn with_force_index_rebuilding(mut self, force: bool) -> Self {
        self.force_index_rebuilding = force;
        self
    }

    pub fn with_legacy_metadata_fallback(mut self, enabled: bool) -> Self {
        self.legacy_metadata_fallback = enabled;
        self
    }

    pub fn with_executor_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.executor_shutdown_timeout = timeout;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Check values that would otherwise fail much later.
    pub fn validate(&self) -> Result<()> {
        if self.max_tables == 0 {
            return Err(CanopyError::Config("max_tables must be positive".into()));
        }
        if self.compaction_threads == 0 {
            return Err(CanopyError::Config(
                "compaction_threads must be positive".into(),
            ));
        }
        if self.compaction_threshold < 2 {
            return Err(CanopyError::Config(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        if self.compaction_size_ratio < 2 {
            return Err(CanopyError::Config(
                "compaction_size_ratio must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the default storage directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.default_storage_dir)
    }
}
