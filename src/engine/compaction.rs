//! CANOPY - Compaction
//! Merges data files of a store to reclaim space held by superseded items.
//!
//! ## Size-Tiered Strategy
//! - Group files by size tier (e.g., 4MB, 40MB, 400MB)
//! - When N files accumulate in a tier, merge them into one file one level up
//! - Only items the index still points at are copied
//!
//! ## Pause Gate
//! The final step of a compaction, where index entries are switched to the new file
//! and old files are deleted, runs under a [`PauseGate`] permit. Snapshots close the
//! gate, so they never see a half-switched index.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::executor::CancelToken;
use super::file_collection::DataFileCollection;
use super::metrics::{DataSourceMetrics, StoreKind};
use crate::error::Result;
use crate::types::Path;

/// Trait defining a compaction strategy.
pub trait CompactionStrategy: Send + Sync {
    /// Select which files should be compacted together.
    /// Returns the indices of the files to merge.
    fn select_compaction(&self, files: &[DataFileInfo]) -> Option<Vec<u32>>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Metadata about a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileInfo {
    /// File index within its store.
    pub index: u32,
    /// Size in bytes.
    pub size: u64,
    /// Compaction level: 0 for flushed files.
    pub level: u16,
}

/// Size-tiered compaction strategy.
///
/// ## Algorithm
/// - Define size tiers: T0 (0-4MB), T1 (4-40MB), T2 (40-400MB), ...
/// - When a tier has >= `threshold` files, compact them into one file
///
/// ## Example
/// ```
/// // T0: [1MB, 2MB, 3MB] (3 files >= threshold 3)
/// // => Compact into one 6MB file
/// ```
pub struct SizeTieredCompaction {
    /// Number of files per tier before triggering compaction.
    threshold: usize,
    /// Size multiplier between tiers (default: 10x).
    size_ratio: u64,
    /// Upper bound of tier 0.
    base_tier_bytes: u64,
}

impl SizeTieredCompaction {
    /// Create a new size-tiered compaction strategy.
    ///
    /// # Arguments
    /// * `threshold` - Number of files to accumulate before compacting (typically 3)
    /// * `size_ratio` - Multiplier between tiers (typically 10)
    /// * `base_tier_bytes` - Upper bound of the smallest tier (typically 4MB)
    pub fn new(threshold: usize, size_ratio: u64, base_tier_bytes: u64) -> Self {
        Self {
            threshold: threshold.max(2),
            size_ratio: size_ratio.max(2),
            base_tier_bytes: base_tier_bytes.max(1),
        }
    }

    /// Get the tier level for a given file size.
    fn tier_for_size(&self, size: u64) -> usize {
        let mut tier = 0;
        let mut upper_bound = self.base_tier_bytes;

        while size > upper_bound {
            tier += 1;
            upper_bound = upper_bound.saturating_mul(self.size_ratio);
        }
        tier
    }
}

impl CompactionStrategy for SizeTieredCompaction {
    fn select_compaction(&self, files: &[DataFileInfo]) -> Option<Vec<u32>> {
        // Group files by tier
        let mut tiers: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for file in files {
            tiers
                .entry(self.tier_for_size(file.size))
                .or_default()
                .push(file.index);
        }

        // Find the first tier with >= threshold files
        tiers
            .into_values()
            .find(|indices| indices.len() >= self.threshold)
    }

    fn name(&self) -> &str {
        "SizeTieredCompaction"
    }
}

/// Merges every file once `threshold` files exist. Stores with tombstones need this:
/// a tombstone can only be dropped when every older file is part of the same merge.
pub struct FullMergeCompaction {
    threshold: usize,
}

impl FullMergeCompaction {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(2),
        }
    }
}

impl CompactionStrategy for FullMergeCompaction {
    fn select_compaction(&self, files: &[DataFileInfo]) -> Option<Vec<u32>> {
        if files.len() < self.threshold {
            return None;
        }
        Some(files.iter().map(|f| f.index).collect())
    }

    fn name(&self) -> &str {
        "FullMergeCompaction"
    }
}

/// What an index entry of a stored item is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Path(Path),
    Key(Bytes),
}

/// A store whose files can be compacted.
pub trait Compactable: Send + Sync {
    fn files(&self) -> &DataFileCollection;

    /// Index key of an item payload, or `None` if the item is a tombstone.
    fn index_key(&self, payload: &[u8]) -> Result<Option<IndexKey>>;

    /// Whether the index still points at `location` for `key`.
    fn is_live(&self, key: &IndexKey, location: u64) -> Result<bool>;

    /// Move the index entry for `key` from `old` to `new` if it still points at `old`.
    fn relocate(&self, key: &IndexKey, old: u64, new: u64) -> Result<bool>;
}

#[derive(Debug, Default)]
struct GateState {
    paused: usize,
    active: usize,
}

/// Lets snapshots wait out, and hold off, the index-switching step of compactions.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

const GATE_POLL: Duration = Duration::from_millis(50);

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block new permits and wait until in-flight permits are released.
    /// Pauses nest: every `pause` needs a matching `resume`.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.paused += 1;
        while state.active > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = state.paused.saturating_sub(1);
        self.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused > 0
    }

    /// Wait until the gate is open and take a permit.
    /// Returns `Interrupted` if `cancel` fires while waiting.
    pub fn enter(&self, cancel: &CancelToken) -> Result<GatePermit<'_>> {
        let mut state = self.state.lock();
        while state.paused > 0 {
            cancel.check()?;
            self.changed.wait_for(&mut state, GATE_POLL);
        }
        cancel.check()?;
        state.active += 1;
        Ok(GatePermit { gate: self })
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a PauseGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.active -= 1;
        self.gate.changed.notify_all();
    }
}

/// Runs compactions of one store.
pub struct Compactor {
    table_name: String,
    kind: StoreKind,
    store: Arc<dyn Compactable>,
    strategy: Box<dyn CompactionStrategy>,
    gate: Arc<PauseGate>,
    metrics: Arc<DataSourceMetrics>,
}

impl Compactor {
    pub fn new(
        table_name: impl Into<String>,
        kind: StoreKind,
        store: Arc<dyn Compactable>,
        strategy: Box<dyn CompactionStrategy>,
        gate: Arc<PauseGate>,
        metrics: Arc<DataSourceMetrics>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            kind,
            store,
            strategy,
            gate,
            metrics,
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Run one compaction if the strategy selects any files.
    /// Returns whether files were merged.
    pub fn compact(&self, cancel: &CancelToken) -> Result<bool> {
        let collection = self.store.files();
        let Some(selected) = self.strategy.select_compaction(&collection.file_infos()) else {
            return Ok(false);
        };
        let inputs: Vec<_> = selected
            .iter()
            .filter_map(|index| collection.get_file(*index))
            .collect();
        if inputs.len() < 2 {
            return Ok(false);
        }

        let start = Instant::now();
        let input_size: u64 = inputs.iter().map(|f| f.size()).sum();
        let level = inputs.iter().map(|f| f.level()).max().unwrap_or(0).saturating_add(1);
        log::info!(
            "[{}] Compacting {} {} files ({} bytes) with {}",
            self.table_name,
            inputs.len(),
            self.kind,
            input_size,
            self.strategy.name()
        );

        let mut writer = collection.new_compaction_writer(level)?;
        let mut relocations = Vec::new();
        for input in &inputs {
            for entry in input.iter()? {
                cancel.check()?;
                let (location, item) = entry?;
                let Some(key) = self.store.index_key(&item.payload)? else {
                    continue;
                };
                if self.store.is_live(&key, location)? {
                    let new_location = writer.write(item.seq, &item.payload)?;
                    relocations.push((key, location, new_location));
                }
            }
        }
        cancel.check()?;

        let output = if writer.item_count() > 0 {
            Some(collection.finish_compaction_writer(writer)?)
        } else {
            drop(writer);
            None
        };
        let output_size = output.as_ref().map_or(0, |f| f.size());

        let permit = match self.gate.enter(cancel) {
            Ok(permit) => permit,
            Err(e) => {
                if let Some(output) = &output {
                    if let Err(remove_err) = std::fs::remove_file(output.path()) {
                        log::warn!(
                            "[{}] Failed to remove unused compaction output {:?}: {}",
                            self.table_name,
                            output.path(),
                            remove_err
                        );
                    }
                }
                return Err(e);
            }
        };
        if let Some(output) = output {
            collection.add_file(output);
        }
        let mut moved = 0usize;
        for (key, old, new) in &relocations {
            if self.store.relocate(key, *old, *new)? {
                moved += 1;
            }
        }
        let input_indices: Vec<u32> = inputs.iter().map(|f| f.index()).collect();
        collection.remove_files(&input_indices)?;
        drop(permit);

        let elapsed = start.elapsed();
        let saved = input_size.saturating_sub(output_size);
        self.metrics.record_compaction(self.kind, elapsed, saved);
        self.metrics.update_store_files(self.kind, collection);
        log::info!(
            "[{}] Compacted {} {} files in {:?}: {} items kept ({} moved), {} bytes saved",
            self.table_name,
            input_indices.len(),
            self.kind,
            elapsed,
            relocations.len(),
            moved,
            saved
        );
        Ok(true)
    }
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("table_name", &self.table_name)
            .field("kind", &self.kind)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn info(index: u32, size: u64) -> DataFileInfo {
        DataFileInfo {
            index,
            size,
            level: 0,
        }
    }

    #[test]
    fn test_tier_calculation() {
        let strategy = SizeTieredCompaction::new(4, 10, 4 * 1024 * 1024);

        assert_eq!(strategy.tier_for_size(0), 0);
        assert_eq!(strategy.tier_for_size(1024 * 1024), 0); // 1MB → T0
        assert_eq!(strategy.tier_for_size(4 * 1024 * 1024), 0); // 4MB → T0
        assert_eq!(strategy.tier_for_size(10 * 1024 * 1024), 1); // 10MB → T1
        assert_eq!(strategy.tier_for_size(40 * 1024 * 1024), 1); // 40MB → T1
        assert_eq!(strategy.tier_for_size(100 * 1024 * 1024), 2); // 100MB → T2
    }

    #[test]
    fn test_select_compaction_below_threshold() {
        let strategy = SizeTieredCompaction::new(4, 10, 4 * 1024 * 1024);
        let files = vec![info(0, 1024 * 1024), info(1, 2 * 1024 * 1024)];

        // Only 2 files, threshold is 4
        assert_eq!(strategy.select_compaction(&files), None);
    }

    #[test]
    fn test_select_compaction_trigger() {
        let strategy = SizeTieredCompaction::new(3, 10, 4 * 1024 * 1024);
        let files = vec![
            info(1, 1024 * 1024),
            info(2, 20 * 1024 * 1024),
            info(3, 3 * 1024 * 1024),
            info(4, 1024),
        ];

        // 3 files in T0, the 20MB file sits alone in T1
        assert_eq!(strategy.select_compaction(&files), Some(vec![1, 3, 4]));
    }

    #[test]
    fn test_full_merge_selects_everything() {
        let strategy = FullMergeCompaction::new(2);
        assert_eq!(strategy.select_compaction(&[info(5, 10)]), None);
        assert_eq!(
            strategy.select_compaction(&[info(5, 10), info(9, 1 << 30)]),
            Some(vec![5, 9])
        );
    }

    #[test]
    fn test_pause_waits_for_active_permit() {
        let gate = Arc::new(PauseGate::new());
        let cancel = CancelToken::new();
        let permit = gate.enter(&cancel).unwrap();

        let paused = Arc::new(AtomicBool::new(false));
        let pauser = {
            let gate = Arc::clone(&gate);
            let paused = Arc::clone(&paused);
            thread::spawn(move || {
                gate.pause();
                paused.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!paused.load(Ordering::SeqCst));
        drop(permit);
        pauser.join().unwrap();
        assert!(paused.load(Ordering::SeqCst));
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_cancelled_enter_while_paused() {
        let gate = PauseGate::new();
        gate.pause();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(gate.enter(&cancel).unwrap_err().is_interrupted());
        gate.resume();
        assert!(gate.enter(&CancelToken::new()).is_ok());
    }

    #[test]
    fn test_nested_pause() {
        let gate = PauseGate::new();
        gate.pause();
        gate.pause();
        gate.resume();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }
}
