//! CANOPY - Memory-Indexed Disk Store
//! Path-addressed items in append-only data files, found through a long-list index
//! of `path -> location`. Used for the on-disk hash store and the leaf store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::compaction::{Compactable, IndexKey};
use super::data_file::{DataFileReader, NO_LOCATION};
use super::file_collection::DataFileCollection;
use super::long_list::LongList;
use super::records;
use crate::error::{CanopyError, Result};
use crate::types::{KeyRange, Path as TreePath};

const READ_ATTEMPTS: usize = 3;

pub struct DiskKeyValueStore {
    files: DataFileCollection,
    index: LongList,
    valid_range: RwLock<KeyRange>,
    pending: Mutex<Vec<(TreePath, u64)>>,
}

impl DiskKeyValueStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        store_name: &str,
        index: LongList,
        valid_range: KeyRange,
        sync: bool,
    ) -> Result<Self> {
        Ok(Self {
            files: DataFileCollection::open(dir, store_name, sync)?,
            index,
            valid_range: RwLock::new(valid_range),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn start_writing(&self) -> Result<()> {
        self.files.start_writing()
    }

    /// Append an item. `payload` must start with its path.
    /// The item becomes visible to readers at [`end_writing`](Self::end_writing).
    pub fn put(&self, path: TreePath, payload: &[u8]) -> Result<()> {
        if path < 0 {
            return Err(CanopyError::InvalidPath(path));
        }
        let location = self.files.store_item(payload)?;
        self.pending.lock().push((path, location));
        Ok(())
    }

    /// Finish the flush file and point the index at its items.
    pub fn end_writing(&self) -> Result<Option<Arc<DataFileReader>>> {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.files.end_writing_with(|| {
            for (path, location) in pending {
                self.index.put(path as u64, location)?;
            }
            Ok(())
        })
    }

    /// Read the payload stored for `path`, if it is within the valid range.
    pub fn get(&self, path: TreePath) -> Result<Option<Bytes>> {
        if !self.valid_range.read().within_range(path) {
            return Ok(None);
        }
        for _ in 0..READ_ATTEMPTS {
            let location = self.index.get(path as u64)?;
            if location == NO_LOCATION {
                return Ok(None);
            }
            // A miss means compaction moved the item between the two lookups.
            if let Some(item) = self.files.read(location)? {
                return Ok(Some(item.payload));
            }
        }
        Err(CanopyError::Corruption(format!(
            "path {path} of store {} points at a missing data file",
            self.files.store_name()
        )))
    }

    /// Set the range of valid paths and drop index entries outside it.
    pub fn update_valid_key_range(&self, min: i64, max: i64) -> Result<()> {
        *self.valid_range.write() = KeyRange::new(min, max);
        self.index.update_valid_range(min, max)
    }

    pub fn valid_key_range(&self) -> KeyRange {
        *self.valid_range.read()
    }

    /// Rebuild the index from the data files, keeping the newest item per path.
    pub fn rebuild_index(&self) -> Result<usize> {
        let range = self.valid_key_range();
        let mut newest: HashMap<TreePath, (u64, u64)> = HashMap::new();
        for file in self.files.files() {
            for entry in file.iter()? {
                let (location, item) = entry?;
                let path = records::path_of(&item.payload)?;
                if !range.within_range(path) {
                    continue;
                }
                let slot = newest.entry(path).or_insert((item.seq, location));
                if item.seq >= slot.0 {
                    *slot = (item.seq, location);
                }
            }
        }
        self.index.update_valid_range(-1, -1)?;
        for (path, (_, location)) in &newest {
            self.index.put(*path as u64, *location)?;
        }
        self.index.update_valid_range(range.min_valid_key, range.max_valid_key)?;
        log::debug!(
            "Rebuilt index of store {} from {} files: {} entries",
            self.files.store_name(),
            self.files.file_count(),
            newest.len()
        );
        Ok(newest.len())
    }

    /// Hard-link the data files into `target_dir`.
    pub fn snapshot_files(&self, target_dir: &Path) -> Result<()> {
        self.files.snapshot(target_dir)
    }

    pub fn write_index(&self, path: &Path, sync: bool) -> Result<()> {
        self.index.write_to_file(path, sync)
    }

    pub fn index(&self) -> &LongList {
        &self.index
    }

    pub fn data_files(&self) -> &DataFileCollection {
        &self.files
    }
}

impl Compactable for DiskKeyValueStore {
    fn files(&self) -> &DataFileCollection {
        &self.files
    }

    fn index_key(&self, payload: &[u8]) -> Result<Option<IndexKey>> {
        Ok(Some(IndexKey::Path(records::path_of(payload)?)))
    }

    fn is_live(&self, key: &IndexKey, location: u64) -> Result<bool> {
        match key {
            IndexKey::Path(path) => Ok(self.valid_range.read().within_range(*path)
                && self.index.get(*path as u64)? == location),
            IndexKey::Key(_) => Ok(false),
        }
    }

    fn relocate(&self, key: &IndexKey, old: u64, new: u64) -> Result<bool> {
        match key {
            IndexKey::Path(path) => self.index.compare_and_set(*path as u64, old, new),
            IndexKey::Key(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compaction::{Compactor, PauseGate, SizeTieredCompaction};
    use crate::engine::executor::CancelToken;
    use crate::engine::metrics::{DataSourceMetrics, NoopSink, StoreKind};
    use crate::types::HashRecord;

    fn open_store(dir: &Path) -> DiskKeyValueStore {
        DiskKeyValueStore::open(dir, "hashes", LongList::new_memory(), KeyRange::new(0, 100), false)
            .unwrap()
    }

    fn flush(store: &DiskKeyValueStore, records: &[(i64, u8)]) {
        store.start_writing().unwrap();
        for (path, fill) in records {
            let record = HashRecord::new(*path, vec![*fill; 4]);
            store.put(*path, &records::encode_hash(&record)).unwrap();
        }
        store.end_writing().unwrap();
    }

    fn hash_at(store: &DiskKeyValueStore, path: i64) -> Option<Vec<u8>> {
        store
            .get(path)
            .unwrap()
            .map(|payload| records::decode_hash(payload).unwrap().hash.to_vec())
    }

    #[test]
    fn test_latest_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        flush(&store, &[(1, 1), (2, 2)]);
        flush(&store, &[(1, 9)]);

        assert_eq!(hash_at(&store, 1), Some(vec![9; 4]));
        assert_eq!(hash_at(&store, 2), Some(vec![2; 4]));
        assert_eq!(hash_at(&store, 3), None);
    }

    #[test]
    fn test_out_of_range_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        flush(&store, &[(50, 1)]);
        store.update_valid_key_range(0, 10).unwrap();
        assert_eq!(hash_at(&store, 50), None);
    }

    #[test]
    fn test_rebuild_index_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            flush(&store, &[(1, 1), (2, 2)]);
            flush(&store, &[(2, 7)]);
        }
        let store = open_store(dir.path());
        assert_eq!(hash_at(&store, 2), None);
        assert_eq!(store.rebuild_index().unwrap(), 2);
        assert_eq!(hash_at(&store, 1), Some(vec![1; 4]));
        assert_eq!(hash_at(&store, 2), Some(vec![7; 4]));
    }

    #[test]
    fn test_compaction_keeps_live_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        flush(&store, &[(1, 1), (2, 2)]);
        flush(&store, &[(2, 3), (3, 3)]);
        flush(&store, &[(3, 4)]);
        let before = store.data_files().total_size();

        let metrics = Arc::new(DataSourceMetrics::new("t", Arc::new(NoopSink)));
        let compactor = Compactor::new(
            "t",
            StoreKind::Hashes,
            store.clone(),
            Box::new(SizeTieredCompaction::new(3, 10, 1 << 20)),
            Arc::new(PauseGate::new()),
            metrics.clone(),
        );
        assert!(compactor.compact(&CancelToken::new()).unwrap());

        assert_eq!(store.data_files().file_count(), 1);
        assert!(store.data_files().total_size() < before);
        assert_eq!(hash_at(&store, 1), Some(vec![1; 4]));
        assert_eq!(hash_at(&store, 2), Some(vec![3; 4]));
        assert_eq!(hash_at(&store, 3), Some(vec![4; 4]));
        assert_eq!(metrics.compactions(StoreKind::Hashes), 1);

        // Sequence numbers survive compaction, so a rebuild agrees with the live index.
        store.rebuild_index().unwrap();
        assert_eq!(hash_at(&store, 2), Some(vec![3; 4]));
        assert!(!compactor.compact(&CancelToken::new()).unwrap());
    }

    #[test]
    fn test_compaction_during_flush_keeps_newest_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        flush(&store, &[(1, 1)]);
        flush(&store, &[(2, 2)]);
        let compactor = Compactor::new(
            "t",
            StoreKind::Hashes,
            store.clone(),
            Box::new(SizeTieredCompaction::new(2, 10, 1 << 20)),
            Arc::new(PauseGate::new()),
            Arc::new(DataSourceMetrics::new("t", Arc::new(NoopSink))),
        );

        // Compaction runs after the flush file is readable but before the index moves.
        store.start_writing().unwrap();
        let record = HashRecord::new(1, vec![9u8; 4]);
        store.put(1, &records::encode_hash(&record)).unwrap();
        let pending = std::mem::take(&mut *store.pending.lock());
        store
            .files
            .end_writing_with(|| {
                assert!(compactor.compact(&CancelToken::new())?);
                for (path, location) in pending {
                    store.index.put(path as u64, location)?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.data_files().file_count(), 2);
        assert_eq!(hash_at(&store, 1), Some(vec![9; 4]));
        assert_eq!(hash_at(&store, 2), Some(vec![2; 4]));

        assert!(compactor.compact(&CancelToken::new()).unwrap());
        assert_eq!(store.data_files().file_count(), 1);
        assert_eq!(hash_at(&store, 1), Some(vec![9; 4]));
        assert_eq!(hash_at(&store, 2), Some(vec![2; 4]));
    }

    #[test]
    fn test_cancelled_compaction_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        flush(&store, &[(1, 1)]);
        flush(&store, &[(1, 2)]);
        let compactor = Compactor::new(
            "t",
            StoreKind::Hashes,
            store.clone(),
            Box::new(SizeTieredCompaction::new(2, 10, 1 << 20)),
            Arc::new(PauseGate::new()),
            Arc::new(DataSourceMetrics::new("t", Arc::new(NoopSink))),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(compactor.compact(&cancel).unwrap_err().is_interrupted());

        assert_eq!(store.data_files().file_count(), 2);
        assert_eq!(hash_at(&store, 1), Some(vec![2; 4]));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_snapshot_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("live"));
        flush(&store, &[(4, 4)]);
        store.snapshot_files(&dir.path().join("snap")).unwrap();
        store
            .write_index(&dir.path().join("snap.ll"), false)
            .unwrap();

        let copy = DiskKeyValueStore::open(
            dir.path().join("snap"),
            "hashes",
            LongList::load(&dir.path().join("snap.ll"), false).unwrap(),
            KeyRange::new(0, 100),
            false,
        )
        .unwrap();
        assert_eq!(hash_at(&copy, 4), Some(vec![4; 4]));
    }
}
