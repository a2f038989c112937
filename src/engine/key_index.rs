//! CANOPY - Key Index
//! Maps leaf keys to tree paths. The variant is fixed by the table's key encoding:
//! dense integer keys use a long list, arbitrary keys use a hash map backed by
//! append-only data files of put and tombstone items.
//!
//! ## Item Format (hashed variant)
//! ```text
//! [key len u32][key][path i64]   path -1 marks a tombstone
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use parking_lot::RwLock;

use super::compaction::{Compactable, IndexKey};
use super::data_file::DataFileReader;
use super::file_collection::DataFileCollection;
use super::long_list::LongList;
use crate::error::{CanopyError, Result};
use crate::table::{KeyEncoding, TableConfig};
use crate::types::{Path as TreePath, INVALID_PATH};

pub const SEQUENTIAL_KEYS_FILE: &str = "keys.ll";
pub const HASHED_KEYS_DIR: &str = "keys";
const HASHED_KEYS_STORE: &str = "keys";

/// Key-to-path index of one table.
pub enum KeyIndex {
    Sequential(SequentialKeyIndex),
    Hashed(Arc<HashedKeyIndex>),
}

/// `key -> path + 1` in a long list. Zero means "no path".
pub struct SequentialKeyIndex {
    list: LongList,
    max_keys: u64,
}

/// `key -> (path, location)` in memory, rebuilt from data files on open.
pub struct HashedKeyIndex {
    entries: RwLock<HashMap<Bytes, (TreePath, u64)>>,
    files: DataFileCollection,
}

impl KeyIndex {
    /// Open the key index stored in `table_dir`.
    pub fn open(table_dir: &Path, config: &TableConfig, sync: bool) -> Result<Self> {
        match config.key_encoding() {
            KeyEncoding::Sequential => Ok(KeyIndex::Sequential(SequentialKeyIndex {
                list: LongList::load(
                    &table_dir.join(SEQUENTIAL_KEYS_FILE),
                    config.prefer_disk_based_indices(),
                )?,
                max_keys: config.max_number_of_keys(),
            })),
            KeyEncoding::Arbitrary => Ok(KeyIndex::Hashed(Arc::new(HashedKeyIndex::open(
                table_dir, sync,
            )?))),
        }
    }

    /// Reject keys this index cannot hold.
    pub fn validate_key(&self, key: &[u8]) -> Result<()> {
        match self {
            KeyIndex::Sequential(index) => index.slot(key).map(|_| ()),
            KeyIndex::Hashed(_) => Ok(()),
        }
    }

    /// Path of `key`, or [`INVALID_PATH`].
    pub fn get(&self, key: &[u8]) -> Result<TreePath> {
        match self {
            KeyIndex::Sequential(index) => {
                let stored = index.list.get(index.slot(key)?)?;
                Ok(if stored == 0 {
                    INVALID_PATH
                } else {
                    stored as TreePath - 1
                })
            }
            KeyIndex::Hashed(index) => Ok(index
                .entries
                .read()
                .get(key)
                .map_or(INVALID_PATH, |(path, _)| *path)),
        }
    }

    pub fn start_writing(&self) -> Result<()> {
        match self {
            KeyIndex::Sequential(_) => Ok(()),
            KeyIndex::Hashed(index) => index.files.start_writing(),
        }
    }

    pub fn put(&self, key: &Bytes, path: TreePath) -> Result<()> {
        if path < 0 {
            return Err(CanopyError::InvalidPath(path));
        }
        match self {
            KeyIndex::Sequential(index) => index.list.put(index.slot(key)?, path as u64 + 1),
            KeyIndex::Hashed(index) => {
                let location = index.files.store_item(&encode_item(key, path))?;
                index
                    .entries
                    .write()
                    .insert(key.clone(), (path, location));
                Ok(())
            }
        }
    }

    pub fn delete(&self, key: &Bytes) -> Result<()> {
        match self {
            KeyIndex::Sequential(index) => index.list.put(index.slot(key)?, 0),
            KeyIndex::Hashed(index) => {
                if index.entries.read().contains_key(key) {
                    index.files.store_item(&encode_item(key, INVALID_PATH))?;
                    index.entries.write().remove(key);
                }
                Ok(())
            }
        }
    }

    /// Delete `key` only if it still maps to `path`.
    pub fn delete_if_equal(&self, key: &Bytes, path: TreePath) -> Result<bool> {
        match self {
            KeyIndex::Sequential(index) => {
                index
                    .list
                    .compare_and_set(index.slot(key)?, path as u64 + 1, 0)
            }
            KeyIndex::Hashed(index) => {
                let current = index.entries.read().get(key).map(|(p, _)| *p);
                if current != Some(path) {
                    return Ok(false);
                }
                index.files.store_item(&encode_item(key, INVALID_PATH))?;
                index.entries.write().remove(key);
                Ok(true)
            }
        }
    }

    pub fn end_writing(&self) -> Result<Option<Arc<DataFileReader>>> {
        match self {
            KeyIndex::Sequential(_) => Ok(None),
            KeyIndex::Hashed(index) => index.files.end_writing(),
        }
    }

    /// Write the index into another table directory.
    pub fn snapshot(&self, target_table_dir: &Path, sync: bool) -> Result<()> {
        match self {
            KeyIndex::Sequential(index) => index
                .list
                .write_to_file(&target_table_dir.join(SEQUENTIAL_KEYS_FILE), sync),
            KeyIndex::Hashed(index) => index
                .files
                .snapshot(&target_table_dir.join(HASHED_KEYS_DIR)),
        }
    }

    /// Make the index durable in its own table directory.
    pub fn persist(&self, table_dir: &Path, sync: bool) -> Result<()> {
        match self {
            KeyIndex::Sequential(index) => index
                .list
                .write_to_file(&table_dir.join(SEQUENTIAL_KEYS_FILE), sync),
            // Data files are the durable form.
            KeyIndex::Hashed(_) => Ok(()),
        }
    }

    pub fn memory_usage(&self) -> u64 {
        match self {
            KeyIndex::Sequential(index) => index.list.memory_usage(),
            KeyIndex::Hashed(index) => index.memory_usage(),
        }
    }

    /// The store compaction works on, if this variant has data files.
    pub fn compactable(&self) -> Option<Arc<HashedKeyIndex>> {
        match self {
            KeyIndex::Sequential(_) => None,
            KeyIndex::Hashed(index) => Some(Arc::clone(index)),
        }
    }

    pub fn data_files(&self) -> Option<&DataFileCollection> {
        match self {
            KeyIndex::Sequential(_) => None,
            KeyIndex::Hashed(index) => Some(&index.files),
        }
    }
}

impl SequentialKeyIndex {
    fn slot(&self, key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key.try_into().map_err(|_| {
            CanopyError::InvalidRecord(format!(
                "sequential keys are 8 bytes, got {}",
                key.len()
            ))
        })?;
        let slot = u64::from_le_bytes(bytes);
        if slot >= self.max_keys {
            return Err(CanopyError::InvalidRecord(format!(
                "key {slot} exceeds the table's {} keys",
                self.max_keys
            )));
        }
        Ok(slot)
    }
}

impl HashedKeyIndex {
    fn open(table_dir: &Path, sync: bool) -> Result<Self> {
        let files =
            DataFileCollection::open(table_dir.join(HASHED_KEYS_DIR), HASHED_KEYS_STORE, sync)?;

        let mut newest: HashMap<Bytes, (u64, TreePath, u64)> = HashMap::new();
        for file in files.files() {
            for entry in file.iter()? {
                let (location, item) = entry?;
                let (key, path) = decode_item(&item.payload)?;
                match newest.get(&key) {
                    Some((seq, _, _)) if *seq > item.seq => {}
                    _ => {
                        newest.insert(key, (item.seq, path, location));
                    }
                }
            }
        }
        let entries: HashMap<Bytes, (TreePath, u64)> = newest
            .into_iter()
            .filter(|(_, (_, path, _))| *path != INVALID_PATH)
            .map(|(key, (_, path, location))| (key, (path, location)))
            .collect();
        log::debug!(
            "Replayed {} key index files: {} keys",
            files.file_count(),
            entries.len()
        );

        Ok(Self {
            entries: RwLock::new(entries),
            files,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn memory_usage(&self) -> u64 {
        let entries = self.entries.read();
        let keys: usize = entries.keys().map(|k| k.len()).sum();
        (entries.capacity() * (std::mem::size_of::<Bytes>() + 16) + keys) as u64
    }
}

impl Compactable for HashedKeyIndex {
    fn files(&self) -> &DataFileCollection {
        &self.files
    }

    fn index_key(&self, payload: &[u8]) -> Result<Option<IndexKey>> {
        let (key, path) = decode_item(payload)?;
        if path == INVALID_PATH {
            return Ok(None);
        }
        Ok(Some(IndexKey::Key(key)))
    }

    fn is_live(&self, key: &IndexKey, location: u64) -> Result<bool> {
        match key {
            IndexKey::Key(key) => Ok(self
                .entries
                .read()
                .get(key)
                .is_some_and(|(_, current)| *current == location)),
            IndexKey::Path(_) => Ok(false),
        }
    }

    fn relocate(&self, key: &IndexKey, old: u64, new: u64) -> Result<bool> {
        let IndexKey::Key(key) = key else {
            return Ok(false);
        };
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some((_, location)) if *location == old => {
                *location = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn encode_item(key: &[u8], path: TreePath) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + key.len() + 8];
    LittleEndian::write_u32(&mut buf[..4], key.len() as u32);
    buf[4..4 + key.len()].copy_from_slice(key);
    LittleEndian::write_i64(&mut buf[4 + key.len()..], path);
    buf
}

fn decode_item(payload: &[u8]) -> Result<(Bytes, TreePath)> {
    if payload.len() < 4 {
        return Err(CanopyError::Corruption("key index item is truncated".into()));
    }
    let key_len = LittleEndian::read_u32(&payload[..4]) as usize;
    if payload.len() != 4 + key_len + 8 {
        return Err(CanopyError::Corruption(format!(
            "key index item of {} bytes for a {key_len}-byte key",
            payload.len()
        )));
    }
    let key = Bytes::copy_from_slice(&payload[4..4 + key_len]);
    let path = LittleEndian::read_i64(&payload[4 + key_len..]);
    Ok((key, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compaction::{Compactor, FullMergeCompaction, PauseGate};
    use crate::engine::executor::CancelToken;
    use crate::engine::metrics::{DataSourceMetrics, NoopSink, StoreKind};
    use crate::table::DigestKind;

    fn arbitrary_config() -> TableConfig {
        TableConfig::new(DigestKind::Sha384, 1000, 0).unwrap()
    }

    fn sequential_config() -> TableConfig {
        arbitrary_config().with_key_encoding(KeyEncoding::Sequential)
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn seq_key(k: u64) -> Bytes {
        Bytes::copy_from_slice(&k.to_le_bytes())
    }

    fn write(index: &KeyIndex, puts: &[(Bytes, i64)], deletes: &[Bytes]) {
        index.start_writing().unwrap();
        for (k, p) in puts {
            index.put(k, *p).unwrap();
        }
        for k in deletes {
            index.delete(k).unwrap();
        }
        index.end_writing().unwrap();
    }

    #[test]
    fn test_hashed_put_delete_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = KeyIndex::open(dir.path(), &arbitrary_config(), false).unwrap();
            write(&index, &[(key("a"), 1), (key("b"), 2)], &[]);
            write(&index, &[(key("a"), 5)], &[key("b")]);
            assert_eq!(index.get(b"a").unwrap(), 5);
            assert_eq!(index.get(b"b").unwrap(), INVALID_PATH);
        }
        let index = KeyIndex::open(dir.path(), &arbitrary_config(), false).unwrap();
        assert_eq!(index.get(b"a").unwrap(), 5);
        assert_eq!(index.get(b"b").unwrap(), INVALID_PATH);
        assert_eq!(index.get(b"zzz").unwrap(), INVALID_PATH);
    }

    #[test]
    fn test_delete_if_equal() {
        let dir = tempfile::tempdir().unwrap();
        for config in [arbitrary_config(), sequential_config()] {
            let index = KeyIndex::open(dir.path(), &config, false).unwrap();
            let k = seq_key(7);
            index.start_writing().unwrap();
            index.put(&k, 3).unwrap();
            assert!(!index.delete_if_equal(&k, 4).unwrap());
            assert_eq!(index.get(&k).unwrap(), 3);
            assert!(index.delete_if_equal(&k, 3).unwrap());
            assert_eq!(index.get(&k).unwrap(), INVALID_PATH);
            index.end_writing().unwrap();
        }
    }

    #[test]
    fn test_sequential_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = sequential_config();
        {
            let index = KeyIndex::open(dir.path(), &config, false).unwrap();
            write(&index, &[(seq_key(0), 0), (seq_key(9), 42)], &[]);
            index.persist(dir.path(), false).unwrap();
        }
        let index = KeyIndex::open(dir.path(), &config, false).unwrap();
        assert_eq!(index.get(&seq_key(0)).unwrap(), 0);
        assert_eq!(index.get(&seq_key(9)).unwrap(), 42);
        assert_eq!(index.get(&seq_key(5)).unwrap(), INVALID_PATH);
    }

    #[test]
    fn test_sequential_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let index = KeyIndex::open(dir.path(), &sequential_config(), false).unwrap();
        assert!(matches!(
            index.validate_key(b"short"),
            Err(CanopyError::InvalidRecord(_))
        ));
        assert!(matches!(
            index.validate_key(&5000u64.to_le_bytes()),
            Err(CanopyError::InvalidRecord(_))
        ));
        assert!(index.validate_key(&10u64.to_le_bytes()).is_ok());
    }

    #[test]
    fn test_full_merge_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let index = KeyIndex::open(dir.path(), &arbitrary_config(), false).unwrap();
        write(&index, &[(key("a"), 1), (key("b"), 2)], &[]);
        write(&index, &[(key("c"), 3)], &[key("a")]);
        write(&index, &[(key("b"), 4)], &[]);

        let hashed = index.compactable().unwrap();
        let compactor = Compactor::new(
            "t",
            StoreKind::LeafKeys,
            hashed.clone(),
            Box::new(FullMergeCompaction::new(3)),
            Arc::new(PauseGate::new()),
            Arc::new(DataSourceMetrics::new("t", Arc::new(NoopSink))),
        );
        assert!(compactor.compact(&CancelToken::new()).unwrap());
        assert_eq!(hashed.files().file_count(), 1);
        assert_eq!(hashed.len(), 2);
        drop(compactor);
        drop(hashed);
        drop(index);

        let index = KeyIndex::open(dir.path(), &arbitrary_config(), false).unwrap();
        assert_eq!(index.get(b"a").unwrap(), INVALID_PATH);
        assert_eq!(index.get(b"b").unwrap(), 4);
        assert_eq!(index.get(b"c").unwrap(), 3);
    }

    #[test]
    fn test_hashed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        let snap = dir.path().join("snap");
        let index = KeyIndex::open(&live, &arbitrary_config(), false).unwrap();
        write(&index, &[(key("x"), 11)], &[]);
        index.snapshot(&snap, false).unwrap();

        let copy = KeyIndex::open(&snap, &arbitrary_config(), false).unwrap();
        assert_eq!(copy.get(b"x").unwrap(), 11);
    }
}
