//! CANOPY - Data File Collection
//! The set of data files that make up one store, plus the writer for the next flush.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::compaction::DataFileInfo;
use super::data_file::{self, file_index_of, offset_of, DataFileReader, DataFileWriter, DataItem};
use crate::error::{CanopyError, Result};

/// Append-only files of one store, keyed by file index.
pub struct DataFileCollection {
    dir: PathBuf,
    store_name: String,
    files: RwLock<BTreeMap<u32, Arc<DataFileReader>>>,
    next_file_index: AtomicU32,
    next_seq: AtomicU64,
    writer: Mutex<Option<DataFileWriter>>,
    /// Readable files that compaction must not select yet.
    publishing: Mutex<BTreeSet<u32>>,
    sync: bool,
}

impl DataFileCollection {
    /// Open the files of `store_name` in `dir`, creating the directory if needed.
    /// Leftover temporary files from interrupted writes are deleted.
    pub fn open(dir: impl Into<PathBuf>, store_name: impl Into<String>, sync: bool) -> Result<Self> {
        let dir = dir.into();
        let store_name = store_name.into();
        fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();
        let mut max_seq = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") {
                log::debug!("Removing leftover temporary file {:?}", entry.path());
                fs::remove_file(entry.path())?;
                continue;
            }
            let Some(index) = data_file::parse_data_file_name(&store_name, &name) else {
                continue;
            };
            let reader = DataFileReader::open(&entry.path())?;
            if reader.index() != index {
                return Err(CanopyError::Corruption(format!(
                    "data file {:?} has index {} in its header",
                    entry.path(),
                    reader.index()
                )));
            }
            max_seq = max_seq.max(reader.header().max_seq);
            files.insert(index, Arc::new(reader));
        }

        let next_file_index = files.keys().next_back().map_or(1, |last| last + 1);
        log::debug!(
            "Opened {} data files for store {} in {:?}",
            files.len(),
            store_name,
            dir
        );
        Ok(Self {
            dir,
            store_name,
            files: RwLock::new(files),
            next_file_index: AtomicU32::new(next_file_index),
            next_seq: AtomicU64::new(max_seq + 1),
            writer: Mutex::new(None),
            publishing: Mutex::new(BTreeSet::new()),
            sync,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    fn allocate_file_index(&self) -> u32 {
        self.next_file_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Begin a new flush file. Only one flush may be open at a time.
    pub fn start_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(CanopyError::InvalidState(format!(
                "store {} is already writing",
                self.store_name
            )));
        }
        *writer = Some(DataFileWriter::create(
            &self.dir,
            &self.store_name,
            self.allocate_file_index(),
            0,
        )?);
        Ok(())
    }

    /// Append an item to the current flush file and return its location.
    pub fn store_item(&self, payload: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or_else(|| {
            CanopyError::InvalidState(format!("store {} is not writing", self.store_name))
        })?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        writer.write(seq, payload)
    }

    /// Finish the current flush file and make it readable.
    /// A flush without items leaves no file behind and returns `None`.
    pub fn end_writing(&self) -> Result<Option<Arc<DataFileReader>>> {
        self.end_writing_with(|| Ok(()))
    }

    /// Like [`end_writing`](Self::end_writing), running `publish` once the file is
    /// readable. Compaction cannot select the file until `publish` has returned, so an
    /// index updated in `publish` never points into a file merged away without it.
    pub fn end_writing_with(
        &self,
        publish: impl FnOnce() -> Result<()>,
    ) -> Result<Option<Arc<DataFileReader>>> {
        let writer = self.writer.lock().take().ok_or_else(|| {
            CanopyError::InvalidState(format!("store {} is not writing", self.store_name))
        })?;
        if writer.item_count() == 0 {
            publish()?;
            return Ok(None);
        }
        let reader = Arc::new(writer.finish(self.sync)?);
        let index = reader.index();
        self.publishing.lock().insert(index);
        self.add_file(Arc::clone(&reader));
        let published = publish();
        self.publishing.lock().remove(&index);
        published?;
        Ok(Some(reader))
    }

    /// A writer for compaction output, separate from the flush writer.
    pub fn new_compaction_writer(&self, level: u16) -> Result<DataFileWriter> {
        DataFileWriter::create(&self.dir, &self.store_name, self.allocate_file_index(), level)
    }

    pub fn finish_compaction_writer(&self, writer: DataFileWriter) -> Result<Arc<DataFileReader>> {
        Ok(Arc::new(writer.finish(self.sync)?))
    }

    pub fn add_file(&self, reader: Arc<DataFileReader>) {
        self.files.write().insert(reader.index(), reader);
    }

    /// Unregister files and delete them from disk.
    pub fn remove_files(&self, indices: &[u32]) -> Result<()> {
        let removed: Vec<Arc<DataFileReader>> = {
            let mut files = self.files.write();
            indices.iter().filter_map(|i| files.remove(i)).collect()
        };
        for reader in removed {
            // Readers that already hold the Arc keep a valid handle after the unlink.
            fs::remove_file(reader.path())?;
        }
        Ok(())
    }

    pub fn get_file(&self, index: u32) -> Option<Arc<DataFileReader>> {
        self.files.read().get(&index).cloned()
    }

    /// Read the item at a location. Returns `None` when its file is gone.
    pub fn read(&self, location: u64) -> Result<Option<DataItem>> {
        match self.get_file(file_index_of(location)) {
            Some(reader) => Ok(Some(reader.read_at(offset_of(location))?)),
            None => Ok(None),
        }
    }

    /// All files in index order.
    pub fn files(&self) -> Vec<Arc<DataFileReader>> {
        self.files.read().values().cloned().collect()
    }

    /// Files compaction may select.
    pub fn file_infos(&self) -> Vec<DataFileInfo> {
        let publishing = self.publishing.lock();
        self.files
            .read()
            .values()
            .filter(|f| !publishing.contains(&f.index()))
            .map(|f| DataFileInfo {
                index: f.index(),
                size: f.size(),
                level: f.level(),
            })
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|f| f.size()).sum()
    }

    /// Total file size per compaction level.
    pub fn size_by_level(&self) -> BTreeMap<u16, u64> {
        let mut levels = BTreeMap::new();
        for file in self.files.read().values() {
            *levels.entry(file.level()).or_insert(0) += file.size();
        }
        levels
    }

    /// Hard-link every finished file into `target_dir`.
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        fs::create_dir_all(target_dir)?;
        let files = self.files.read();
        for reader in files.values() {
            let name = data_file::data_file_name(&self.store_name, reader.index());
            fs::hard_link(reader.path(), target_dir.join(name))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataFileCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileCollection")
            .field("dir", &self.dir)
            .field("store_name", &self.store_name)
            .field("files", &self.file_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush(collection: &DataFileCollection, items: &[&[u8]]) -> Vec<u64> {
        collection.start_writing().unwrap();
        let locations = items
            .iter()
            .map(|item| collection.store_item(item).unwrap())
            .collect();
        collection.end_writing().unwrap();
        locations
    }

    #[test]
    fn test_flush_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        let locations = flush(&collection, &[b"one", b"two"]);

        assert_eq!(collection.file_count(), 1);
        let item = collection.read(locations[1]).unwrap().unwrap();
        assert_eq!(&item.payload[..], b"two");
    }

    #[test]
    fn test_file_hidden_from_compaction_while_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        flush(&collection, &[b"old"]);

        collection.start_writing().unwrap();
        let location = collection.store_item(b"new").unwrap();
        let reader = collection
            .end_writing_with(|| {
                assert_eq!(&collection.read(location)?.unwrap().payload[..], b"new");
                assert_eq!(collection.file_infos().len(), 1);
                Ok(())
            })
            .unwrap()
            .unwrap();

        let infos = collection.file_infos();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|info| info.index == reader.index()));
    }

    #[test]
    fn test_failed_publish_releases_file() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        collection.start_writing().unwrap();
        collection.store_item(b"item").unwrap();
        let result = collection.end_writing_with(|| Err(CanopyError::InvalidState("index".into())));
        assert!(matches!(result, Err(CanopyError::InvalidState(_))));
        assert_eq!(collection.file_infos().len(), 1);
    }

    #[test]
    fn test_empty_flush_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        collection.start_writing().unwrap();
        assert!(collection.end_writing().unwrap().is_none());
        assert_eq!(collection.file_count(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        collection.start_writing().unwrap();
        assert!(matches!(
            collection.start_writing(),
            Err(CanopyError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reopen_continues_sequence_and_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let collection = DataFileCollection::open(dir.path(), "hashes", false).unwrap();
            flush(&collection, &[b"a", b"b"]);
            flush(&collection, &[b"c"]);
        }
        fs::write(dir.path().join("hashes_000009.cdf.tmp"), b"junk").unwrap();

        let collection = DataFileCollection::open(dir.path(), "hashes", false).unwrap();
        assert_eq!(collection.file_count(), 2);
        assert!(!dir.path().join("hashes_000009.cdf.tmp").exists());

        let locations = flush(&collection, &[b"d"]);
        assert_eq!(file_index_of(locations[0]), 3);
        let item = collection.read(locations[0]).unwrap().unwrap();
        assert_eq!(item.seq, 4);
    }

    #[test]
    fn test_remove_files_makes_reads_miss() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "leaves", false).unwrap();
        let locations = flush(&collection, &[b"x"]);
        collection.remove_files(&[file_index_of(locations[0])]).unwrap();
        assert!(collection.read(locations[0]).unwrap().is_none());
        assert_eq!(collection.total_size(), 0);
    }

    #[test]
    fn test_snapshot_hard_links_files() {
        let dir = tempfile::tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path().join("src"), "leaves", false).unwrap();
        flush(&collection, &[b"x"]);
        flush(&collection, &[b"y"]);

        let target = dir.path().join("snap");
        collection.snapshot(&target).unwrap();
        let copy = DataFileCollection::open(&target, "leaves", false).unwrap();
        assert_eq!(copy.file_count(), 2);
        assert_eq!(copy.total_size(), collection.total_size());
    }
}
