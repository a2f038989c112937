//! CANOPY - Data Source
//! Runtime handle of one table: a RAM hash list for low paths, a disk store for the
//! remaining hashes, a key index, a path-addressed leaf store and a leaf cache.
//!
//! ## Save Path
//! `save_records` moves the valid leaf range first, then writes hashes and leaves on
//! two single-thread executors and waits for both. Readers may briefly see the new
//! range before the stores catch up; a save is not atomic to concurrent readers.
//!
//! ## Table Directory
//! ```text
//! internal_index.ll   path -> location of on-disk hashes
//! leaf_index.ll       path -> location of leaves
//! hashes_ram.hl       hashes below the RAM/disk threshold
//! hashes/             hash data files
//! keys.ll | keys/     key index (sequential | arbitrary keys)
//! leaves/             leaf data files
//! table.meta          valid leaf range
//! ```

use std::fs;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::cache::{CachedLeaf, LeafCache};
use super::compaction::{Compactor, FullMergeCompaction, PauseGate, SizeTieredCompaction};
use super::coordinator::CompactionCoordinator;
use super::disk_store::DiskKeyValueStore;
use super::executor::{CountDownLatch, Executor};
use super::hash_list::HashList;
use super::key_index::{KeyIndex, SEQUENTIAL_KEYS_FILE};
use super::long_list::LongList;
use super::metrics::{DataSourceMetrics, MetricsSink, StoreKind};
use super::records;
use crate::config::Config;
use crate::database::Database;
use crate::error::{CanopyError, Result};
use crate::fs_util;
use crate::table::metadata::{decode_key_range, encode_key_range};
use crate::table::{KeyEncoding, TableConfig, TableMetadata};
use crate::types::{HashRecord, KeyRange, LeafRecord, Path as TreePath, INVALID_PATH};

pub const INTERNAL_INDEX_FILE: &str = "internal_index.ll";
pub const LEAF_INDEX_FILE: &str = "leaf_index.ll";
pub const HASHES_RAM_FILE: &str = "hashes_ram.hl";
pub const HASHES_DIR: &str = "hashes";
pub const LEAVES_DIR: &str = "leaves";
pub const TABLE_META_FILE: &str = "table.meta";

const SNAPSHOT_THREADS: usize = 8;
const PATH_SIZE: u64 = 8;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

type SnapshotTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// Everything a data source borrows from the database and context that open it.
#[derive(Clone)]
pub(crate) struct DataSourceEnv {
    pub config: Arc<Config>,
    pub sink: Arc<dyn MetricsSink>,
    pub compaction_pool: Arc<Executor>,
    pub open_counter: Arc<AtomicUsize>,
    pub database: Weak<Database>,
}

pub struct DataSource {
    table_name: String,
    table_id: u32,
    table_config: TableConfig,
    storage_dir: PathBuf,
    config: Arc<Config>,
    database: Weak<Database>,
    open_counter: Arc<AtomicUsize>,

    hash_ram: Option<HashList>,
    hash_store: Option<Arc<DiskKeyValueStore>>,
    key_index: KeyIndex,
    leaf_store: Arc<DiskKeyValueStore>,
    cache: LeafCache,
    valid_range: RwLock<KeyRange>,

    compaction: CompactionCoordinator,
    metrics: Arc<DataSourceMetrics>,

    hash_executor: Executor,
    leaf_executor: Executor,
    snapshot_executor: Executor,

    flush_lock: Mutex<()>,
    state: AtomicU8,
    snapshot_in_progress: AtomicBool,
}

impl DataSource {
    /// Open the table stored in `storage_dir`. With `create`, any directory left there
    /// is wiped and an empty table is written.
    pub(crate) fn open(
        env: DataSourceEnv,
        storage_dir: PathBuf,
        metadata: &TableMetadata,
        create: bool,
        compaction_enabled: bool,
    ) -> Result<Arc<Self>> {
        let config = env.config;
        let table_name = metadata.table_name.clone();
        let table_config = metadata.table_config.copy();
        let sync = config.sync_writes;
        let force = config.force_index_rebuilding;
        let disk_based = table_config.prefer_disk_based_indices();

        let range = if create {
            fs_util::delete_directory_and_contents(&storage_dir)?;
            fs::create_dir_all(&storage_dir)?;
            KeyRange::INVALID
        } else {
            read_table_meta(&storage_dir)?
        };

        let hash_ram = if table_config.has_ram_hash_store() {
            Some(HashList::load(
                &storage_dir.join(HASHES_RAM_FILE),
                table_config.digest().digest_len(),
            )?)
        } else {
            None
        };

        let hash_store = if table_config.has_disk_hash_store() {
            let (index, rebuild) =
                open_index(&storage_dir.join(INTERNAL_INDEX_FILE), disk_based, force)?;
            let store = DiskKeyValueStore::open(
                storage_dir.join(HASHES_DIR),
                HASHES_DIR,
                index,
                hash_range(range.max_valid_key),
                sync,
            )?;
            if rebuild && !create {
                store.rebuild_index()?;
            }
            Some(Arc::new(store))
        } else {
            None
        };

        let (leaf_index, rebuild_leaves) =
            open_index(&storage_dir.join(LEAF_INDEX_FILE), disk_based, force)?;
        let leaf_store = Arc::new(DiskKeyValueStore::open(
            storage_dir.join(LEAVES_DIR),
            LEAVES_DIR,
            leaf_index,
            range,
            sync,
        )?);
        if rebuild_leaves && !create {
            leaf_store.rebuild_index()?;
        }

        let sequential = table_config.key_encoding() == KeyEncoding::Sequential;
        let keys_file = storage_dir.join(SEQUENTIAL_KEYS_FILE);
        let rebuild_keys = sequential && !create && (force || !keys_file.exists());
        if rebuild_keys {
            remove_if_exists(&keys_file)?;
        }
        let key_index = KeyIndex::open(&storage_dir, &table_config, sync)?;
        if rebuild_keys {
            let count = rebuild_sequential_keys(&key_index, &leaf_store, range)?;
            log::info!("[{}] Rebuilt key index: {} keys", table_name, count);
        }

        let metrics = Arc::new(DataSourceMetrics::new(table_name.clone(), env.sink));
        let gate = Arc::new(PauseGate::new());
        let tiered = || {
            Box::new(SizeTieredCompaction::new(
                config.compaction_threshold,
                config.compaction_size_ratio,
                config.compaction_base_tier_bytes,
            ))
        };
        let hashes_compactor = hash_store.as_ref().map(|store| {
            Arc::new(Compactor::new(
                table_name.clone(),
                StoreKind::Hashes,
                store.clone(),
                tiered(),
                Arc::clone(&gate),
                Arc::clone(&metrics),
            ))
        });
        let keys_compactor = key_index.compactable().map(|index| {
            Arc::new(Compactor::new(
                table_name.clone(),
                StoreKind::LeafKeys,
                index,
                Box::new(FullMergeCompaction::new(config.compaction_threshold)),
                Arc::clone(&gate),
                Arc::clone(&metrics),
            ))
        });
        let leaves_compactor = Arc::new(Compactor::new(
            table_name.clone(),
            StoreKind::Leaves,
            leaf_store.clone(),
            tiered(),
            Arc::clone(&gate),
            Arc::clone(&metrics),
        ));
        let compaction = CompactionCoordinator::new(
            table_name.clone(),
            env.compaction_pool,
            hashes_compactor,
            keys_compactor,
            leaves_compactor,
            gate,
        );
        if compaction_enabled {
            compaction.enable_background_compaction();
        }

        let data_source = Arc::new(Self {
            hash_executor: Executor::new(format!("{table_name}-hashes"), 1)?,
            leaf_executor: Executor::new(format!("{table_name}-leaves"), 1)?,
            snapshot_executor: Executor::new(format!("{table_name}-snapshot"), SNAPSHOT_THREADS)?,
            table_name,
            table_id: metadata.table_id,
            table_config,
            storage_dir,
            database: env.database,
            open_counter: env.open_counter,
            hash_ram,
            hash_store,
            key_index,
            leaf_store,
            cache: LeafCache::new(config.leaf_record_cache_size),
            valid_range: RwLock::new(range),
            compaction,
            metrics,
            flush_lock: Mutex::new(()),
            state: AtomicU8::new(STATE_OPEN),
            snapshot_in_progress: AtomicBool::new(false),
            config,
        });

        if create {
            data_source.store_table_meta()?;
        }
        data_source.refresh_store_metrics();
        data_source.open_counter.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "[{}] Opened data source {} (id {}) at {:?}, leaf range [{}, {}]",
            data_source.table_name,
            if create { "new" } else { "existing" },
            data_source.table_id,
            data_source.storage_dir,
            range.min_valid_key,
            range.max_valid_key
        );
        Ok(data_source)
    }

    /// Persist one flush: hashes, upserted leaves and deleted leaves.
    ///
    /// Deletes in a reconnect only remove a key if it still maps to the deleted path,
    /// since the key may already have been re-inserted elsewhere.
    pub fn save_records(
        self: &Arc<Self>,
        first_leaf_path: TreePath,
        last_leaf_path: TreePath,
        hash_records: Vec<HashRecord>,
        leaves_to_upsert: Vec<LeafRecord>,
        leaves_to_delete: Vec<LeafRecord>,
        is_reconnect: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        self.validate_save(
            first_leaf_path,
            last_leaf_path,
            &hash_records,
            &leaves_to_upsert,
            &leaves_to_delete,
        )?;

        let _flush = self.flush_lock.lock();
        let range = if last_leaf_path < 0 {
            KeyRange::INVALID
        } else {
            KeyRange::new(first_leaf_path, last_leaf_path)
        };
        *self.valid_range.write() = range;

        let latch = Arc::new(CountDownLatch::new(2));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let this = Arc::clone(self);
        self.dispatch(&self.hash_executor, &latch, &errors, move || {
            this.write_hashes(last_leaf_path, hash_records)
        });
        let this = Arc::clone(self);
        self.dispatch(&self.leaf_executor, &latch, &errors, move || {
            this.write_leaves(range, leaves_to_upsert, leaves_to_delete, is_reconnect)
        });
        latch.wait();

        let mut errors = std::mem::take(&mut *errors.lock());
        if !errors.is_empty() {
            for e in &errors[1..] {
                log::error!("[{}] Additional flush failure: {}", self.table_name, e);
            }
            return Err(errors.swap_remove(0));
        }
        self.store_table_meta()?;
        self.metrics.set_index_memory(self.index_memory());
        Ok(())
    }

    fn dispatch<F>(
        &self,
        executor: &Executor,
        latch: &Arc<CountDownLatch>,
        errors: &Arc<Mutex<Vec<CanopyError>>>,
        job: F,
    ) where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let job_latch = Arc::clone(latch);
        let job_errors = Arc::clone(errors);
        let table_name = self.table_name.clone();
        let executor_name = executor.name().to_string();
        let submitted = executor.execute(move || {
            let _done = CountDownOnDrop(&job_latch);
            let outcome = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                Err(CanopyError::TaskFailed(format!("{executor_name} job panicked")))
            });
            if let Err(e) = outcome {
                log::error!("[{}] {} failed: {}", table_name, executor_name, e);
                job_errors.lock().push(e);
            }
        });
        if let Err(e) = submitted {
            errors.lock().push(e);
            latch.count_down();
        }
    }

    fn validate_save(
        &self,
        first: TreePath,
        last: TreePath,
        hashes: &[HashRecord],
        upserts: &[LeafRecord],
        deletes: &[LeafRecord],
    ) -> Result<()> {
        if last >= 0 && (first < 0 || first > last) {
            return Err(CanopyError::InvalidRecord(format!(
                "invalid leaf path range [{first}, {last}]"
            )));
        }
        let max_path = self.table_config.max_path();
        if last > max_path {
            return Err(CanopyError::InvalidRecord(format!(
                "last leaf path {last} exceeds the table limit {max_path}"
            )));
        }
        let digest_len = self.table_config.digest().digest_len();
        for record in hashes {
            if record.path < 0 || record.path > max_path {
                return Err(CanopyError::InvalidRecord(format!(
                    "hash record path {} outside [0, {max_path}]",
                    record.path
                )));
            }
            if record.hash.len() != digest_len {
                return Err(CanopyError::InvalidRecord(format!(
                    "hash for path {} has {} bytes, expected {}",
                    record.path,
                    record.hash.len(),
                    digest_len
                )));
            }
        }
        for record in upserts {
            if record.path < 0 || record.path > max_path {
                return Err(CanopyError::InvalidRecord(format!(
                    "leaf record path {} outside [0, {max_path}]",
                    record.path
                )));
            }
            self.key_index.validate_key(&record.key)?;
        }
        for record in deletes {
            self.key_index.validate_key(&record.key)?;
        }
        Ok(())
    }

    fn write_hashes(&self, last_leaf_path: TreePath, hashes: Vec<HashRecord>) -> Result<()> {
        if let Some(store) = &self.hash_store {
            let range = hash_range(last_leaf_path);
            store.update_valid_key_range(range.min_valid_key, range.max_valid_key)?;
        }
        if hashes.is_empty() {
            return Ok(());
        }
        let count = hashes.len() as u64;
        let threshold = self.table_config.hashes_ram_to_disk_threshold();
        let (ram, disk): (Vec<_>, Vec<_>) =
            hashes.into_iter().partition(|record| record.path < threshold);

        if let Some(list) = &self.hash_ram {
            for record in ram {
                list.put(record.path, record.hash)?;
            }
        }
        if let (Some(store), false) = (&self.hash_store, disk.is_empty()) {
            store.start_writing()?;
            let written = disk
                .iter()
                .try_for_each(|record| store.put(record.path, &records::encode_hash(record)));
            let finished = store.end_writing();
            written?;
            if let Some(file) = finished? {
                self.metrics.set_flush_file_size(StoreKind::Hashes, file.size());
            }
            self.metrics
                .update_store_files(StoreKind::Hashes, store.data_files());
            self.compaction.compact_disk_store_for_hashes_async();
        }
        self.metrics.count_flush_hashes_written(count);
        Ok(())
    }

    fn write_leaves(
        &self,
        range: KeyRange,
        mut upserts: Vec<LeafRecord>,
        deletes: Vec<LeafRecord>,
        is_reconnect: bool,
    ) -> Result<()> {
        self.leaf_store
            .update_valid_key_range(range.min_valid_key, range.max_valid_key)?;
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        upserts.sort_by_key(|record| record.path);
        self.leaf_store.start_writing()?;
        if let Err(e) = self.key_index.start_writing() {
            let _ = self.leaf_store.end_writing();
            return Err(e);
        }
        let written = self.write_leaf_items(&upserts, &deletes, is_reconnect);
        let leaves_finished = self.leaf_store.end_writing();
        let keys_finished = self.key_index.end_writing();
        // Both stores now serve the new items, so lookups from here on cache them.
        for record in upserts.iter().chain(&deletes) {
            self.cache.invalidate(&record.key);
        }
        written?;

        if let Some(file) = leaves_finished? {
            self.metrics.set_flush_file_size(StoreKind::Leaves, file.size());
        }
        if let Some(file) = keys_finished? {
            self.metrics
                .set_flush_file_size(StoreKind::LeafKeys, file.size());
        }
        self.metrics
            .update_store_files(StoreKind::Leaves, self.leaf_store.data_files());
        if let Some(files) = self.key_index.data_files() {
            self.metrics.update_store_files(StoreKind::LeafKeys, files);
        }
        self.metrics.count_flush_leaves_written(upserts.len() as u64);
        self.metrics.count_flush_leaves_deleted(deletes.len() as u64);

        self.compaction.compact_path_to_key_value_async();
        self.compaction.compact_disk_store_for_key_to_path_async();
        Ok(())
    }

    fn write_leaf_items(
        &self,
        upserts: &[LeafRecord],
        deletes: &[LeafRecord],
        is_reconnect: bool,
    ) -> Result<()> {
        for record in upserts {
            self.key_index.put(&record.key, record.path)?;
            self.leaf_store
                .put(record.path, &records::encode_leaf(record))?;
        }
        for record in deletes {
            if is_reconnect {
                self.key_index.delete_if_equal(&record.key, record.path)?;
            } else {
                self.key_index.delete(&record.key)?;
            }
        }
        Ok(())
    }

    /// Load the leaf stored under `key`.
    pub fn load_leaf_record(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let (cached, generation) = self.cache.lookup(key);
        let path = match cached {
            Some(cached) => {
                if cached.path == INVALID_PATH {
                    return Ok(None);
                }
                if let Some(record) = cached.to_record() {
                    let in_range = self.valid_range.read().within_range(record.path);
                    return Ok(in_range.then_some(record));
                }
                cached.path
            }
            None => {
                self.metrics.count_leaf_key_read();
                let path = self.key_index.get(key)?;
                if path == INVALID_PATH {
                    self.cache.put_path_if_absent(
                        &Bytes::copy_from_slice(key),
                        INVALID_PATH,
                        generation,
                    );
                    return Ok(None);
                }
                path
            }
        };
        if !self.valid_range.read().within_range(path) {
            return Ok(None);
        }

        self.metrics.count_leaf_read();
        let Some(payload) = self.leaf_store.get(path)? else {
            return Ok(None);
        };
        let record = records::decode_leaf(payload)?;
        self.cache.put(
            CachedLeaf {
                key: record.key.clone(),
                path: record.path,
                value: Some(record.value.clone()),
            },
            generation,
        );
        Ok(Some(record))
    }

    /// Load the leaf stored at `path`. Paths outside the valid range are absent.
    pub fn load_leaf_record_by_path(&self, path: TreePath) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(CanopyError::InvalidPath(path));
        }
        if !self.valid_range.read().within_range(path) {
            return Ok(None);
        }
        self.metrics.count_leaf_read();
        self.leaf_store
            .get(path)?
            .map(records::decode_leaf)
            .transpose()
    }

    /// Path of `key`, or [`INVALID_PATH`] if the key is not stored.
    pub fn find_key(&self, key: &[u8]) -> Result<TreePath> {
        self.ensure_open()?;
        let (cached, generation) = self.cache.lookup(key);
        if let Some(cached) = cached {
            return Ok(cached.path);
        }
        self.metrics.count_leaf_key_read();
        let path = self.key_index.get(key)?;
        self.cache
            .put_path_if_absent(&Bytes::copy_from_slice(key), path, generation);
        Ok(path)
    }

    /// Load the hash at `path`. Paths past the last leaf are absent.
    pub fn load_hash(&self, path: TreePath) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(CanopyError::InvalidPath(path));
        }
        if path > self.valid_range.read().max_valid_key {
            return Ok(None);
        }
        if path < self.table_config.hashes_ram_to_disk_threshold() {
            self.metrics.count_hash_read_ram();
            return Ok(self.hash_ram.as_ref().and_then(|list| list.get(path)));
        }
        let Some(store) = &self.hash_store else {
            return Ok(None);
        };
        self.metrics.count_hash_read_disk();
        Ok(store
            .get(path)?
            .map(records::decode_hash)
            .transpose()?
            .map(|record| record.hash))
    }

    /// Write the hash at `path` to `out`. Returns whether a hash was found.
    pub fn load_and_write_hash<W: Write>(&self, path: TreePath, out: &mut W) -> Result<bool> {
        match self.load_hash(path)? {
            Some(hash) => {
                out.write_all(&hash)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Advisory size in bytes of a flush with the given numbers of dirty records.
    pub fn estimated_size(&self, dirty_internals: u64, dirty_leaves: u64) -> u64 {
        let digest = self.table_config.digest().digest_len() as u64;
        let internal = PATH_SIZE + digest;
        let leaf = PATH_SIZE
            + digest
            + PATH_SIZE
            + self.config.estimated_key_size as u64
            + self.config.estimated_value_size as u64;
        dirty_internals * internal + dirty_leaves * leaf
    }

    /// Write a consistent copy of every structure of this table into `target_dir`.
    /// Flushes and compaction index switches wait until the copy is done.
    pub fn snapshot(self: &Arc<Self>, target_dir: &Path) -> Result<()> {
        self.ensure_open()?;
        if self
            .snapshot_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CanopyError::SnapshotInProgress(self.table_name.clone()));
        }
        let _in_progress = ClearOnDrop(&self.snapshot_in_progress);

        let start = Instant::now();
        log::info!("[{}] Snapshot to {:?} started", self.table_name, target_dir);
        let _flush = self.flush_lock.lock();
        self.compaction.pause_compaction();
        let _paused = ResumeOnDrop(&self.compaction);
        fs::create_dir_all(target_dir)?;

        let tasks = self.snapshot_tasks(target_dir);
        let latch = Arc::new(CountDownLatch::new(tasks.len()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        for task in tasks {
            match task {
                Some(task) => self.dispatch(&self.snapshot_executor, &latch, &errors, task),
                None => latch.count_down(),
            }
        }
        latch.wait();

        let mut errors = std::mem::take(&mut *errors.lock());
        if !errors.is_empty() {
            return Err(errors.swap_remove(0));
        }
        log::info!(
            "[{}] Snapshot to {:?} finished in {:?}",
            self.table_name,
            target_dir,
            start.elapsed()
        );
        Ok(())
    }

    fn snapshot_tasks(self: &Arc<Self>, target_dir: &Path) -> Vec<Option<SnapshotTask>> {
        let has_disk_hashes = self.hash_store.is_some();
        vec![
            has_disk_hashes.then(|| self.snapshot_task(target_dir, Self::snapshot_internal_index)),
            Some(self.snapshot_task(target_dir, Self::snapshot_leaf_index)),
            self.hash_ram
                .is_some()
                .then(|| self.snapshot_task(target_dir, Self::snapshot_hash_list)),
            has_disk_hashes.then(|| self.snapshot_task(target_dir, Self::snapshot_hash_files)),
            Some(self.snapshot_task(target_dir, Self::snapshot_key_index)),
            Some(self.snapshot_task(target_dir, Self::snapshot_leaf_files)),
            Some(self.snapshot_task(target_dir, Self::snapshot_table_meta)),
        ]
    }

    fn snapshot_task(
        self: &Arc<Self>,
        target_dir: &Path,
        write: fn(&DataSource, &Path, bool) -> Result<()>,
    ) -> SnapshotTask {
        let this = Arc::clone(self);
        let target = target_dir.to_path_buf();
        let sync = self.config.sync_writes;
        Box::new(move || write(&this, &target, sync))
    }

    fn snapshot_internal_index(&self, target: &Path, sync: bool) -> Result<()> {
        match &self.hash_store {
            Some(store) => store.write_index(&target.join(INTERNAL_INDEX_FILE), sync),
            None => Ok(()),
        }
    }

    fn snapshot_leaf_index(&self, target: &Path, sync: bool) -> Result<()> {
        self.leaf_store
            .write_index(&target.join(LEAF_INDEX_FILE), sync)
    }

    fn snapshot_hash_list(&self, target: &Path, sync: bool) -> Result<()> {
        match &self.hash_ram {
            Some(list) => list.write_to_file(&target.join(HASHES_RAM_FILE), sync),
            None => Ok(()),
        }
    }

    fn snapshot_hash_files(&self, target: &Path, _sync: bool) -> Result<()> {
        match &self.hash_store {
            Some(store) => store.snapshot_files(&target.join(HASHES_DIR)),
            None => Ok(()),
        }
    }

    fn snapshot_key_index(&self, target: &Path, sync: bool) -> Result<()> {
        self.key_index.snapshot(target, sync)
    }

    fn snapshot_leaf_files(&self, target: &Path, _sync: bool) -> Result<()> {
        self.leaf_store.snapshot_files(&target.join(LEAVES_DIR))
    }

    fn snapshot_table_meta(&self, target: &Path, sync: bool) -> Result<()> {
        let range = *self.valid_range.read();
        fs_util::write_atomically(&target.join(TABLE_META_FILE), &encode_key_range(range), sync)
    }

    /// Stop compaction, drain the executors and persist every index. Later calls
    /// return immediately. Every failure is collected into one [`CanopyError::Close`].
    pub fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        log::info!("[{}] Closing data source", self.table_name);
        let flush = self.flush_lock.lock();
        let mut errors = Vec::new();
        let timeout = self.config.executor_shutdown_timeout;

        self.compaction.stop_and_disable_background_compaction();
        if !self.compaction.await_termination(timeout) {
            errors.push(timed_out(&self.table_name, "compaction", timeout));
        }
        for executor in [
            &self.hash_executor,
            &self.leaf_executor,
            &self.snapshot_executor,
        ] {
            executor.shutdown();
            if !executor.await_termination(timeout) {
                errors.push(timed_out(&self.table_name, executor.name(), timeout));
            }
        }

        let sync = self.config.sync_writes;
        let dir = &self.storage_dir;
        let mut persist = |what: &str, result: Result<()>| {
            if let Err(e) = result {
                log::error!("[{}] Failed to persist {}: {}", self.table_name, what, e);
                errors.push(e);
            }
        };
        if let Some(store) = &self.hash_store {
            persist(
                INTERNAL_INDEX_FILE,
                store.write_index(&dir.join(INTERNAL_INDEX_FILE), sync),
            );
        }
        persist(
            LEAF_INDEX_FILE,
            self.leaf_store.write_index(&dir.join(LEAF_INDEX_FILE), sync),
        );
        if let Some(list) = &self.hash_ram {
            persist(
                HASHES_RAM_FILE,
                list.write_to_file(&dir.join(HASHES_RAM_FILE), sync),
            );
        }
        persist("key index", self.key_index.persist(dir, sync));
        persist(TABLE_META_FILE, self.store_table_meta());
        self.metrics.publish();
        drop(flush);

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.open_counter.fetch_sub(1, Ordering::SeqCst);
        if let Some(database) = self.database.upgrade() {
            if let Err(e) = database.data_source_closed(self) {
                errors.push(e);
            }
        }
        log::info!("[{}] Data source closed", self.table_name);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CanopyError::Close {
                table: self.table_name.clone(),
                errors,
            })
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STATE_OPEN
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CanopyError::Closed(self.table_name.clone()));
        }
        Ok(())
    }

    fn store_table_meta(&self) -> Result<()> {
        let range = *self.valid_range.read();
        fs_util::write_atomically(
            &self.storage_dir.join(TABLE_META_FILE),
            &encode_key_range(range),
            self.config.sync_writes,
        )
    }

    fn index_memory(&self) -> u64 {
        self.hash_ram.as_ref().map_or(0, |list| list.memory_usage())
            + self
                .hash_store
                .as_ref()
                .map_or(0, |store| store.index().memory_usage())
            + self.leaf_store.index().memory_usage()
            + self.key_index.memory_usage()
    }

    fn refresh_store_metrics(&self) {
        if let Some(store) = &self.hash_store {
            self.metrics
                .update_store_files(StoreKind::Hashes, store.data_files());
        }
        if let Some(files) = self.key_index.data_files() {
            self.metrics.update_store_files(StoreKind::LeafKeys, files);
        }
        self.metrics
            .update_store_files(StoreKind::Leaves, self.leaf_store.data_files());
        self.metrics.set_index_memory(self.index_memory());
    }

    pub(crate) fn belongs_to(&self, database: &Database) -> bool {
        std::ptr::eq(self.database.as_ptr(), database)
    }

    /// Carry read and flush statistics over from the table this one replaces.
    pub fn copy_statistics_from(&self, other: &DataSource) {
        self.metrics.copy_from(&other.metrics);
    }

    pub fn first_leaf_path(&self) -> TreePath {
        self.valid_range.read().min_valid_key
    }

    pub fn last_leaf_path(&self) -> TreePath {
        self.valid_range.read().max_valid_key
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn table_config(&self) -> &TableConfig {
        &self.table_config
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn is_compaction_enabled(&self) -> bool {
        self.compaction.is_compaction_enabled()
    }

    pub fn compaction(&self) -> &CompactionCoordinator {
        &self.compaction
    }

    pub fn metrics(&self) -> &Arc<DataSourceMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("table_name", &self.table_name)
            .field("table_id", &self.table_id)
            .field("storage_dir", &self.storage_dir)
            .field("valid_range", &*self.valid_range.read())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ClearOnDrop<'a>(&'a AtomicBool);

struct CountDownOnDrop<'a>(&'a CountDownLatch);

impl Drop for CountDownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ResumeOnDrop<'a>(&'a CompactionCoordinator);

impl Drop for ResumeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.resume_compaction();
    }
}

/// Path range of on-disk hashes for a tree whose last leaf is at `last_leaf_path`.
fn hash_range(last_leaf_path: TreePath) -> KeyRange {
    if last_leaf_path < 0 {
        KeyRange::INVALID
    } else {
        KeyRange::new(0, last_leaf_path)
    }
}

/// Open a path index. The flag tells whether it must be rebuilt from data files.
fn open_index(path: &Path, disk_based: bool, force: bool) -> Result<(LongList, bool)> {
    let exists = path.exists();
    if disk_based {
        return Ok((LongList::load(path, true)?, force || !exists));
    }
    if force || !exists {
        return Ok((LongList::new_memory(), true));
    }
    Ok((LongList::load(path, false)?, false))
}

fn read_table_meta(storage_dir: &Path) -> Result<KeyRange> {
    let path = storage_dir.join(TABLE_META_FILE);
    match fs::read(&path) {
        Ok(bytes) => decode_key_range(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CanopyError::Corruption(
            format!("table directory {storage_dir:?} has no {TABLE_META_FILE}"),
        )),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn rebuild_sequential_keys(
    key_index: &KeyIndex,
    leaves: &DiskKeyValueStore,
    range: KeyRange,
) -> Result<usize> {
    if range.is_empty() {
        return Ok(0);
    }
    let mut count = 0;
    for path in range.min_valid_key.max(0)..=range.max_valid_key {
        if let Some(payload) = leaves.get(path)? {
            let record = records::decode_leaf(payload)?;
            key_index.put(&record.key, path)?;
            count += 1;
        }
    }
    Ok(count)
}

fn timed_out(table_name: &str, what: &str, timeout: Duration) -> CanopyError {
    CanopyError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("[{table_name}] {what} did not stop within {timeout:?}"),
    ))
}
