//! CANOPY - Database
//! One storage directory: a fixed number of table slots, the metadata file listing
//! them, and the data sources currently open on them.
//!
//! ## Layout
//! ```text
//! metadata.cdb        tables of this database (see table::metadata)
//! shared/             reserved for data shared across tables
//! tables/{name}-{id}/ one directory per table
//! ```
//!
//! A table is *primary* when it backs a live tree. At most one primary table exists per
//! name. Secondary tables are transient copies: closing one deletes it.

mod context;
mod snapshot;

pub use context::Context;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::data_source::{DataSource, DataSourceEnv};
use crate::error::{CanopyError, Result};
use crate::fs_util;
use crate::table::metadata::{DatabaseMetadata, MetadataFormat, StoredTable};
use crate::table::{TableConfig, TableMetadata};

use self::context::Shared;

pub const METADATA_FILE: &str = "metadata.cdb";
pub const SHARED_DIR: &str = "shared";
pub const TABLES_DIR: &str = "tables";

struct DatabaseState {
    tables: Vec<Option<TableMetadata>>,
    data_sources: Vec<Option<Arc<DataSource>>>,
    primary: HashSet<usize>,
    next_id: usize,
}

impl DatabaseState {
    fn new(max_tables: usize) -> Self {
        Self {
            tables: vec![None; max_tables],
            data_sources: vec![None; max_tables],
            primary: HashSet::new(),
            next_id: 0,
        }
    }

    fn primary_id(&self, name: &str) -> Option<usize> {
        self.primary.iter().copied().find(|id| {
            self.tables[*id]
                .as_ref()
                .is_some_and(|t| t.table_name == name)
        })
    }

    /// Claim the next free slot, probing from a rotating cursor.
    fn allocate_id(&mut self) -> Result<usize> {
        let max_tables = self.tables.len();
        for step in 0..max_tables {
            let id = (self.next_id + step) % max_tables;
            if self.tables[id].is_none() {
                self.next_id = (id + 1) % max_tables;
                return Ok(id);
            }
        }
        Err(CanopyError::TablesExhausted(max_tables))
    }

    fn release(&mut self, id: usize) {
        self.tables[id] = None;
        self.data_sources[id] = None;
        self.primary.remove(&id);
    }

    fn to_metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            tables: self
                .tables
                .iter()
                .enumerate()
                .filter_map(|(id, table)| {
                    table.as_ref().map(|metadata| StoredTable {
                        metadata: metadata.clone(),
                        primary: self.primary.contains(&id),
                    })
                })
                .collect(),
        }
    }
}

pub struct Database {
    storage_dir: PathBuf,
    shared: Arc<Shared>,
    state: Mutex<DatabaseState>,
    this: Weak<Database>,
}

impl Database {
    /// Open the database in `storage_dir`, creating its directories and metadata file
    /// if needed. Secondary tables left by an earlier process are deleted.
    pub(crate) fn open(storage_dir: PathBuf, shared: Arc<Shared>) -> Result<Arc<Self>> {
        let config = &shared.config;
        std::fs::create_dir_all(storage_dir.join(SHARED_DIR))?;
        std::fs::create_dir_all(storage_dir.join(TABLES_DIR))?;

        let metadata_path = storage_dir.join(METADATA_FILE);
        let loaded = DatabaseMetadata::load(
            &metadata_path,
            config.max_tables,
            config.legacy_metadata_fallback,
        )?;
        let mut state = DatabaseState::new(config.max_tables);
        let mut rewrite = true;
        if let Some((metadata, format)) = loaded {
            rewrite = format == MetadataFormat::Legacy;
            let mut last_id = None;
            for stored in metadata.tables {
                let id = stored.metadata.table_id as usize;
                if !stored.primary {
                    log::info!(
                        "Dropping stale secondary table {} (id {}) from {:?}",
                        stored.metadata.table_name,
                        id,
                        storage_dir
                    );
                    fs_util::delete_directory_and_contents(
                        &storage_dir.join(TABLES_DIR).join(stored.metadata.dir_name()),
                    )?;
                    rewrite = true;
                    continue;
                }
                if state.primary_id(&stored.metadata.table_name).is_some() {
                    return Err(CanopyError::Corruption(format!(
                        "two primary tables named {}",
                        stored.metadata.table_name
                    )));
                }
                state.tables[id] = Some(stored.metadata);
                state.primary.insert(id);
                last_id = last_id.max(Some(id));
            }
            state.next_id = last_id.map_or(0, |id| (id + 1) % config.max_tables);
        }
        if rewrite {
            state
                .to_metadata()
                .store(&metadata_path, config.sync_writes)?;
        }

        log::info!(
            "Opened database at {:?} with {} tables",
            storage_dir,
            state.primary.len()
        );
        Ok(Arc::new_cyclic(|this| Self {
            storage_dir,
            shared,
            state: Mutex::new(state),
            this: this.clone(),
        }))
    }

    /// Create a new primary table and open it.
    pub fn create_data_source(
        &self,
        name: &str,
        table_config: &TableConfig,
        compaction_enabled: bool,
    ) -> Result<Arc<DataSource>> {
        let mut state = self.state.lock();
        if state.primary_id(name).is_some() {
            return Err(CanopyError::AlreadyExists(name.to_string()));
        }
        let id = state.allocate_id()?;
        let metadata = TableMetadata::new(id as u32, name, table_config.copy());
        state.tables[id] = Some(metadata.clone());
        state.primary.insert(id);

        let opened = self.store_metadata(&state).and_then(|_| {
            DataSource::open(
                self.env()?,
                self.table_dir(&metadata),
                &metadata,
                true,
                compaction_enabled,
            )
        });
        match opened {
            Ok(data_source) => {
                state.data_sources[id] = Some(Arc::clone(&data_source));
                log::info!("Created table {} (id {})", name, id);
                Ok(data_source)
            }
            Err(e) => {
                state.release(id);
                if let Err(store_err) = self.store_metadata(&state) {
                    log::error!("Failed to roll back table {}: {}", name, store_err);
                }
                Err(e)
            }
        }
    }

    /// Open the primary table named `name`, or return it if it is already open.
    pub fn get_data_source(&self, name: &str, compaction_enabled: bool) -> Result<Arc<DataSource>> {
        let mut state = self.state.lock();
        let id = state
            .primary_id(name)
            .ok_or_else(|| CanopyError::UnknownTable(name.to_string()))?;
        if let Some(open) = state.data_sources[id].as_ref().filter(|ds| !ds.is_closed()) {
            return Ok(Arc::clone(open));
        }
        let metadata = state.tables[id]
            .clone()
            .ok_or_else(|| CanopyError::UnknownTable(name.to_string()))?;
        let data_source = DataSource::open(
            self.env()?,
            self.table_dir(&metadata),
            &metadata,
            false,
            compaction_enabled,
        )?;
        state.data_sources[id] = Some(Arc::clone(&data_source));
        Ok(data_source)
    }

    /// Copy a table of this database into a new table slot. See
    /// [`import_data_source`](Self::import_data_source).
    pub fn copy_data_source(
        &self,
        source: &Arc<DataSource>,
        make_copy_primary: bool,
    ) -> Result<Arc<DataSource>> {
        if !source.belongs_to(self) {
            return Err(CanopyError::CrossDatabase);
        }
        self.import_data_source(source, make_copy_primary, source.is_compaction_enabled())
    }

    /// Close a data source of this database. A secondary table is deleted.
    pub fn close_data_source(&self, data_source: &DataSource) -> Result<()> {
        if !data_source.belongs_to(self) {
            return Err(CanopyError::CrossDatabase);
        }
        data_source.close()
    }

    /// Called by a data source once it is closed.
    pub(crate) fn data_source_closed(&self, data_source: &DataSource) -> Result<()> {
        let id = data_source.table_id() as usize;
        let mut state = self.state.lock();
        let Some(slot) = state.data_sources.get(id) else {
            return Ok(());
        };
        if slot
            .as_ref()
            .is_some_and(|open| std::ptr::eq(Arc::as_ptr(open), data_source))
        {
            state.data_sources[id] = None;
        }
        if state.primary.contains(&id) {
            return Ok(());
        }
        let Some(metadata) = state.tables[id].clone() else {
            return Ok(());
        };
        if metadata.table_name != data_source.table_name() {
            return Ok(());
        }
        state.release(id);
        self.store_metadata(&state)?;
        fs_util::delete_directory_and_contents(&self.table_dir(&metadata))?;
        log::info!(
            "Deleted secondary table {} (id {})",
            metadata.table_name,
            id
        );
        Ok(())
    }

    pub fn is_primary(&self, data_source: &DataSource) -> bool {
        data_source.belongs_to(self)
            && self
                .state
                .lock()
                .primary
                .contains(&(data_source.table_id() as usize))
    }

    /// Id of the primary table named `name`.
    pub fn primary_table_id(&self, name: &str) -> Option<u32> {
        self.state.lock().primary_id(name).map(|id| id as u32)
    }

    /// Metadata of every table, primary or not, in id order.
    pub fn tables(&self) -> Vec<TableMetadata> {
        self.state.lock().tables.iter().flatten().cloned().collect()
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn table_dir(&self, metadata: &TableMetadata) -> PathBuf {
        self.storage_dir.join(TABLES_DIR).join(metadata.dir_name())
    }

    fn store_metadata(&self, state: &DatabaseState) -> Result<()> {
        state.to_metadata().store(
            &self.storage_dir.join(METADATA_FILE),
            self.shared.config.sync_writes,
        )
    }

    fn env(&self) -> Result<DataSourceEnv> {
        Ok(DataSourceEnv {
            config: Arc::clone(&self.shared.config),
            sink: Arc::clone(&self.shared.sink),
            compaction_pool: self.shared.compaction_pool()?,
            open_counter: Arc::clone(&self.shared.open_data_sources),
            database: self.this.clone(),
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}
