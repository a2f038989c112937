//! CANOPY - Snapshots and Imports
//! Point-in-time copies of tables, either into another database directory or into a
//! new table slot of a database.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{Database, METADATA_FILE, SHARED_DIR, TABLES_DIR};
use crate::engine::data_source::DataSource;
use crate::error::{CanopyError, Result};
use crate::fs_util;
use crate::table::metadata::{DatabaseMetadata, StoredTable};
use crate::table::TableMetadata;

impl Database {
    /// Snapshot one data source into a database directory at `destination`.
    pub fn snapshot(&self, destination: &Path, data_source: &Arc<DataSource>) -> Result<()> {
        self.snapshot_tables(destination, std::slice::from_ref(data_source))
    }

    /// Snapshot data sources of this database into a new database directory at
    /// `destination`. The copies keep their table ids and are all primary there.
    ///
    /// A destination that already holds exactly these table names is left alone.
    pub fn snapshot_tables(
        &self,
        destination: &Path,
        data_sources: &[Arc<DataSource>],
    ) -> Result<()> {
        if data_sources.iter().any(|ds| !ds.belongs_to(self)) {
            return Err(CanopyError::CrossDatabase);
        }
        let config = &self.shared.config;
        let metadata_path = destination.join(METADATA_FILE);
        let names: BTreeSet<&str> = data_sources.iter().map(|ds| ds.table_name()).collect();
        if let Some((existing, _)) =
            DatabaseMetadata::load(&metadata_path, config.max_tables, config.legacy_metadata_fallback)?
        {
            let existing_names: BTreeSet<&str> = existing
                .tables
                .iter()
                .map(|t| t.metadata.table_name.as_str())
                .collect();
            if existing_names == names {
                log::info!(
                    "Snapshot of {:?} already present at {:?}",
                    names,
                    destination
                );
                return Ok(());
            }
            return Err(CanopyError::SnapshotTargetExists(destination.to_path_buf()));
        }

        let start = Instant::now();
        std::fs::create_dir_all(destination.join(SHARED_DIR))?;
        std::fs::create_dir_all(destination.join(TABLES_DIR))?;
        let tables: Vec<TableMetadata> = data_sources
            .iter()
            .map(|ds| {
                TableMetadata::new(ds.table_id(), ds.table_name(), ds.table_config().copy())
            })
            .collect();

        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = data_sources
                .iter()
                .zip(&tables)
                .map(|(ds, metadata)| {
                    let target = destination.join(TABLES_DIR).join(metadata.dir_name());
                    scope.spawn(move || ds.snapshot(&target))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CanopyError::TaskFailed("table snapshot panicked".into()))
                    })
                })
                .collect()
        });
        for result in results {
            result?;
        }

        DatabaseMetadata {
            tables: tables
                .into_iter()
                .map(|metadata| StoredTable {
                    metadata,
                    primary: true,
                })
                .collect(),
        }
        .store(&metadata_path, config.sync_writes)?;
        log::info!(
            "Snapshot of {} tables to {:?} finished in {:?}",
            data_sources.len(),
            destination,
            start.elapsed()
        );
        Ok(())
    }

    /// Copy `source`, which may belong to another database, into a new table of this
    /// database with the same name.
    ///
    /// With `make_copy_primary`, the copy replaces the current primary table of that
    /// name, which becomes secondary and is deleted once closed. Otherwise the copy is
    /// secondary.
    pub fn import_data_source(
        &self,
        source: &Arc<DataSource>,
        make_copy_primary: bool,
        compaction_enabled: bool,
    ) -> Result<Arc<DataSource>> {
        let name = source.table_name();
        let metadata = {
            let mut state = self.state.lock();
            let id = state.allocate_id()?;
            let metadata = TableMetadata::new(id as u32, name, source.table_config().copy());
            state.tables[id] = Some(metadata.clone());
            metadata
        };
        let id = metadata.table_id as usize;
        let table_dir = self.table_dir(&metadata);

        let copied = fs_util::delete_directory_and_contents(&table_dir)
            .and_then(|_| source.snapshot(&table_dir))
            .and_then(|_| DataSource::open(self.env()?, table_dir.clone(), &metadata, false, compaction_enabled));

        let mut state = self.state.lock();
        let copy = match copied {
            Ok(copy) => copy,
            Err(e) => {
                state.release(id);
                drop(state);
                if let Err(cleanup_err) = fs_util::delete_directory_and_contents(&table_dir) {
                    log::warn!(
                        "Failed to remove partial copy {:?}: {}",
                        table_dir,
                        cleanup_err
                    );
                }
                return Err(e);
            }
        };
        state.data_sources[id] = Some(Arc::clone(&copy));
        if make_copy_primary {
            if let Some(previous) = state.primary_id(name) {
                state.primary.remove(&previous);
            }
            state.primary.insert(id);
        }
        self.store_metadata(&state)?;
        drop(state);

        copy.copy_statistics_from(source);
        log::info!(
            "Imported table {} (id {}) as table id {}, {}",
            name,
            source.table_id(),
            id,
            if make_copy_primary { "primary" } else { "secondary" }
        );
        Ok(copy)
    }
}
