//! CANOPY - Registry Context
//! Owns every open database of a process (or test), keyed by canonical storage path,
//! together with the compaction pool shared by all their data sources.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Database, METADATA_FILE, SHARED_DIR, TABLES_DIR};
use crate::config::Config;
use crate::engine::executor::Executor;
use crate::engine::metrics::{MetricsSink, NoopSink};
use crate::error::{CanopyError, Result};
use crate::fs_util;

/// State every database of a context shares.
pub(crate) struct Shared {
    pub config: Arc<Config>,
    pub sink: Arc<dyn MetricsSink>,
    pub open_data_sources: Arc<AtomicUsize>,
    compaction_pool: Mutex<Option<Arc<Executor>>>,
}

impl Shared {
    /// The compaction pool, started on first use.
    pub fn compaction_pool(&self) -> Result<Arc<Executor>> {
        let mut pool = self.compaction_pool.lock();
        if let Some(pool) = pool.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let executor = Arc::new(Executor::new("canopy-compaction", self.config.compaction_threads)?);
        log::debug!(
            "Started compaction pool with {} threads",
            self.config.compaction_threads
        );
        *pool = Some(Arc::clone(&executor));
        Ok(executor)
    }
}

/// Registry of databases.
///
/// ## Example
/// ```no_run
/// use canopy::{Config, Context, DigestKind, TableConfig};
///
/// let context = Context::new(Config::new("./data/canopy")).unwrap();
/// let database = context.default_instance().unwrap();
/// let config = TableConfig::new(DigestKind::Sha384, 1_000_000, 1 << 20).unwrap();
/// let accounts = database.create_data_source("accounts", &config, true).unwrap();
/// accounts.close().unwrap();
/// ```
pub struct Context {
    shared: Arc<Shared>,
    instances: Mutex<HashMap<PathBuf, Arc<Database>>>,
    default_path: Mutex<Option<PathBuf>>,
}

impl Context {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoopSink))
    }

    /// A context whose data sources report to `sink`.
    pub fn with_metrics(config: Config, sink: Arc<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                sink,
                open_data_sources: Arc::new(AtomicUsize::new(0)),
                compaction_pool: Mutex::new(None),
            }),
            instances: Mutex::new(HashMap::new()),
            default_path: Mutex::new(None),
        })
    }

    /// The database in `path`, or in the default path when `None`. Opened on first use;
    /// later calls with any spelling of the same directory return the same instance.
    pub fn get_instance(&self, path: Option<&Path>) -> Result<Arc<Database>> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.default_path(),
        };
        fs::create_dir_all(&path)?;
        let canonical = fs::canonicalize(&path)?;

        let mut instances = self.instances.lock();
        if let Some(database) = instances.get(&canonical) {
            return Ok(Arc::clone(database));
        }
        let database = Database::open(canonical.clone(), Arc::clone(&self.shared))?;
        instances.insert(canonical, Arc::clone(&database));
        Ok(database)
    }

    pub fn default_instance(&self) -> Result<Arc<Database>> {
        self.get_instance(None)
    }

    pub fn set_default_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        log::debug!("Default database path set to {:?}", path);
        *self.default_path.lock() = Some(path);
    }

    /// Go back to the configured default storage directory.
    pub fn reset_default_instance_path(&self) {
        *self.default_path.lock() = None;
    }

    pub fn default_path(&self) -> PathBuf {
        self.default_path
            .lock()
            .clone()
            .unwrap_or_else(|| self.shared.config.default_storage_dir.clone())
    }

    /// Create a database at `target` (the default path when `None`) from a snapshot at
    /// `source`. Data files are hard-linked, the metadata file is copied, so the new
    /// database never writes into the snapshot.
    pub fn restore(&self, source: &Path, target: Option<&Path>) -> Result<Arc<Database>> {
        let target = match target {
            Some(target) => target.to_path_buf(),
            None => self.default_path(),
        };
        let target_metadata = target.join(METADATA_FILE);
        if target_metadata.exists() {
            return Err(CanopyError::AlreadyRestored(target));
        }
        let source_metadata = source.join(METADATA_FILE);
        if !source_metadata.exists() {
            return Err(CanopyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no database snapshot at {source:?}"),
            )));
        }

        log::info!("Restoring database {:?} from {:?}", target, source);
        fs::create_dir_all(&target)?;
        fs_util::hard_link_tree(&source.join(SHARED_DIR), &target.join(SHARED_DIR))?;
        fs_util::hard_link_tree(&source.join(TABLES_DIR), &target.join(TABLES_DIR))?;
        let bytes = fs::read(&source_metadata)?;
        fs_util::write_atomically(&target_metadata, &bytes, self.shared.config.sync_writes)?;

        self.get_instance(Some(&target))
    }

    /// Data sources opened through this context and not closed yet.
    pub fn open_data_sources(&self) -> usize {
        self.shared.open_data_sources.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("default_path", &self.default_path())
            .field("instances", &self.instances.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &Path) -> Context {
        Context::new(Config::new(dir.join("default")).with_sync_writes(false)).unwrap()
    }

    #[test]
    fn test_same_path_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path());
        let a = context.get_instance(Some(&dir.path().join("db"))).unwrap();
        let b = context
            .get_instance(Some(&dir.path().join("db").join("..").join("db")))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(dir.path().join("db").join(METADATA_FILE).exists());
        assert!(dir.path().join("db").join(SHARED_DIR).is_dir());
        assert!(dir.path().join("db").join(TABLES_DIR).is_dir());
    }

    #[test]
    fn test_default_path_switching() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path());
        let default = context.default_instance().unwrap();
        context.set_default_path(dir.path().join("other"));
        let other = context.default_instance().unwrap();
        assert!(!Arc::ptr_eq(&default, &other));
        context.reset_default_instance_path();
        assert!(Arc::ptr_eq(&default, &context.default_instance().unwrap()));
    }

    #[test]
    fn test_restore_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path());
        context.get_instance(Some(&dir.path().join("a"))).unwrap();
        context.get_instance(Some(&dir.path().join("b"))).unwrap();
        assert!(matches!(
            context.restore(&dir.path().join("a"), Some(&dir.path().join("b"))),
            Err(CanopyError::AlreadyRestored(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).with_compaction_threads(0);
        assert!(matches!(Context::new(config), Err(CanopyError::Config(_))));
    }
}
