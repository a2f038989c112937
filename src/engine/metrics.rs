//! CANOPY - Data Source Metrics
//! Lock-free counters for reads, flushes, store files and compaction,
//! mirrored to an external [`MetricsSink`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::file_collection::DataFileCollection;

/// Receiver of named counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, delta: u64);
    fn gauge(&self, name: &str, value: f64);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

/// The three file-backed stores of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    Hashes,
    LeafKeys,
    Leaves,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [StoreKind::Hashes, StoreKind::LeafKeys, StoreKind::Leaves];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Hashes => "hashes",
            StoreKind::LeafKeys => "leaf_keys",
            StoreKind::Leaves => "leaves",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct StoreStats {
    file_count: AtomicU64,
    file_size: AtomicU64,
    last_flush_file_size: AtomicU64,
    size_by_level: Mutex<BTreeMap<u16, u64>>,
    compactions: AtomicU64,
    compaction_time_ms: AtomicU64,
    space_saved: AtomicU64,
}

/// Counters of one data source. All use `Ordering::Relaxed`.
pub struct DataSourceMetrics {
    table_name: String,
    sink: Arc<dyn MetricsSink>,
    pub hash_reads_ram: AtomicU64,
    pub hash_reads_disk: AtomicU64,
    pub leaf_reads: AtomicU64,
    pub leaf_key_reads: AtomicU64,
    pub flush_hashes_written: AtomicU64,
    pub flush_leaves_written: AtomicU64,
    pub flush_leaf_keys_written: AtomicU64,
    pub flush_leaves_deleted: AtomicU64,
    pub index_memory_bytes: AtomicU64,
    stores: [StoreStats; 3],
    opened: Instant,
}

impl DataSourceMetrics {
    pub fn new(table_name: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            table_name: table_name.into(),
            sink,
            hash_reads_ram: AtomicU64::new(0),
            hash_reads_disk: AtomicU64::new(0),
            leaf_reads: AtomicU64::new(0),
            leaf_key_reads: AtomicU64::new(0),
            flush_hashes_written: AtomicU64::new(0),
            flush_leaves_written: AtomicU64::new(0),
            flush_leaf_keys_written: AtomicU64::new(0),
            flush_leaves_deleted: AtomicU64::new(0),
            index_memory_bytes: AtomicU64::new(0),
            stores: Default::default(),
            opened: Instant::now(),
        }
    }

    pub fn count_hash_read_ram(&self) {
        self.hash_reads_ram.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_hash_read_disk(&self) {
        self.hash_reads_disk.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_leaf_read(&self) {
        self.leaf_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_leaf_key_read(&self) {
        self.leaf_key_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_flush_hashes_written(&self, count: u64) {
        self.flush_hashes_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn count_flush_leaves_written(&self, count: u64) {
        self.flush_leaves_written.fetch_add(count, Ordering::Relaxed);
        self.flush_leaf_keys_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn count_flush_leaves_deleted(&self, count: u64) {
        self.flush_leaves_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_index_memory(&self, bytes: u64) {
        self.index_memory_bytes.store(bytes, Ordering::Relaxed);
        self.sink.gauge(&self.name("index_memory_bytes"), bytes as f64);
    }

    pub fn set_flush_file_size(&self, kind: StoreKind, size: u64) {
        self.stores[kind.slot()]
            .last_flush_file_size
            .store(size, Ordering::Relaxed);
        self.sink
            .gauge(&self.store_name(kind, "flush_file_size"), size as f64);
    }

    /// Refresh file count, total size and per-level sizes of a store.
    pub fn update_store_files(&self, kind: StoreKind, files: &DataFileCollection) {
        let stats = &self.stores[kind.slot()];
        let count = files.file_count() as u64;
        let size = files.total_size();
        stats.file_count.store(count, Ordering::Relaxed);
        stats.file_size.store(size, Ordering::Relaxed);
        let levels = files.size_by_level();
        for (level, bytes) in &levels {
            self.sink.gauge(
                &self.store_name(kind, &format!("level_{level}_size")),
                *bytes as f64,
            );
        }
        *stats.size_by_level.lock() = levels;
        self.sink.gauge(&self.store_name(kind, "files"), count as f64);
        self.sink.gauge(&self.store_name(kind, "file_size"), size as f64);
    }

    pub fn record_compaction(&self, kind: StoreKind, elapsed: Duration, space_saved: u64) {
        let stats = &self.stores[kind.slot()];
        let ms = elapsed.as_millis() as u64;
        stats.compactions.fetch_add(1, Ordering::Relaxed);
        stats.compaction_time_ms.fetch_add(ms, Ordering::Relaxed);
        stats.space_saved.fetch_add(space_saved, Ordering::Relaxed);
        self.sink.counter(&self.store_name(kind, "compactions"), 1);
        self.sink
            .counter(&self.store_name(kind, "compaction_time_ms"), ms);
        self.sink
            .counter(&self.store_name(kind, "compaction_space_saved"), space_saved);
    }

    pub fn store_file_count(&self, kind: StoreKind) -> u64 {
        self.stores[kind.slot()].file_count.load(Ordering::Relaxed)
    }

    pub fn store_file_size(&self, kind: StoreKind) -> u64 {
        self.stores[kind.slot()].file_size.load(Ordering::Relaxed)
    }

    pub fn compactions(&self, kind: StoreKind) -> u64 {
        self.stores[kind.slot()].compactions.load(Ordering::Relaxed)
    }

    pub fn space_saved(&self, kind: StoreKind) -> u64 {
        self.stores[kind.slot()].space_saved.load(Ordering::Relaxed)
    }

    /// Push read and flush counters to the sink as gauges.
    pub fn publish(&self) {
        let counters = [
            ("hash_reads_ram", &self.hash_reads_ram),
            ("hash_reads_disk", &self.hash_reads_disk),
            ("leaf_reads", &self.leaf_reads),
            ("leaf_key_reads", &self.leaf_key_reads),
            ("flush_hashes_written", &self.flush_hashes_written),
            ("flush_leaves_written", &self.flush_leaves_written),
            ("flush_leaf_keys_written", &self.flush_leaf_keys_written),
            ("flush_leaves_deleted", &self.flush_leaves_deleted),
        ];
        for (name, counter) in counters {
            self.sink
                .gauge(&self.name(name), counter.load(Ordering::Relaxed) as f64);
        }
    }

    /// Carry read and flush counters over from another data source, e.g. the table
    /// this one was copied from.
    pub fn copy_from(&self, other: &DataSourceMetrics) {
        let pairs = [
            (&self.hash_reads_ram, &other.hash_reads_ram),
            (&self.hash_reads_disk, &other.hash_reads_disk),
            (&self.leaf_reads, &other.leaf_reads),
            (&self.leaf_key_reads, &other.leaf_key_reads),
            (&self.flush_hashes_written, &other.flush_hashes_written),
            (&self.flush_leaves_written, &other.flush_leaves_written),
            (&self.flush_leaf_keys_written, &other.flush_leaf_keys_written),
            (&self.flush_leaves_deleted, &other.flush_leaves_deleted),
        ];
        for (mine, theirs) in pairs {
            mine.store(theirs.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.opened.elapsed().as_secs_f64()
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        let mut out = format!(
            "\n═══ CANOPY Data Source Metrics [{}] ═══\n\
             Reads:\n\
               hashes (ram):  {}\n\
               hashes (disk): {}\n\
               leaves:        {}\n\
               leaf keys:     {}\n\
             Flushes:\n\
               hashes written:    {}\n\
               leaves written:    {}\n\
               leaf keys written: {}\n\
               leaves deleted:    {}\n\
             Index memory: {} bytes\n",
            self.table_name,
            self.hash_reads_ram.load(Ordering::Relaxed),
            self.hash_reads_disk.load(Ordering::Relaxed),
            self.leaf_reads.load(Ordering::Relaxed),
            self.leaf_key_reads.load(Ordering::Relaxed),
            self.flush_hashes_written.load(Ordering::Relaxed),
            self.flush_leaves_written.load(Ordering::Relaxed),
            self.flush_leaf_keys_written.load(Ordering::Relaxed),
            self.flush_leaves_deleted.load(Ordering::Relaxed),
            self.index_memory_bytes.load(Ordering::Relaxed),
        );
        for kind in StoreKind::ALL {
            let stats = &self.stores[kind.slot()];
            out.push_str(&format!(
                "Store {}:\n\
                   files:        {} ({} bytes)\n\
                   compactions:  {} ({} ms, {} bytes saved)\n",
                kind,
                stats.file_count.load(Ordering::Relaxed),
                stats.file_size.load(Ordering::Relaxed),
                stats.compactions.load(Ordering::Relaxed),
                stats.compaction_time_ms.load(Ordering::Relaxed),
                stats.space_saved.load(Ordering::Relaxed),
            ));
        }
        out.push_str(&format!("Uptime: {:.2}s", self.uptime_secs()));
        out
    }

    fn name(&self, metric: &str) -> String {
        format!("{}.{}", self.table_name, metric)
    }

    fn store_name(&self, kind: StoreKind, metric: &str) -> String {
        format!("{}.{}.{}", self.table_name, kind, metric)
    }
}

impl fmt::Debug for DataSourceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceMetrics")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        counters: Mutex<Vec<(String, u64)>>,
        gauges: Mutex<Vec<(String, f64)>>,
    }

    impl MetricsSink for RecordingSink {
        fn counter(&self, name: &str, delta: u64) {
            self.counters.lock().push((name.to_string(), delta));
        }

        fn gauge(&self, name: &str, value: f64) {
            self.gauges.lock().push((name.to_string(), value));
        }
    }

    #[test]
    fn test_record_operations() {
        let m = DataSourceMetrics::new("t", Arc::new(NoopSink));
        m.count_hash_read_ram();
        m.count_hash_read_disk();
        m.count_hash_read_disk();
        m.count_leaf_read();
        m.count_flush_leaves_written(5);
        m.count_flush_leaves_deleted(2);

        assert_eq!(m.hash_reads_ram.load(Ordering::Relaxed), 1);
        assert_eq!(m.hash_reads_disk.load(Ordering::Relaxed), 2);
        assert_eq!(m.leaf_reads.load(Ordering::Relaxed), 1);
        assert_eq!(m.flush_leaves_written.load(Ordering::Relaxed), 5);
        assert_eq!(m.flush_leaf_keys_written.load(Ordering::Relaxed), 5);
        assert_eq!(m.flush_leaves_deleted.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_compaction_goes_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let m = DataSourceMetrics::new("accounts", sink.clone());
        m.record_compaction(StoreKind::Leaves, Duration::from_millis(12), 4096);

        assert_eq!(m.compactions(StoreKind::Leaves), 1);
        assert_eq!(m.space_saved(StoreKind::Leaves), 4096);
        assert_eq!(m.compactions(StoreKind::Hashes), 0);
        let counters = sink.counters.lock();
        assert!(counters
            .iter()
            .any(|(name, v)| name == "accounts.leaves.compaction_space_saved" && *v == 4096));
    }

    #[test]
    fn test_publish_emits_gauges() {
        let sink = Arc::new(RecordingSink::default());
        let m = DataSourceMetrics::new("t", sink.clone());
        m.count_leaf_key_read();
        m.publish();
        assert!(sink
            .gauges
            .lock()
            .iter()
            .any(|(name, v)| name == "t.leaf_key_reads" && *v == 1.0));
    }

    #[test]
    fn test_copy_from() {
        let a = DataSourceMetrics::new("a", Arc::new(NoopSink));
        let b = DataSourceMetrics::new("b", Arc::new(NoopSink));
        a.count_leaf_read();
        b.copy_from(&a);
        assert_eq!(b.leaf_reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_report_format() {
        let m = DataSourceMetrics::new("t", Arc::new(NoopSink));
        let report = m.report();
        assert!(report.contains("hashes (ram):"));
        assert!(report.contains("Store leaves:"));
        assert!(report.contains("Uptime:"));
    }
}
