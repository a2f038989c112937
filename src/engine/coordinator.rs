//! CANOPY - Compaction Coordinator
//! Turns "compact store X" requests into at most one in-flight background task per
//! store of a data source, on the context's shared compaction pool.
//!
//! Requests for a store whose previous task is still running are dropped. A failed
//! compaction is logged and reported as `false`; it never reaches the caller or other
//! tables sharing the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::compaction::{Compactor, PauseGate};
use super::executor::{CancelToken, Executor, TaskHandle};
use super::metrics::StoreKind;

pub struct CompactionCoordinator {
    table_name: String,
    pool: Arc<Executor>,
    hashes: Option<Arc<Compactor>>,
    leaf_keys: Option<Arc<Compactor>>,
    leaves: Arc<Compactor>,
    gate: Arc<PauseGate>,
    in_flight: Mutex<HashMap<StoreKind, TaskHandle<bool>>>,
    cancelled: Mutex<Vec<TaskHandle<bool>>>,
    enabled: AtomicBool,
}

impl CompactionCoordinator {
    /// Compaction starts disabled.
    pub fn new(
        table_name: impl Into<String>,
        pool: Arc<Executor>,
        hashes: Option<Arc<Compactor>>,
        leaf_keys: Option<Arc<Compactor>>,
        leaves: Arc<Compactor>,
        gate: Arc<PauseGate>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            pool,
            hashes,
            leaf_keys,
            leaves,
            gate,
            in_flight: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
        }
    }

    /// Returns whether a new task was submitted.
    pub fn compact_disk_store_for_hashes_async(&self) -> bool {
        match &self.hashes {
            Some(compactor) => self.submit(compactor),
            None => false,
        }
    }

    pub fn compact_disk_store_for_key_to_path_async(&self) -> bool {
        match &self.leaf_keys {
            Some(compactor) => self.submit(compactor),
            None => false,
        }
    }

    pub fn compact_path_to_key_value_async(&self) -> bool {
        self.submit(&self.leaves)
    }

    fn submit(&self, compactor: &Arc<Compactor>) -> bool {
        let kind = compactor.kind();
        let mut in_flight = self.in_flight.lock();
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if in_flight.get(&kind).is_some_and(|handle| !handle.is_done()) {
            log::trace!(
                "[{}] {} compaction already running",
                self.table_name,
                kind
            );
            return false;
        }

        let table_name = self.table_name.clone();
        let compactor = Arc::clone(compactor);
        match self
            .pool
            .submit(move |cancel| Ok(run_compaction(&table_name, &compactor, cancel)))
        {
            Ok(handle) => {
                in_flight.insert(kind, handle);
                true
            }
            Err(e) => {
                log::warn!(
                    "[{}] Could not schedule {} compaction: {}",
                    self.table_name,
                    kind,
                    e
                );
                false
            }
        }
    }

    pub fn enable_background_compaction(&self) {
        let _in_flight = self.in_flight.lock();
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Cancel every in-flight task and drop further requests until re-enabled.
    pub fn stop_and_disable_background_compaction(&self) {
        let mut in_flight = self.in_flight.lock();
        self.enabled.store(false, Ordering::SeqCst);
        let mut cancelled = self.cancelled.lock();
        for (_, handle) in in_flight.drain() {
            handle.cancel();
            cancelled.push(handle);
        }
        cancelled.retain(|handle| !handle.is_done());
    }

    /// Wait for tracked and cancelled tasks to finish. Returns false on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let mut cancelled = self.cancelled.lock();
        for handle in cancelled.iter() {
            if !handle.wait_timeout(remaining()) {
                return false;
            }
        }
        cancelled.clear();
        drop(cancelled);
        let in_flight = self.in_flight.lock();
        in_flight
            .values()
            .all(|handle| handle.wait_timeout(remaining()))
    }

    /// Hold off the index-switching step of every compaction of this data source.
    /// Blocks until switches already in progress are done.
    pub fn pause_compaction(&self) {
        self.gate.pause();
    }

    pub fn resume_compaction(&self) {
        self.gate.resume();
    }

    pub fn is_compaction_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Tracked tasks that have not finished yet.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .values()
            .filter(|handle| !handle.is_done())
            .count()
    }
}

fn run_compaction(table_name: &str, compactor: &Compactor, cancel: &CancelToken) -> bool {
    match compactor.compact(cancel) {
        Ok(compacted) => compacted,
        Err(e) if e.is_interrupted() => {
            log::info!(
                "[{}] {} compaction interrupted",
                table_name,
                compactor.kind()
            );
            false
        }
        Err(e) => {
            log::error!(
                "[{}] {} compaction failed: {}",
                table_name,
                compactor.kind(),
                e
            );
            false
        }
    }
}

impl std::fmt::Debug for CompactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionCoordinator")
            .field("table_name", &self.table_name)
            .field("enabled", &self.is_compaction_enabled())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
