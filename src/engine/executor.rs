//! CANOPY - Worker Threads
//! Fixed-size thread pools, cancellable task handles and a countdown latch.
//!
//! Every data source owns single-purpose pools for hash writes, leaf writes and snapshot
//! sub-tasks. All data sources of a context share one compaction pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CanopyError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag shared between a task and its handle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Interrupted` once the token is cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CanopyError::Interrupted("task cancelled".into()));
        }
        Ok(())
    }
}

struct TaskState<T> {
    result: Mutex<Option<Result<T>>>,
    done: AtomicBool,
    finished: Condvar,
    cancel: CancelToken,
}

/// Handle to a task submitted with [`Executor::submit`].
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    /// Ask the task to stop. A task that has not started yet will not run.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Wait until the task is done. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut result = self.state.result.lock();
        while !self.is_done() {
            if self.state.finished.wait_until(&mut result, deadline).timed_out() {
                return self.is_done();
            }
        }
        true
    }

    /// Block until the task completes and take its result.
    pub fn wait(self) -> Result<T> {
        let mut result = self.state.result.lock();
        while !self.is_done() {
            self.state.finished.wait(&mut result);
        }
        result
            .take()
            .unwrap_or_else(|| Err(CanopyError::InvalidState("task result already taken".into())))
    }
}

struct PoolState {
    live_workers: Mutex<usize>,
    terminated: Condvar,
}

/// A fixed-size pool of named worker threads fed through a channel.
pub struct Executor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    pool: Arc<PoolState>,
}

impl Executor {
    /// Spawn `threads` workers named `{name}-{n}`.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        if threads == 0 {
            return Err(CanopyError::Config(format!(
                "executor {name} needs at least one thread"
            )));
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pool = Arc::new(PoolState {
            live_workers: Mutex::new(0),
            terminated: Condvar::new(),
        });

        let executor = Self {
            name: name.clone(),
            sender: Mutex::new(Some(sender)),
            pool: Arc::clone(&pool),
        };
        for n in 0..threads {
            let receiver = Arc::clone(&receiver);
            let pool = Arc::clone(&pool);
            *pool.live_workers.lock() += 1;
            let spawned = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(receiver, pool));
            if let Err(e) = spawned {
                *executor.pool.live_workers.lock() -= 1;
                executor.shutdown();
                return Err(e.into());
            }
        }
        Ok(executor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Fails once the executor is shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| CanopyError::Closed(self.name.clone()))?;
        sender
            .send(Box::new(job))
            .map_err(|_| CanopyError::Closed(self.name.clone()))
    }

    /// Queue a cancellable task and return a handle to its result.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let state = Arc::new(TaskState {
            result: Mutex::new(None),
            done: AtomicBool::new(false),
            finished: Condvar::new(),
            cancel: CancelToken::new(),
        });
        let task_state = Arc::clone(&state);
        self.execute(move || {
            let cancel = task_state.cancel.clone();
            let outcome = match cancel.check() {
                Ok(()) => panic::catch_unwind(AssertUnwindSafe(|| task(&cancel)))
                    .unwrap_or_else(|_| Err(CanopyError::TaskFailed("task panicked".into()))),
                Err(e) => Err(e),
            };
            let mut result = task_state.result.lock();
            *result = Some(outcome);
            task_state.done.store(true, Ordering::SeqCst);
            task_state.finished.notify_all();
        })?;
        Ok(TaskHandle { state })
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Wait for every worker to exit after [`shutdown`](Self::shutdown).
    /// Returns false on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.pool.live_workers.lock();
        while *live > 0 {
            if self.pool.terminated.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Workers exit once the queue drains; nobody waits for them here.
        self.shutdown();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, pool: Arc<PoolState>) {
    loop {
        let job = receiver.lock().recv();
        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!(
                        "Job panicked on thread {:?}",
                        thread::current().name().unwrap_or("<unnamed>")
                    );
                }
            }
            Err(_) => break,
        }
    }
    let mut live = pool.live_workers.lock();
    *live -= 1;
    if *live == 0 {
        pool.terminated.notify_all();
    }
}

/// Blocks waiters until `count_down` has been called `count` times.
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Returns false if the count did not reach zero in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
