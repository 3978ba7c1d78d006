//!
//! Fixed-size Worker Pool
//!
//! N named worker threads drain a shared FIFO queue of work items. Features:
//!
//! - Submission never blocks; the queue is bounded only by memory
//! - Items are dequeued in submission order, but with N > 1 workers their
//!   completion order is not defined
//! - A panicking or failing item is logged and isolated; the worker keeps going
//! - `join` waits for every item submitted before it, then stops the workers
//! - Dropping or joining the pool from one of its own workers stops intake
//!   and detaches the workers instead of waiting on itself
//!

use std::collections::VecDeque;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, trace, warn};

use crate::config::PoolConfig;
use crate::error::SyncError;
use crate::poison;

/// A deferred invocation: a callable plus everything it captured.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    items: VecDeque<WorkItem>,
    /// Queued plus currently executing items.
    outstanding: usize,
    accepting: bool,
    shutdown: bool,
}

/// The queue shared by all workers of one pool
struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                outstanding: 0,
                accepting: true,
                shutdown: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn push(&self, item: WorkItem) -> Result<(), SyncError> {
        let mut state = poison::lock(&self.state);
        if !state.accepting {
            return Err(SyncError::PoolStopped);
        }
        state.items.push_back(item);
        state.outstanding += 1;
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<WorkItem> {
        let mut state = poison::lock(&self.state);
        while state.items.is_empty() && !state.shutdown {
            state = poison::wait(&self.available, state);
        }
        state.items.pop_front()
    }

    fn finish_one(&self) {
        let mut state = poison::lock(&self.state);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn stop_accepting(&self) {
        poison::lock(&self.state).accepting = false;
    }

    fn wait_idle(&self) {
        let mut state = poison::lock(&self.state);
        while state.outstanding > 0 {
            state = poison::wait(&self.idle, state);
        }
    }

    fn shutdown(&self) {
        poison::lock(&self.state).shutdown = true;
        self.available.notify_all();
    }

    fn outstanding(&self) -> usize {
        poison::lock(&self.state).outstanding
    }
}

/// The pool's threads and how far `join` has got with them.
struct Workers {
    ids: Vec<ThreadId>,
    handles: Vec<JoinHandle<()>>,
    joining: bool,
    joined: bool,
}

/// A pool of worker threads executing scheduled work items.
///
/// The pool can be shared across threads (e.g. behind an `Arc`); any of
/// them may schedule work or call `join`.
pub struct WorkerPool {
    name: String,
    queue: Arc<WorkQueue>,
    workers: Mutex<Workers>,
    joined: Condvar,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, SyncError> {
        Self::with_name("strand", workers)
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, SyncError> {
        Self::with_name(config.name.clone(), config.workers)
    }

    /// Starts `workers` threads named `{name}-worker-{index}`.
    pub fn with_name(name: impl Into<String>, workers: usize) -> Result<Self, SyncError> {
        if workers == 0 {
            return Err(SyncError::InvalidWorkerCount { count: workers });
        }

        let pool = Self {
            name: name.into(),
            queue: Arc::new(WorkQueue::new()),
            workers: Mutex::new(Workers {
                ids: Vec::with_capacity(workers),
                handles: Vec::with_capacity(workers),
                joining: false,
                joined: false,
            }),
            joined: Condvar::new(),
            worker_count: workers,
        };

        for index in 0..workers {
            let queue = Arc::clone(&pool.queue);
            // On failure `pool` is dropped here, which joins the workers already started.
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", pool.name, index))
                .spawn(move || worker_loop(index, queue))?;
            let mut started = poison::lock(&pool.workers);
            started.ids.push(handle.thread().id());
            started.handles.push(handle);
        }

        debug!(pool = %pool.name, workers, "worker pool started");
        Ok(pool)
    }

    pub fn schedule<F>(&self, work: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(work))
    }

    /// Schedules an item whose error, if any, is logged and dropped.
    pub fn schedule_fallible<F, E>(&self, work: F) -> Result<(), SyncError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        self.schedule(move || {
            if let Err(e) = work() {
                warn!(error = %e, "work item failed");
            }
        })
    }

    /// Blocks until every item scheduled so far has completed, then stops
    /// and joins the worker threads. Later `schedule` calls fail with
    /// `SyncError::PoolStopped`.
    ///
    /// Concurrent callers all block until the workers have been joined;
    /// once that has happened, further calls return immediately.
    ///
    /// Called from one of the pool's own workers (including by dropping the
    /// last handle to the pool inside a work item), `join` cannot wait for
    /// itself: it stops accepting work, lets the queued items drain and
    /// detaches the worker threads, then returns without blocking.
    pub fn join(&self) {
        if self.on_worker_thread() {
            self.detach_workers();
            return;
        }

        self.queue.stop_accepting();
        self.queue.wait_idle();
        self.queue.shutdown();

        let handles = {
            let mut workers = poison::lock(&self.workers);
            if workers.joining {
                while !workers.joined {
                    workers = poison::wait(&self.joined, workers);
                }
                return;
            }
            workers.joining = true;
            std::mem::take(&mut workers.handles)
        };

        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread terminated abnormally");
            }
        }

        poison::lock(&self.workers).joined = true;
        self.joined.notify_all();
        debug!(pool = %self.name, "worker pool joined");
    }

    fn on_worker_thread(&self) -> bool {
        let current = thread::current().id();
        poison::lock(&self.workers).ids.contains(&current)
    }

    fn detach_workers(&self) {
        self.queue.stop_accepting();
        self.queue.shutdown();

        let detached = {
            let mut workers = poison::lock(&self.workers);
            if workers.joining {
                // another thread is joining the workers and will mark them joined
                return;
            }
            workers.joining = true;
            workers.joined = true;
            std::mem::take(&mut workers.handles).len()
        };
        self.joined.notify_all();
        warn!(
            pool = %self.name,
            detached,
            "worker pool joined from its own worker; queued items drain on detached workers"
        );
    }

    /// Items queued or executing.
    pub fn outstanding(&self) -> usize {
        self.queue.outstanding()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(index: usize, queue: Arc<WorkQueue>) {
    while let Some(item) = queue.pop() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item)) {
            error!(worker = index, panic = panic_message(&*payload), "work item panicked");
        }
        queue.finish_one();
    }
    trace!(worker = index, "worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
