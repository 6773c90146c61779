//! Task substrate
//!
//! Two worker pools fed by crossbeam channels:
//!
//! - [`ParallelExecutor`]: several workers for blocking, independent work
//!   such as description loads and unsubscribes on shutdown
//! - [`SequentialExecutor`]: a single worker giving strict FIFO, non-overlapping
//!   execution; every application callback runs here
//!
//! A panicking task is caught and logged; the worker keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

/// A unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How queued work is treated when an executor shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Queued and running tasks may finish within the timeout
    Graceful,
    /// Queued tasks are discarded; only the running task may finish
    Immediate,
}

struct Worker {
    id: ThreadId,
    handle: JoinHandle<()>,
}

/// Fixed set of threads draining a shared queue.
struct WorkerPool {
    name: &'static str,
    task_tx: Mutex<Option<Sender<Task>>>,
    discard: Arc<AtomicBool>,
    workers: Mutex<Vec<Worker>>,
    exited_rx: Receiver<ThreadId>,
}

impl WorkerPool {
    fn new(name: &'static str, size: usize) -> std::io::Result<Self> {
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (exited_tx, exited_rx) = channel::unbounded();
        let discard = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        let mut last_error = None;
        for index in 0..size.max(1) {
            let task_rx = task_rx.clone();
            let exited_tx = exited_tx.clone();
            let discard = Arc::clone(&discard);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    run_worker(name, task_rx, &discard);
                    let _ = exited_tx.send(thread::current().id());
                });

            match spawned {
                Ok(handle) => workers.push(Worker {
                    id: handle.thread().id(),
                    handle,
                }),
                Err(e) => {
                    tracing::error!("Failed to start {} worker {}: {}", name, index, e);
                    last_error = Some(e);
                }
            }
        }

        if workers.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no worker thread started")
            }));
        }

        tracing::debug!("Started {} with {} worker(s)", name, workers.len());

        Ok(Self {
            name,
            task_tx: Mutex::new(Some(task_tx)),
            discard,
            workers: Mutex::new(workers),
            exited_rx,
        })
    }

    fn submit(&self, task: Task) -> bool {
        match self.task_tx.lock().as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.task_tx.lock().is_none()
    }

    fn on_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.workers.lock().iter().any(|worker| worker.id == current)
    }

    fn shutdown(&self, mode: ShutdownMode, timeout: Duration) {
        if mode == ShutdownMode::Immediate {
            self.discard.store(true, Ordering::SeqCst);
        }
        // Closing the channel lets idle workers exit once the queue is empty
        if self.task_tx.lock().take().is_none() {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        let mut waiting: Vec<ThreadId> = workers
            .iter()
            .map(|worker| worker.id)
            .filter(|id| *id != current)
            .collect();

        let deadline = Instant::now() + timeout;
        while !waiting.is_empty() {
            match self.exited_rx.recv_deadline(deadline) {
                Ok(id) => waiting.retain(|waiting_id| *waiting_id != id),
                Err(_) => break,
            }
        }

        if !waiting.is_empty() {
            self.discard.store(true, Ordering::SeqCst);
            tracing::warn!(
                "{}: {} worker(s) still busy after {:?}, detaching",
                self.name,
                waiting.len(),
                timeout
            );
        }

        for worker in workers {
            if worker.id != current && !waiting.contains(&worker.id) {
                let _ = worker.handle.join();
            }
        }

        tracing::debug!("{} shut down", self.name);
    }
}

fn run_worker(name: &str, task_rx: Receiver<Task>, discard: &AtomicBool) {
    for task in task_rx.iter() {
        if discard.load(Ordering::SeqCst) {
            continue;
        }
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("Task panicked on {}; worker continues", name);
        }
    }
}

/// Pool of workers for blocking, independent work
pub struct ParallelExecutor {
    pool: WorkerPool,
}

impl ParallelExecutor {
    /// Start `workers` threads (at least one)
    pub fn new(workers: usize) -> std::io::Result<Self> {
        Ok(Self {
            pool: WorkerPool::new("upnp-parallel", workers)?,
        })
    }

    /// Queue a task; returns `false` once the executor is shut down
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(Box::new(task))
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Stop accepting work and wait up to `timeout` for the workers
    pub fn shutdown(&self, mode: ShutdownMode, timeout: Duration) {
        self.pool.shutdown(mode, timeout);
    }
}

/// Single worker running tasks one at a time in submission order
pub struct SequentialExecutor {
    pool: WorkerPool,
}

impl SequentialExecutor {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            pool: WorkerPool::new("upnp-sequential", 1)?,
        })
    }

    /// Wait up to `timeout` for every task queued so far to run.
    ///
    /// Returns `false` on timeout, after shutdown, or when called from the
    /// sequential worker itself.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.pool.on_worker_thread() {
            return false;
        }
        let (done_tx, done_rx) = channel::bounded(1);
        if !self.submit(move || {
            let _ = done_tx.send(());
        }) {
            return false;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Queue a task; returns `false` once the executor is shut down
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(Box::new(task))
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Stop accepting work and wait up to `timeout` for the queue to drain
    pub fn shutdown(&self, mode: ShutdownMode, timeout: Duration) {
        self.pool.shutdown(mode, timeout);
    }
}

/// The parallel pool and sequential queue shared by every component
pub struct TaskExecutors {
    pub parallel: ParallelExecutor,
    pub sequential: SequentialExecutor,
    shutdown_timeout: Duration,
}

impl TaskExecutors {
    pub fn new(parallel_workers: usize, shutdown_timeout: Duration) -> std::io::Result<Self> {
        Ok(Self {
            parallel: ParallelExecutor::new(parallel_workers)?,
            sequential: SequentialExecutor::new()?,
            shutdown_timeout,
        })
    }

    /// Drain the parallel pool, flush what the sequential queue holds at
    /// that point, then hard-stop it. Each step waits at most the configured
    /// shutdown timeout.
    pub fn terminate(&self) {
        self.parallel
            .shutdown(ShutdownMode::Graceful, self.shutdown_timeout);
        if !self.sequential.flush(self.shutdown_timeout) {
            tracing::debug!("Sequential queue not flushed before termination");
        }
        self.sequential
            .shutdown(ShutdownMode::Immediate, self.shutdown_timeout);
    }
}
