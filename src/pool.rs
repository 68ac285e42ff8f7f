//! Activation worker pool.
//!
//! A fixed set of threads that run channel activations. Work is queued on a
//! lock-free queue and workers park on a condvar when it runs dry. `stop`
//! drains everything already queued, then joins the workers; a stopped pool
//! can be started again for the orchestrator's next run.
//!
//! A panicking job is caught and logged — one poisoned activation must not
//! cost the pool a worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: SegQueue<Job>,
    shutdown: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// A fixed-size pool of activation workers.
pub struct ActivationPool {
    inner: Arc<PoolInner>,
    threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivationPool {
    /// Creates a stopped pool that will run `threads` workers once started.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: SegQueue::new(),
                shutdown: AtomicBool::new(true),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
            threads: threads.max(1),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the workers. No-op if the pool is already running.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);
        for n in 0..self.threads {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("switchyard-worker-{n}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }
    }

    /// Queues a job for execution on some worker.
    ///
    /// Jobs posted to a stopped pool are dropped (and logged); during
    /// shutdown the queue is drained before the workers exit.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            debug!("dropping job posted to a stopped pool");
            return;
        }
        self.inner.queue.push(Box::new(job));
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_one();
    }

    /// Drains queued jobs and joins all workers. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.mutex.lock();
            self.inner.condvar.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Number of jobs waiting for a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether the pool is currently accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for ActivationPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ActivationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationPool")
            .field("threads", &self.threads)
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("activation job panicked; worker continues");
            }
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut guard = inner.mutex.lock();
        // Re-check under the lock so a push+notify between our failed pop
        // and this park cannot be missed.
        if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            inner.condvar.wait(&mut guard);
        }
    }
}
