//! Fixed-size thread pool dispatcher
//!
//! A `ThreadPool` owns one `ThreadPoolQueue` and N `ThreadPoolWorker`s.
//! Lifecycle:
//!
//! 1. `new()` creates the queue (no threads yet)
//! 2. `start()` creates and starts exactly `num_workers` workers
//! 3. `add_request()` / `ThreadPoolHandle::add_request()` enqueue work
//! 4. `stop()` rejects new work, lets the queue drain, shuts the queue down
//!    and joins every worker. `Drop` calls it.
//!
//! Workers can be added while running. Removing workers is not supported.

use crate::queue::{RejectedWork, ThreadPoolQueue};
use crate::worker::ThreadPoolWorker;
use log::{debug, info, warn};
use sockserve_core::error::{PoolError, PoolResult};
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::runnable::WorkItem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread pool over a backend factory
pub struct ThreadPool<F: ThreadingFactory> {
    factory: Arc<F>,
    queue: Arc<ThreadPoolQueue<F>>,
    workers: Vec<ThreadPoolWorker<F>>,
    running: Arc<AtomicBool>,
    num_workers: usize,
    next_worker_id: usize,
    /// Executed counts of workers already joined
    retired_executed: u64,
    name: String,
}

impl<F: ThreadingFactory> ThreadPool<F> {
    pub fn new(factory: Arc<F>, num_workers: usize, name: &str) -> PoolResult<Self> {
        if num_workers == 0 {
            return Err(PoolError::InvalidArgument("thread pool needs at least one worker"));
        }
        let queue = Arc::new(ThreadPoolQueue::new(&*factory, &format!("{}-queue", name))?);

        Ok(Self {
            factory,
            queue,
            workers: Vec::with_capacity(num_workers),
            running: Arc::new(AtomicBool::new(false)),
            num_workers,
            next_worker_id: 0,
            retired_executed: 0,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create and start the workers. Calling it on a running pool is a
    /// no-op. If any worker fails to start, the ones already started are
    /// stopped and the error is returned.
    pub fn start(&mut self) -> PoolResult<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.queue.is_running() {
            return Err(PoolError::QueueShutDown);
        }

        for _ in 0..self.num_workers {
            if let Err(e) = self.spawn_worker() {
                warn!("pool '{}': worker start failed: {}", self.name, e);
                self.shutdown_workers();
                return Err(e);
            }
        }

        self.running.store(true, Ordering::Release);
        info!("pool '{}' started with {} workers ({})", self.name, self.num_workers, self.factory.backend_name());
        Ok(())
    }

    fn spawn_worker(&mut self) -> PoolResult<()> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let mut worker = ThreadPoolWorker::new(&*self.factory, Arc::clone(&self.queue), id, &self.name)?;
        worker.start()?;
        self.workers.push(worker);
        Ok(())
    }

    /// Stop accepting work, run what is already queued, then join every
    /// worker. Safe to call more than once.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if !was_running && self.workers.is_empty() {
            return;
        }

        debug!("pool '{}' draining {} queued items", self.name, self.queue.len());
        // Handles may still be adding; the queue closes itself only once
        // empty, under its own lock
        self.queue.shut_down_when_drained();
        self.shutdown_workers();
        info!("pool '{}' stopped", self.name);
    }

    fn shutdown_workers(&mut self) {
        self.queue.shut_down();
        for worker in &self.workers {
            worker.request_stop();
        }
        for mut worker in self.workers.drain(..) {
            if !worker.join() {
                warn!("pool '{}': worker {} did not join cleanly", self.name, worker.id());
            }
            self.retired_executed += worker.executed();
        }
    }

    /// Enqueue an item. Rejected when the pool is not running.
    pub fn add_request(&self, item: WorkItem) -> Result<(), RejectedWork> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RejectedWork(item));
        }
        self.queue.add_request(item)
    }

    /// Cloneable submit-only handle, usable from other threads
    pub fn handle(&self) -> ThreadPoolHandle<F> {
        ThreadPoolHandle {
            queue: Arc::clone(&self.queue),
            running: Arc::clone(&self.running),
        }
    }

    /// Grow the pool by `count` workers. Started immediately if the pool is
    /// running, otherwise on the next `start()`.
    pub fn add_workers(&mut self, count: usize) -> PoolResult<()> {
        if self.running.load(Ordering::Acquire) {
            for _ in 0..count {
                self.spawn_worker()?;
                self.num_workers += 1;
            }
        } else {
            self.num_workers += count;
        }
        debug!("pool '{}' now has {} workers", self.name, self.num_workers);
        Ok(())
    }

    pub fn remove_workers(&mut self, _count: usize) -> PoolResult<()> {
        Err(PoolError::Unsupported("remove_workers"))
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers whose thread is currently inside its loop
    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Items executed by this pool's workers, including stopped ones
    pub fn executed(&self) -> u64 {
        self.retired_executed + self.workers.iter().map(|w| w.executed()).sum::<u64>()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl<F: ThreadingFactory> Drop for ThreadPool<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Submit side of a running pool
pub struct ThreadPoolHandle<F: ThreadingFactory> {
    queue: Arc<ThreadPoolQueue<F>>,
    running: Arc<AtomicBool>,
}

impl<F: ThreadingFactory> Clone for ThreadPoolHandle<F> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            running: Arc::clone(&self.running),
        }
    }
}

impl<F: ThreadingFactory> ThreadPoolHandle<F> {
    pub fn add_request(&self, item: WorkItem) -> Result<(), RejectedWork> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RejectedWork(item));
        }
        self.queue.add_request(item)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Thread pool creation on top of any threading factory
pub trait ThreadPoolFactory: ThreadingFactory + Sized {
    /// Create an unstarted pool whose primitives come from this factory
    fn create_thread_pool_dispatcher(self: Arc<Self>, num_workers: usize, name: &str) -> PoolResult<ThreadPool<Self>> {
        ThreadPool::new(self, num_workers, name)
    }
}

impl<F: ThreadingFactory> ThreadPoolFactory for F {}
