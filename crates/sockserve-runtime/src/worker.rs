//! Pool worker
//!
//! Each worker owns one OS thread whose body is `WorkerLoop`: take from the
//! shared queue (blocking), tag the item with the worker id, execute it,
//! repeat. The loop ends when the queue reports it is no longer running.

use crate::queue::{Block, Take, ThreadPoolQueue};
use log::{debug, trace, warn};
use sockserve_core::error::PoolResult;
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::runnable::{RunOutcome, Runnable, WorkItem};
use sockserve_core::thread::Thread;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One pool thread and its stop flag
pub struct ThreadPoolWorker<F: ThreadingFactory> {
    id: usize,
    thread: F::Thread,
    stop_requested: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
}

impl<F: ThreadingFactory> ThreadPoolWorker<F> {
    /// Create the worker's thread without starting it
    pub fn new(
        factory: &F,
        queue: Arc<ThreadPoolQueue<F>>,
        id: usize,
        pool_name: &str,
    ) -> PoolResult<Self> {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicU64::new(0));
        let body = WorkerLoop {
            id,
            queue,
            stop_requested: Arc::clone(&stop_requested),
            executed: Arc::clone(&executed),
        };
        let thread = factory.create_thread(WorkItem::owned(body), &format!("{}-worker-{}", pool_name, id))?;

        Ok(Self {
            id,
            thread,
            stop_requested,
            executed,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn start(&mut self) -> PoolResult<()> {
        self.thread.start()?;
        debug!("worker {} started", self.id);
        Ok(())
    }

    /// Ask the loop to exit before taking another item. An item already
    /// taken still runs.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn join(&mut self) -> bool {
        self.thread.join()
    }

    pub fn is_alive(&self) -> bool {
        self.thread.is_alive()
    }

    /// Items this worker has executed so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

struct WorkerLoop<F: ThreadingFactory> {
    id: usize,
    queue: Arc<ThreadPoolQueue<F>>,
    stop_requested: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
}

impl<F: ThreadingFactory> Runnable for WorkerLoop<F> {
    fn run(&mut self) {
        while !self.stop_requested.load(Ordering::Acquire) {
            let mut item = match self.queue.take_request(Block::Yes) {
                Take::Item(item) => item,
                Take::Empty => continue,
                Take::NotRunning => break,
            };

            item.set_run_by(self.id);
            let task = item.id();
            trace!("worker {} running {}", self.id, task);
            if let RunOutcome::Panicked(msg) = item.execute() {
                warn!("worker {}: {} panicked: {}", self.id, task, msg);
            }
            self.executed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("worker {} exiting", self.id);
    }
}
