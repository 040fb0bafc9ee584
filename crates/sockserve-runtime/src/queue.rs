//! Blocking FIFO of work items shared by pool workers
//!
//! State (the deque and the running flag) is protected by one backend mutex.
//! Two condition variables hang off it:
//!
//! - `not_empty`: signalled when an add makes the queue non-empty, and
//!   broadcast on shutdown so every blocked taker returns.
//! - `drained`: broadcast whenever a take leaves the queue empty, for
//!   `wait_until_empty`.
//!
//! After shutdown no item is accepted or handed out; items still queued are
//! dropped with the queue.

use log::{debug, error, warn};
use sockserve_core::error::PoolResult;
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::runnable::WorkItem;
use sockserve_core::sync::{ConditionVariable, Guarded};
use std::collections::VecDeque;
use std::fmt;

/// Whether `take_request` may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Yes,
    No,
}

/// Result of `take_request`
#[derive(Debug)]
pub enum Take {
    Item(WorkItem),
    /// Non-blocking take found nothing
    Empty,
    /// The queue has been shut down
    NotRunning,
}

/// Work item handed back by a queue that refused it
pub struct RejectedWork(pub WorkItem);

impl RejectedWork {
    pub fn into_inner(self) -> WorkItem {
        self.0
    }
}

impl fmt::Debug for RejectedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RejectedWork").field(&self.0.id()).finish()
    }
}

impl fmt::Display for RejectedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work item {} rejected", self.0.id())
    }
}

impl std::error::Error for RejectedWork {}

struct QueueState {
    items: VecDeque<WorkItem>,
    running: bool,
}

/// FIFO of pending work with blocking take
pub struct ThreadPoolQueue<F: ThreadingFactory> {
    state: Guarded<F::Mutex, QueueState>,
    not_empty: F::ConditionVariable,
    drained: F::ConditionVariable,
    name: String,
}

impl<F: ThreadingFactory> ThreadPoolQueue<F> {
    /// Create a running, empty queue. Fails if the backend cannot create
    /// the mutex or either condition variable.
    pub fn new(factory: &F, name: &str) -> PoolResult<Self> {
        let mutex = factory.create_mutex(&format!("{}-lock", name))?;
        let not_empty = factory.create_condition_variable(&format!("{}-not-empty", name))?;
        let drained = factory.create_condition_variable(&format!("{}-drained", name))?;

        Ok(Self {
            state: Guarded::new(
                mutex,
                QueueState {
                    items: VecDeque::new(),
                    running: true,
                },
            ),
            not_empty,
            drained,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item. Rejected (and handed back) once the queue is shut
    /// down.
    pub fn add_request(&self, item: WorkItem) -> Result<(), RejectedWork> {
        let Some(mut state) = self.state.lock() else {
            error!("queue '{}': lock failed, rejecting {}", self.name, item.id());
            return Err(RejectedWork(item));
        };
        if !state.running {
            debug!("queue '{}': shut down, rejecting {}", self.name, item.id());
            return Err(RejectedWork(item));
        }

        let was_empty = state.items.is_empty();
        state.items.push_back(item);
        if was_empty {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Remove the head item.
    ///
    /// With `Block::Yes` this waits while the queue is empty and running.
    /// Returns `Take::NotRunning` as soon as the queue is shut down, even if
    /// items remain.
    pub fn take_request(&self, block: Block) -> Take {
        let Some(mut state) = self.state.lock() else {
            error!("queue '{}': lock failed in take", self.name);
            return Take::NotRunning;
        };

        if block == Block::Yes {
            while state.items.is_empty() && state.running {
                if !state.wait(&self.not_empty) {
                    error!("queue '{}': wait failed", self.name);
                    return Take::NotRunning;
                }
            }
        }

        if !state.running {
            return Take::NotRunning;
        }

        match state.items.pop_front() {
            None => Take::Empty,
            Some(item) => {
                if state.items.is_empty() {
                    self.drained.notify_all();
                } else {
                    // Adds only signal on the empty transition; pass the
                    // wakeup along so a burst reaches more than one taker.
                    self.not_empty.notify_one();
                }
                Take::Item(item)
            }
        }
    }

    /// Stop accepting and handing out work and wake every blocked taker.
    /// Returns false if the queue was already shut down.
    pub fn shut_down(&self) -> bool {
        let Some(mut state) = self.state.lock() else {
            error!("queue '{}': lock failed in shut_down", self.name);
            return false;
        };
        if !state.running {
            return false;
        }
        state.running = false;
        self.not_empty.notify_all();
        self.drained.notify_all();
        debug!("queue '{}' shut down with {} pending", self.name, state.items.len());
        true
    }

    /// Wait until every queued item has been taken, then shut down without
    /// releasing the lock in between, so nothing accepted can be left
    /// behind. Returns false if the queue was already shut down.
    pub fn shut_down_when_drained(&self) -> bool {
        let Some(mut state) = self.state.lock() else {
            error!("queue '{}': lock failed in shut_down_when_drained", self.name);
            return false;
        };
        while !state.items.is_empty() && state.running {
            if !state.wait(&self.drained) {
                error!("queue '{}': drain wait failed", self.name);
                break;
            }
        }
        if !state.running {
            return false;
        }
        state.running = false;
        self.not_empty.notify_all();
        self.drained.notify_all();
        debug!("queue '{}' drained and shut down ({} pending)", self.name, state.items.len());
        true
    }

    /// Block until every queued item has been taken. Returns early (false)
    /// if the queue is shut down first.
    pub fn wait_until_empty(&self) -> bool {
        let Some(mut state) = self.state.lock() else {
            return false;
        };
        while !state.items.is_empty() && state.running {
            if !state.wait(&self.drained) {
                return false;
            }
        }
        state.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }
}

impl<F: ThreadingFactory> Drop for ThreadPoolQueue<F> {
    fn drop(&mut self) {
        let pending = self.state.get_mut().items.len();
        if pending > 0 {
            warn!("queue '{}' dropped with {} unexecuted items", self.name, pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlatformThreadingFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn queue() -> Arc<ThreadPoolQueue<PlatformThreadingFactory>> {
        Arc::new(ThreadPoolQueue::new(&PlatformThreadingFactory::new(), "test-queue").unwrap())
    }

    fn tagged(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> WorkItem {
        let log = Arc::clone(log);
        WorkItem::from_fn(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=3 {
            q.add_request(tagged(&log, tag)).unwrap();
        }
        assert_eq!(q.len(), 3);

        while let Take::Item(item) = q.take_request(Block::No) {
            item.execute();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_non_blocking_take_on_empty() {
        let q = queue();
        assert!(matches!(q.take_request(Block::No), Take::Empty));
    }

    #[test]
    fn test_shutdown_wakes_all_blocked_takers() {
        let q = queue();
        let woke = Arc::new(AtomicUsize::new(0));

        let takers: Vec<_> = (0..3)
            .map(|_| {
                let (q, woke) = (Arc::clone(&q), Arc::clone(&woke));
                std::thread::spawn(move || {
                    if let Take::NotRunning = q.take_request(Block::Yes) {
                        woke.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        assert!(q.shut_down());
        for t in takers {
            t.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_add_after_shutdown_rejected() {
        let q = queue();
        assert!(q.shut_down());
        assert!(!q.is_running());

        let rejected = q.add_request(WorkItem::from_fn(|| {})).unwrap_err();
        let item = rejected.into_inner();
        assert!(item.is_owned());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_shutdown_idempotent() {
        let q = queue();
        assert!(q.shut_down());
        assert!(!q.shut_down());
        assert!(matches!(q.take_request(Block::Yes), Take::NotRunning));
    }

    #[test]
    fn test_take_after_shutdown_ignores_remaining_items() {
        let q = queue();
        q.add_request(WorkItem::from_fn(|| {})).unwrap();
        q.shut_down();
        assert!(matches!(q.take_request(Block::No), Take::NotRunning));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_blocked_taker_receives_item() {
        let q = queue();
        let q2 = Arc::clone(&q);
        let taker = std::thread::spawn(move || match q2.take_request(Block::Yes) {
            Take::Item(item) => item.execute().is_completed(),
            _ => false,
        });

        std::thread::sleep(Duration::from_millis(20));
        q.add_request(WorkItem::from_fn(|| {})).unwrap();
        assert!(taker.join().unwrap());
    }

    #[test]
    fn test_shut_down_when_drained_waits_for_takers() {
        let q = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            q.add_request(WorkItem::from_fn(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        let q2 = Arc::clone(&q);
        let taker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            while let Take::Item(item) = q2.take_request(Block::Yes) {
                item.execute();
            }
        });

        assert!(q.shut_down_when_drained());
        taker.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(q.is_empty());
        assert!(q.add_request(WorkItem::from_fn(|| {})).is_err());
        assert!(!q.shut_down_when_drained());
    }

    #[test]
    fn test_wait_until_empty() {
        let q = queue();
        for _ in 0..4 {
            q.add_request(WorkItem::from_fn(|| {})).unwrap();
        }

        let q2 = Arc::clone(&q);
        let drainer = std::thread::spawn(move || {
            while let Take::Item(item) = q2.take_request(Block::Yes) {
                item.execute();
                if q2.is_empty() {
                    break;
                }
            }
        });

        assert!(q.wait_until_empty());
        drainer.join().unwrap();
        assert!(q.is_empty());
    }
}
