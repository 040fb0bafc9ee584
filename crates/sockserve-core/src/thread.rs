//! OS thread contract
//!
//! A `Thread` wraps one native thread that executes one `WorkItem`.
//! `ThreadRoutine` is the body every backend runs on the new thread: it
//! raises the alive flag, executes the item, lowers the flag, and only then
//! lets the item notify its completion observer. All of this happens even
//! if `run()` panics.

use crate::error::SyncResult;
use crate::runnable::{RunOutcome, WorkItem};
use log::{trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Native thread wrapper
pub trait Thread: Send {
    /// Spawn the OS thread. Fails if already started or the OS refuses.
    fn start(&mut self) -> SyncResult<()>;

    /// Block until the thread routine returns. Returns false if the thread
    /// was never started, was already joined, or panicked outside the
    /// routine's own unwinding guard.
    fn join(&mut self) -> bool;

    /// True between the routine starting and the item finishing
    fn is_alive(&self) -> bool;

    fn name(&self) -> &str;

    /// OS-level thread id once the thread is running (diagnostic)
    fn native_id(&self) -> Option<u64>;
}

/// Body executed on a freshly spawned thread
pub struct ThreadRoutine {
    name: String,
    alive: Arc<AtomicBool>,
    item: WorkItem,
}

impl ThreadRoutine {
    pub fn new(name: &str, alive: Arc<AtomicBool>, item: WorkItem) -> Self {
        Self {
            name: name.to_string(),
            alive,
            item,
        }
    }

    pub fn run(self) -> RunOutcome {
        self.alive.store(true, Ordering::Release);
        trace!("thread '{}' running {}", self.name, self.item.id());

        let name = self.name;
        let alive = self.alive;
        self.item.execute_then(|outcome| {
            if let RunOutcome::Panicked(msg) = outcome {
                warn!("thread '{}' runnable panicked: {}", name, msg);
            }
            alive.store(false, Ordering::Release);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::{RunCompletionObserver, RunReport};
    use std::sync::atomic::AtomicUsize;

    struct AliveProbe {
        alive: Arc<AtomicBool>,
        seen_alive_at_notify: AtomicBool,
        calls: AtomicUsize,
    }

    impl RunCompletionObserver for AliveProbe {
        fn notify_run_complete(&self, _report: &RunReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_alive_at_notify
                .store(self.alive.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_routine_toggles_alive_around_run() {
        let alive = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));
        let observed2 = observed.clone();
        let alive2 = alive.clone();

        let item = WorkItem::from_fn(move || {
            observed2.store(alive2.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        let outcome = ThreadRoutine::new("t", alive.clone(), item).run();

        assert!(outcome.is_completed());
        assert!(observed.load(Ordering::SeqCst));
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[test]
    fn test_routine_clears_alive_after_panic() {
        let alive = Arc::new(AtomicBool::new(false));
        let probe = Arc::new(AliveProbe {
            alive: alive.clone(),
            seen_alive_at_notify: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });

        let item = WorkItem::from_fn(|| panic!("boom")).with_observer(probe.clone());
        let outcome = ThreadRoutine::new("t", alive.clone(), item).run();

        assert!(matches!(outcome, RunOutcome::Panicked(_)));
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        // Alive is already false when completion fires
        assert!(!probe.seen_alive_at_notify.load(Ordering::SeqCst));
    }
}
