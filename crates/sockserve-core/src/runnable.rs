//! Units of deferred work
//!
//! A `WorkItem` wraps a `Runnable` together with an optional completion
//! observer and a diagnostic "run by worker" tag. Ownership is part of the
//! type:
//!
//! - `WorkItem::owned` / `WorkItem::from_fn`: the item owns the runnable.
//!   Whoever executes it destroys it right after notifying completion.
//! - `WorkItem::shared`: the submitter keeps an `Arc` to the runnable and
//!   can inspect it after it ran; executing only drops the item's handle.
//!
//! `execute` consumes the item, so `run()` can happen at most once and the
//! completion observer fires exactly once, on the executing thread, even
//! when `run()` panics.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Something that can be run once on some thread
pub trait Runnable: Send {
    fn run(&mut self);
}

/// Diagnostic identifier, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What happened when an item executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// `run()` panicked; carries the panic message
    Panicked(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Passed to the completion observer after `run()` returns
#[derive(Debug, Clone)]
pub struct RunReport {
    pub task_id: TaskId,
    /// Worker that executed the item, if it ran on a pool worker
    pub worker_id: Option<usize>,
    pub outcome: RunOutcome,
}

/// Observer notified exactly once after an item has run
pub trait RunCompletionObserver: Send + Sync {
    fn notify_run_complete(&self, report: &RunReport);
}

enum RunnableHandle {
    Owned(Box<dyn Runnable>),
    Shared(Arc<Mutex<dyn Runnable>>),
}

struct FnRunnable<F: FnOnce() + Send> {
    f: Option<F>,
}

impl<F: FnOnce() + Send> Runnable for FnRunnable<F> {
    fn run(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// A runnable plus its completion observer and dispatch metadata
pub struct WorkItem {
    id: TaskId,
    runnable: RunnableHandle,
    observer: Option<Arc<dyn RunCompletionObserver>>,
    run_by: Option<usize>,
}

impl WorkItem {
    /// Item that owns `runnable` and destroys it after execution
    pub fn owned<R: Runnable + 'static>(runnable: R) -> Self {
        Self::from_box(Box::new(runnable))
    }

    pub fn from_box(runnable: Box<dyn Runnable>) -> Self {
        Self {
            id: TaskId::next(),
            runnable: RunnableHandle::Owned(runnable),
            observer: None,
            run_by: None,
        }
    }

    /// Owned item built from a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::owned(FnRunnable { f: Some(f) })
    }

    /// Item over a runnable the caller keeps a handle to
    pub fn shared(runnable: Arc<Mutex<dyn Runnable>>) -> Self {
        Self {
            id: TaskId::next(),
            runnable: RunnableHandle::Shared(runnable),
            observer: None,
            run_by: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunCompletionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True if executing this item also destroys the runnable
    pub fn is_owned(&self) -> bool {
        matches!(self.runnable, RunnableHandle::Owned(_))
    }

    pub fn run_by(&self) -> Option<usize> {
        self.run_by
    }

    pub fn set_run_by(&mut self, worker_id: usize) {
        self.run_by = Some(worker_id);
    }

    /// Run, notify the observer, then drop the item.
    ///
    /// Panics from `run()` are caught and reported in the outcome; they
    /// never propagate to the calling thread.
    pub fn execute(self) -> RunOutcome {
        self.execute_then(|_| {})
    }

    /// Like `execute`, calling `after_run` between `run()` returning and
    /// the completion observer firing.
    pub fn execute_then<F>(mut self, after_run: F) -> RunOutcome
    where
        F: FnOnce(&RunOutcome),
    {
        let runnable = &mut self.runnable;
        let result = panic::catch_unwind(AssertUnwindSafe(|| match runnable {
            RunnableHandle::Owned(r) => r.run(),
            RunnableHandle::Shared(r) => {
                let mut guard = r.lock().unwrap_or_else(PoisonError::into_inner);
                guard.run();
            }
        }));

        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(payload) => RunOutcome::Panicked(panic_message(payload.as_ref())),
        };
        after_run(&outcome);

        if let Some(observer) = self.observer.take() {
            let report = RunReport {
                task_id: self.id,
                worker_id: self.run_by,
                outcome: outcome.clone(),
            };
            observer.notify_run_complete(&report);
        }

        outcome
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("owned", &self.is_owned())
            .field("run_by", &self.run_by)
            .finish()
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: usize,
    }

    impl Runnable for Counter {
        fn run(&mut self) {
            self.runs += 1;
        }
    }

    struct CountingObserver {
        calls: AtomicUsize,
        last_worker: Mutex<Option<usize>>,
    }

    impl RunCompletionObserver for CountingObserver {
        fn notify_run_complete(&self, report: &RunReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_worker.lock().unwrap() = report.worker_id;
        }
    }

    fn observer() -> Arc<CountingObserver> {
        Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            last_worker: Mutex::new(None),
        })
    }

    #[test]
    fn test_shared_item_runs_once_and_stays_inspectable() {
        let counter = Arc::new(Mutex::new(Counter { runs: 0 }));
        let obs = observer();

        let mut item = WorkItem::shared(counter.clone()).with_observer(obs.clone());
        assert!(!item.is_owned());
        item.set_run_by(3);

        assert_eq!(item.execute(), RunOutcome::Completed);
        assert_eq!(counter.lock().unwrap().runs, 1);
        assert_eq!(obs.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*obs.last_worker.lock().unwrap(), Some(3));
    }

    #[test]
    fn test_owned_item_is_dropped_after_notify() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(drops.clone());
        let item = WorkItem::from_fn(move || {
            let _keep = &flag;
        });
        assert!(item.is_owned());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        item.execute();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_caught_and_still_notifies() {
        let obs = observer();
        let item = WorkItem::from_fn(|| panic!("handler exploded")).with_observer(obs.clone());

        let outcome = item.execute();
        assert_eq!(outcome, RunOutcome::Panicked("handler exploded".to_string()));
        assert_eq!(obs.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = WorkItem::from_fn(|| {});
        let b = WorkItem::from_fn(|| {});
        assert_ne!(a.id(), b.id());
    }
}
