//! Threading factory
//!
//! The single source of mutexes, condition variables and threads. Exactly
//! one backend implements it per target (pthreads on unix), chosen at
//! compile time, so the associated types are concrete and a condition
//! variable can only ever be waited on with its own backend's mutex.
//!
//! Factories are passed explicitly (usually as `Arc<F>`) to every
//! component that needs primitives. Tests can hand in a different one
//! without touching process-wide state.

use crate::error::SyncResult;
use crate::runnable::WorkItem;
use crate::sync::{ConditionVariable, Mutex};
use crate::thread::Thread;

pub trait ThreadingFactory: Send + Sync + 'static {
    type Mutex: Mutex + 'static;
    type ConditionVariable: ConditionVariable<Mutex = Self::Mutex> + 'static;
    type Thread: Thread + 'static;

    /// Create an unlocked, error-checking mutex
    fn create_mutex(&self, name: &str) -> SyncResult<Self::Mutex>;

    fn create_condition_variable(&self, name: &str) -> SyncResult<Self::ConditionVariable>;

    /// Create a thread that will execute `item` once started
    fn create_thread(&self, item: WorkItem, name: &str) -> SyncResult<Self::Thread>;

    /// Backend name for diagnostics (e.g. "pthreads")
    fn backend_name(&self) -> &'static str;
}
