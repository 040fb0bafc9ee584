//! # sockserve-core
//!
//! Core types and traits for the sockserve socket-serving framework.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations (pthreads, epoll, kqueue) are in
//! `sockserve-runtime`.
//!
//! ## Modules
//!
//! - `sync` - Mutex / ConditionVariable contract and the `Guarded` lock
//! - `thread` - OS thread contract and the shared thread routine
//! - `runnable` - Work items, completion observers, ownership variants
//! - `factory` - `ThreadingFactory`, the source of every primitive
//! - `kernel_events` - Readiness multiplexer backend contract
//! - `error` - Error types
//! - `logging` - stderr backend for the `log` facade
//! - `env` - Environment variable utilities

pub mod sync;
pub mod thread;
pub mod runnable;
pub mod factory;
pub mod kernel_events;
pub mod error;
pub mod logging;
pub mod env;

// Re-exports for convenience
pub use sync::{ConditionVariable, Guarded, GuardedLock, Mutex, MutexLock};
pub use thread::{Thread, ThreadRoutine};
pub use runnable::{RunCompletionObserver, RunOutcome, RunReport, Runnable, TaskId, WorkItem};
pub use factory::ThreadingFactory;
pub use kernel_events::{EventBuffer, Fd, KernelEventBackend, Readiness};
pub use error::{PoolError, PoolResult, ServerError, ServerResult, SyncError, SyncResult};
pub use env::{env_flag, env_var};

/// Defaults shared by the runtime and the facade
pub mod constants {
    /// Default listening port
    pub const DEFAULT_PORT: u16 = 9000;

    /// Default number of pool workers
    pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

    /// Default SO_SNDBUF / SO_RCVBUF size
    pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 8192;

    /// Default listen backlog
    pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

    /// Readiness events fetched per kernel wait
    pub const DEFAULT_EVENT_CAPACITY: usize = 256;
}
