//! # sockserve-runtime
//!
//! Platform-specific runtime for the sockserve framework.
//!
//! This crate provides:
//! - The pthreads threading backend (error-checking mutexes, condition
//!   variables, named OS threads)
//! - `ThreadPoolQueue`, `ThreadPoolWorker` and `ThreadPool`
//! - `Socket` and listener setup over raw libc calls
//! - `KernelEventServer` over epoll (Linux) or kqueue (BSD/macOS)

pub mod backend;
pub mod queue;
pub mod worker;
pub mod pool;
pub mod net;
pub mod kernel_event;

// Re-exports
pub use backend::{
    PlatformThreadingFactory, PthreadsConditionVariable, PthreadsMutex, PthreadsThread, PthreadsThreadingFactory,
};
pub use queue::{Block, RejectedWork, Take, ThreadPoolQueue};
pub use worker::ThreadPoolWorker;
pub use pool::{ThreadPool, ThreadPoolFactory, ThreadPoolHandle};
pub use net::{is_valid_fd, setup_listener, Socket, SocketOptions};
pub use kernel_event::{
    kernel_events_supported, EventStats, KernelEventServer, PlatformKernelEvents, SocketCompletion,
    SocketRequest, SocketServiceHandler,
};

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("sockserve-runtime supports unix targets only");
    }
}
