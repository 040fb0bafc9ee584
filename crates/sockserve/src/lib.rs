//! # sockserve
//!
//! Serve TCP connections with application-supplied handlers, either from a
//! blocking accept loop or from a kernel readiness loop (epoll / kqueue),
//! with handler work running on a fixed pthreads worker pool.
//!
//! ## Quick Start
//!
//! ```ignore
//! use sockserve::{RequestHandler, ServerConfig, Socket, SocketServer};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn handle_request(&self, socket: &mut Socket) -> bool {
//!         match socket.read_line() {
//!             Ok(Some(line)) => socket.write_all(format!("{}\n", line).as_bytes()).is_ok(),
//!             _ => false,
//!         }
//!     }
//! }
//!
//! fn main() {
//!     sockserve::logging::init();
//!     let config = ServerConfig::from_env().port(7000);
//!     let mut server = SocketServer::new(config, sockserve::default_factory())
//!         .with_handler(Arc::new(Echo));
//!     std::process::exit(server.run());
//! }
//! ```

pub mod config;
pub mod handler;
pub mod server;

use std::sync::{Arc, OnceLock};

// Re-export core types
pub use sockserve_core::{
    constants, logging, PoolError, RunCompletionObserver, RunOutcome, RunReport, Runnable,
    ServerError, ServerResult, SyncError, ThreadingFactory, WorkItem,
};

// Re-export runtime types
pub use sockserve_runtime::{
    kernel_events_supported, setup_listener, EventStats, KernelEventServer, PlatformKernelEvents,
    PlatformThreadingFactory, Socket, SocketOptions, SocketRequest, SocketServiceHandler,
    ThreadPool, ThreadPoolFactory, ThreadPoolHandle,
};

pub use config::{ServerConfig, ServerMode};
pub use handler::RequestHandler;
pub use server::SocketServer;

/// Process-wide threading factory for binaries
///
/// Libraries and tests should construct and pass their own factory.
pub fn default_factory() -> Arc<PlatformThreadingFactory> {
    static FACTORY: OnceLock<Arc<PlatformThreadingFactory>> = OnceLock::new();
    Arc::clone(FACTORY.get_or_init(|| Arc::new(PlatformThreadingFactory::new())))
}
