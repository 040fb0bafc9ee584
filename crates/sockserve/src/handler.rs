//! Application handler and its adapters onto the two serving modes

use log::{debug, warn};
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::runnable::{panic_message, RunOutcome, WorkItem};
use sockserve_runtime::{Socket, SocketRequest, SocketServiceHandler, ThreadPoolHandle};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Application logic run against a connected socket
///
/// Called on a pool worker (or inline when the pool size is 0). Return
/// `true` to keep the connection, `false` to have it closed.
///
/// In kernel-event mode each call services one readiness event, so it
/// should consume what is available and return rather than loop until the
/// peer hangs up. In accept-loop mode it is called repeatedly on the same
/// connection until it returns `false` or the socket is closed.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request(&self, socket: &mut Socket) -> bool;
}

/// Run a work item on the current thread, logging a panic
pub(crate) fn run_inline(item: WorkItem) {
    let task = item.id();
    if let RunOutcome::Panicked(msg) = item.execute() {
        warn!("{} panicked: {}", task, msg);
    }
}

/// Service one readiness event, then hand the socket back. A panicking
/// handler gets its connection closed.
fn serve_event(handler: &dyn RequestHandler, mut request: SocketRequest) {
    if let Some(socket) = request.socket() {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_request(socket))) {
            Ok(true) => {}
            Ok(false) => {
                debug!("fd {} released by handler", socket.file_descriptor());
                socket.close();
            }
            Err(payload) => {
                warn!("fd {}: handler panicked: {}", socket.file_descriptor(), panic_message(payload.as_ref()));
                socket.close();
            }
        }
    }
    request.complete();
}

/// Service an accepted connection until the handler or the peer ends it
pub(crate) fn serve_connection(handler: &dyn RequestHandler, mut socket: Socket) {
    while socket.is_open() && handler.handle_request(&mut socket) {}
    socket.close();
}

/// `SocketServiceHandler` that runs a `RequestHandler` on the pool
pub(crate) struct PooledService<F: ThreadingFactory> {
    handler: Arc<dyn RequestHandler>,
    /// `None` runs requests inline on the event loop thread
    pool: Option<ThreadPoolHandle<F>>,
}

impl<F: ThreadingFactory> PooledService<F> {
    pub(crate) fn new(handler: Arc<dyn RequestHandler>, pool: Option<ThreadPoolHandle<F>>) -> Self {
        Self { handler, pool }
    }
}

impl<F: ThreadingFactory> SocketServiceHandler for PooledService<F> {
    fn service_socket(&self, request: SocketRequest) {
        let handler = Arc::clone(&self.handler);
        let item = WorkItem::from_fn(move || serve_event(&*handler, request));

        match &self.pool {
            Some(pool) => {
                // A rejected item drops its request, which re-arms the socket
                if let Err(rejected) = pool.add_request(item) {
                    warn!("pool not accepting work: {}", rejected);
                }
            }
            None => run_inline(item),
        }
    }
}
