//! Readiness-driven socket server
//!
//! One thread runs `KernelEventServer::run()`: it blocks in the kernel
//! multiplexer, accepts new connections on the listening socket, and hands
//! readable connections to a `SocketServiceHandler` (normally backed by a
//! thread pool). Every tracked connection is in exactly one of two states:
//!
//! - **watched**: registered for read readiness, socket parked in the table
//! - **in flight**: unregistered, socket owned by a `SocketRequest`
//!
//! A readable event first unregisters the descriptor, then flips its busy
//! flag under the table mutex. A second event for a busy descriptor is
//! dropped. When the request completes (explicitly or by being dropped) the
//! socket comes back: re-armed if still open and valid, forgotten otherwise.
//!
//! The table mutex is held only for lookups, inserts and removals, never
//! while calling the handler or the kernel.

use crate::net::{is_valid_fd, setup_listener, Socket, SocketOptions};
use log::{debug, error, info, trace, warn};
use sockserve_core::error::{ServerError, ServerResult};
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::kernel_events::{EventBuffer, Fd, KernelEventBackend, Readiness};
use sockserve_core::runnable::panic_message;
use sockserve_core::sync::Guarded;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::{Epoll, EpollEvents};
        /// Readiness backend for this platform
        pub type PlatformKernelEvents = Epoll;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))] {
        mod kqueue;
        pub use kqueue::{Kqueue, KqueueEvents};
        /// Readiness backend for this platform
        pub type PlatformKernelEvents = Kqueue;
    } else {
        mod unavailable;
        pub use unavailable::{NoEvents, Unavailable};
        /// Readiness backend for this platform
        pub type PlatformKernelEvents = Unavailable;
    }
}

/// Whether this build has a working readiness backend
pub const fn kernel_events_supported() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))
}

// ============================================================================
// Requests and handlers
// ============================================================================

/// Receives sockets handed back by finished requests
pub trait SocketCompletion: Send + Sync {
    fn notify_socket_complete(&self, socket: Socket);
}

/// Application-side consumer of ready sockets
///
/// Called on the event loop thread; implementations that do real work
/// should move the request to another thread and return quickly.
pub trait SocketServiceHandler: Send + Sync {
    fn service_socket(&self, request: SocketRequest);
}

/// A ready socket on loan to a handler
///
/// The socket goes back to the event server when the request is completed
/// or dropped, whichever happens first, so a panicking handler cannot leave
/// its descriptor marked busy. A request without a completion target (the
/// accept-loop path) closes its socket on drop.
pub struct SocketRequest {
    socket: Option<Socket>,
    event_index: usize,
    completion: Option<Arc<dyn SocketCompletion>>,
}

impl SocketRequest {
    pub fn new(socket: Socket, event_index: usize, completion: Arc<dyn SocketCompletion>) -> Self {
        Self {
            socket: Some(socket),
            event_index,
            completion: Some(completion),
        }
    }

    /// Request not tied to an event server
    pub fn detached(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            event_index: 0,
            completion: None,
        }
    }

    /// The socket, until the request completes
    pub fn socket(&mut self) -> Option<&mut Socket> {
        self.socket.as_mut()
    }

    pub fn fd(&self) -> Option<Fd> {
        self.socket.as_ref().map(Socket::file_descriptor)
    }

    /// Index of the readiness event that produced this request
    pub fn event_index(&self) -> usize {
        self.event_index
    }

    /// Hand the socket back
    pub fn complete(self) {}

    fn finish(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        match self.completion.take() {
            Some(completion) => completion.notify_socket_complete(socket),
            None => drop(socket),
        }
    }
}

impl Drop for SocketRequest {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for SocketRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRequest")
            .field("fd", &self.fd())
            .field("event_index", &self.event_index)
            .finish()
    }
}

// ============================================================================
// Tracking table
// ============================================================================

struct Tracked {
    busy: bool,
    /// Parked here while watched, `None` while in flight
    socket: Option<Socket>,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    dispatched: AtomicU64,
    dropped_busy: AtomicU64,
    rearmed: AtomicU64,
    closed: AtomicU64,
}

/// Snapshot of event server activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub accepted: u64,
    pub accept_errors: u64,
    pub dispatched: u64,
    /// Readable events dropped because the socket was already in flight
    pub dropped_busy: u64,
    pub rearmed: u64,
    pub closed: u64,
}

/// Shared between the event loop and request completions
struct EventCore<F: ThreadingFactory, B: KernelEventBackend> {
    backend: B,
    tracked: Guarded<F::Mutex, HashMap<Fd, Tracked>>,
    counters: Counters,
}

impl<F: ThreadingFactory, B: KernelEventBackend> EventCore<F, B> {
    /// Start watching a new connection
    fn track(&self, socket: Socket) {
        let fd = socket.file_descriptor();
        {
            let Some(mut tracked) = self.tracked.lock() else {
                error!("fd {}: tracking table lock failed, closing", fd);
                return;
            };
            tracked.insert(
                fd,
                Tracked {
                    busy: false,
                    socket: Some(socket),
                },
            );
        }
        if let Err(e) = self.backend.add_read_watch(fd) {
            warn!("fd {}: add watch failed: {}", fd, e);
            self.close_connection(fd);
        }
    }

    /// Peer closed or errored: unwatch and close, unless in flight
    fn close_connection(&self, fd: Fd) {
        let socket = {
            let Some(mut tracked) = self.tracked.lock() else {
                error!("fd {}: tracking table lock failed", fd);
                return;
            };
            let busy = match tracked.get(&fd) {
                Some(entry) => entry.busy,
                None => return,
            };
            if busy {
                debug!("fd {}: close event while in flight, left to completion", fd);
                return;
            }
            tracked.remove(&fd).and_then(|entry| entry.socket)
        };
        let _ = self.backend.remove_read_watch(fd);
        drop(socket);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!("fd {} closed by peer", fd);
    }

    /// Descriptor closed out-of-band: drop bookkeeping without closing, the
    /// number may already belong to someone else
    fn forget(&self, fd: Fd) {
        let socket = match self.tracked.lock() {
            Some(mut tracked) => tracked.remove(&fd).and_then(|entry| entry.socket),
            None => None,
        };
        let _ = self.backend.remove_read_watch(fd);
        if let Some(socket) = socket {
            let _ = socket.into_raw_fd();
        }
        debug!("fd {} no longer valid, forgotten", fd);
    }

    /// Move a watched socket to in flight. `None` if untracked or busy.
    fn begin_dispatch(&self, fd: Fd) -> Option<Socket> {
        if let Err(e) = self.backend.remove_read_watch(fd) {
            trace!("fd {}: remove watch: {}", fd, e);
        }

        let Some(mut tracked) = self.tracked.lock() else {
            error!("fd {}: tracking table lock failed", fd);
            return None;
        };
        let entry = tracked.get_mut(&fd)?;
        if entry.busy {
            debug!("fd {} already in flight, dropping event", fd);
            self.counters.dropped_busy.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        entry.busy = true;
        entry.socket.take()
    }

    fn stats(&self) -> EventStats {
        let c = &self.counters;
        EventStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            accept_errors: c.accept_errors.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped_busy: c.dropped_busy.load(Ordering::Relaxed),
            rearmed: c.rearmed.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
        }
    }
}

impl<F: ThreadingFactory, B: KernelEventBackend> SocketCompletion for EventCore<F, B> {
    fn notify_socket_complete(&self, socket: Socket) {
        let fd = socket.file_descriptor();
        // A closed socket still holds its descriptor, so `fd` cannot have
        // been reissued to a newer connection yet
        let valid = is_valid_fd(fd);
        let reusable = socket.is_open() && valid;

        let leftover = {
            let Some(mut tracked) = self.tracked.lock() else {
                error!("fd {}: tracking table lock failed on completion", fd);
                return;
            };
            match tracked.get_mut(&fd) {
                Some(entry) if entry.busy && entry.socket.is_none() => {
                    if reusable {
                        entry.busy = false;
                        entry.socket = Some(socket);
                        None
                    } else {
                        tracked.remove(&fd);
                        Some(socket)
                    }
                }
                // Never tracked, or the entry is not the one this request
                // took out; leave the table alone
                _ => Some(socket),
            }
        };

        if let Some(socket) = leftover {
            if valid {
                drop(socket);
            } else {
                // Closed behind our back; the number may belong to someone else
                let _ = socket.into_raw_fd();
            }
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            trace!("fd {} released", fd);
            return;
        }

        // Socket is parked before the watch exists, so the next event
        // always finds it
        match self.backend.add_read_watch(fd) {
            Ok(()) => {
                self.counters.rearmed.fetch_add(1, Ordering::Relaxed);
                trace!("fd {} re-armed", fd);
            }
            Err(e) => {
                warn!("fd {}: re-arm failed: {}", fd, e);
                self.close_connection(fd);
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Event loop over one listening socket
pub struct KernelEventServer<F: ThreadingFactory, B: KernelEventBackend = PlatformKernelEvents> {
    core: Arc<EventCore<F, B>>,
    listener: TcpListener,
    listener_fd: Fd,
    handler: Arc<dyn SocketServiceHandler>,
    options: SocketOptions,
    event_capacity: usize,
}

impl<F: ThreadingFactory, B: KernelEventBackend> KernelEventServer<F, B> {
    /// Wrap an already listening socket and register it with `backend`
    pub fn new(
        factory: &F,
        backend: B,
        listener: TcpListener,
        handler: Arc<dyn SocketServiceHandler>,
        options: SocketOptions,
        event_capacity: usize,
    ) -> ServerResult<Self> {
        let tracked = Guarded::new(factory.create_mutex("kernel-event-tracked")?, HashMap::new());
        let listener_fd = listener.as_raw_fd();

        // Readiness says a connection is pending; never block if it vanished
        listener.set_nonblocking(true)?;
        backend.add_read_watch(listener_fd)?;

        Ok(Self {
            core: Arc::new(EventCore {
                backend,
                tracked,
                counters: Counters::default(),
            }),
            listener,
            listener_fd,
            handler,
            options,
            event_capacity: event_capacity.max(1),
        })
    }

    /// Create the listener (SO_REUSEADDR, bind, listen) and register it
    pub fn bind(
        factory: &F,
        backend: B,
        addr: SocketAddr,
        backlog: usize,
        handler: Arc<dyn SocketServiceHandler>,
        options: SocketOptions,
        event_capacity: usize,
    ) -> ServerResult<Self> {
        let listener = setup_listener(addr, backlog)?;
        Self::new(factory, backend, listener, handler, options, event_capacity)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.backend.name()
    }

    /// Connections currently tracked (watched or in flight)
    pub fn tracked_count(&self) -> usize {
        self.core.tracked.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// `Some(true)` while `fd` is in flight, `None` if untracked
    pub fn is_busy(&self, fd: Fd) -> Option<bool> {
        self.core.tracked.lock().and_then(|t| t.get(&fd).map(|e| e.busy))
    }

    pub fn stats(&self) -> EventStats {
        self.core.stats()
    }

    /// Serve forever. Returns only if the kernel wait fails.
    pub fn run(&self) -> ServerResult<()> {
        let mut events = self.core.backend.new_event_buffer(self.event_capacity);
        info!(
            "kernel event loop ({}) on {}",
            self.core.backend.name(),
            self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into())
        );

        loop {
            let ready = match self.core.backend.wait_for_events(&mut events) {
                Ok(n) => n,
                Err(e) => {
                    error!("kernel event wait failed: {}", e);
                    return Err(ServerError::Io(e));
                }
            };
            for index in 0..ready {
                let fd = events.fd(index);
                self.handle_event(index, fd, Readiness::classify(&events, index));
            }
        }
    }

    /// Act on one ready descriptor
    pub(crate) fn handle_event(&self, index: usize, fd: Fd, readiness: Readiness) {
        if fd == self.listener_fd {
            self.accept_pending();
            return;
        }
        if fd <= 0 {
            return;
        }
        if !is_valid_fd(fd) {
            self.core.forget(fd);
            return;
        }

        match readiness {
            Readiness::Closed => self.core.close_connection(fd),
            Readiness::Readable => self.dispatch(index, fd),
            Readiness::Ignore => {}
        }
    }

    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // Accepted sockets inherit O_NONBLOCK on BSD; handlers
                    // expect blocking I/O
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("{}: set blocking failed: {}", peer, e);
                    }
                    let socket = Socket::from_stream(stream);
                    if let Err(e) = self.options.apply(&socket) {
                        debug!("{}: socket options not applied: {}", peer, e);
                    }
                    debug!("accepted {} as fd {}", peer, socket.file_descriptor());
                    self.core.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    self.core.track(socket);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    self.core.counters.accept_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, index: usize, fd: Fd) {
        let Some(socket) = self.core.begin_dispatch(fd) else {
            return;
        };
        self.core.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let completion: Arc<dyn SocketCompletion> = self.core.clone();
        let request = SocketRequest::new(socket, index, completion);
        let handler = &self.handler;
        // A panicking handler drops the request while unwinding, which
        // returns the socket
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.service_socket(request))) {
            warn!("fd {}: socket handler panicked: {}", fd, panic_message(payload.as_ref()));
        }
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;
    use crate::backend::PlatformThreadingFactory;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
    use std::sync::Mutex;

    /// Keeps every request it receives until told to release them
    #[derive(Default)]
    struct Hoarder {
        requests: Mutex<Vec<SocketRequest>>,
    }

    impl SocketServiceHandler for Hoarder {
        fn service_socket(&self, request: SocketRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    struct Exploding;

    impl SocketServiceHandler for Exploding {
        fn service_socket(&self, _request: SocketRequest) {
            panic!("handler bug");
        }
    }

    fn server(handler: Arc<dyn SocketServiceHandler>) -> KernelEventServer<PlatformThreadingFactory, PlatformKernelEvents> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        KernelEventServer::bind(
            &PlatformThreadingFactory::new(),
            PlatformKernelEvents::new().unwrap(),
            addr,
            16,
            handler,
            SocketOptions::default(),
            32,
        )
        .unwrap()
    }

    /// Connect a client and let the server accept and track it
    fn connect(server: &KernelEventServer<PlatformThreadingFactory, PlatformKernelEvents>) -> (TcpStream, Fd) {
        let known: Vec<Fd> = server.core.tracked.lock().unwrap().keys().copied().collect();
        let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let before = server.stats().accepted;
        for _ in 0..100 {
            server.accept_pending();
            if server.stats().accepted > before {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let fd = {
            let tracked = server.core.tracked.lock().unwrap();
            *tracked.keys().find(|fd| !known.contains(fd)).unwrap()
        };
        (client, fd)
    }

    #[test]
    fn test_busy_socket_dispatched_once() {
        let hoarder = Arc::new(Hoarder::default());
        let server = server(hoarder.clone());
        let (mut client, fd) = connect(&server);
        client.write_all(b"ping").unwrap();

        // Two readiness events for the same descriptor before completion
        server.handle_event(0, fd, Readiness::Readable);
        server.handle_event(1, fd, Readiness::Readable);
        assert_eq!(hoarder.requests.lock().unwrap().len(), 1);
        assert_eq!(server.is_busy(fd), Some(true));
        assert_eq!(server.stats().dropped_busy, 1);

        // Completion re-arms; the next event dispatches again
        let request = hoarder.requests.lock().unwrap().pop().unwrap();
        assert_eq!(request.event_index(), 0);
        request.complete();
        assert_eq!(server.is_busy(fd), Some(false));
        assert_eq!(server.stats().rearmed, 1);

        server.handle_event(2, fd, Readiness::Readable);
        assert_eq!(hoarder.requests.lock().unwrap().len(), 1);
        assert_eq!(server.stats().dispatched, 2);
    }

    #[test]
    fn test_closed_socket_is_forgotten_on_completion() {
        let hoarder = Arc::new(Hoarder::default());
        let server = server(hoarder.clone());
        let (_client, fd) = connect(&server);

        server.handle_event(0, fd, Readiness::Readable);
        let mut request = hoarder.requests.lock().unwrap().pop().unwrap();
        request.socket().unwrap().close();
        request.complete();

        assert_eq!(server.is_busy(fd), None);
        assert_eq!(server.tracked_count(), 0);
    }

    #[test]
    fn test_closed_request_leaves_newer_connection_alone() {
        let hoarder = Arc::new(Hoarder::default());
        let server = server(hoarder.clone());
        let (mut first, first_fd) = connect(&server);

        server.handle_event(0, first_fd, Readiness::Readable);
        let mut request = hoarder.requests.lock().unwrap().pop().unwrap();
        request.socket().unwrap().close();

        // A client arriving between the close and the completion
        let (mut second, second_fd) = connect(&server);
        assert_ne!(first_fd, second_fd);
        assert_eq!(server.tracked_count(), 2);

        request.complete();
        assert_eq!(server.is_busy(first_fd), None);
        assert_eq!(server.is_busy(second_fd), Some(false));
        assert_eq!(server.tracked_count(), 1);

        let mut buf = [0u8; 4];
        assert_eq!(first.read(&mut buf).unwrap(), 0);
        second.set_read_timeout(Some(std::time::Duration::from_millis(50))).unwrap();
        let err = second.read(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_peer_close_event_untracks() {
        let server = server(Arc::new(Hoarder::default()));
        let (_client, fd) = connect(&server);
        assert_eq!(server.tracked_count(), 1);

        server.handle_event(0, fd, Readiness::Closed);
        assert_eq!(server.tracked_count(), 0);
        assert_eq!(server.stats().closed, 1);
    }

    #[test]
    fn test_handler_panic_releases_busy_flag() {
        let server = server(Arc::new(Exploding));
        let (_client, fd) = connect(&server);

        server.handle_event(0, fd, Readiness::Readable);
        assert_eq!(server.is_busy(fd), Some(false));
    }

    #[test]
    fn test_zero_and_ignore_events_are_skipped() {
        let hoarder = Arc::new(Hoarder::default());
        let server = server(hoarder.clone());
        let (_client, fd) = connect(&server);

        server.handle_event(0, 0, Readiness::Readable);
        server.handle_event(0, fd, Readiness::Ignore);
        assert!(hoarder.requests.lock().unwrap().is_empty());
        assert_eq!(server.is_busy(fd), Some(false));
    }

    #[test]
    fn test_detached_request_closes_on_drop() {
        let listener = setup_listener(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)), 4).unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let fd = stream.as_raw_fd();

        let request = SocketRequest::detached(Socket::from_stream(stream));
        assert_eq!(request.fd(), Some(fd));
        drop(request);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
