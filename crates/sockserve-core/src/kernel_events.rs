//! Readiness multiplexer backend contract
//!
//! A backend (epoll, kqueue) registers descriptors for read interest and
//! blocks until at least one is ready. Ready events land in an
//! `EventBuffer` owned by the event loop thread; registration calls may
//! come from any thread.
//!
//! # Implementors
//!
//! - `Epoll` (Linux)
//! - `Kqueue` (macOS, FreeBSD, OpenBSD, NetBSD, DragonFly)

use std::io;

/// Raw file descriptor as seen by the kernel
pub type Fd = i32;

/// Backend-specific storage for the events returned by one wait
pub trait EventBuffer: Send {
    /// Maximum events one wait can return
    fn capacity(&self) -> usize;

    /// Descriptor of the event at `index`
    fn fd(&self, index: usize) -> Fd;

    /// Peer shut down its write side (EPOLLRDHUP / EV_EOF)
    fn is_read_close(&self, index: usize) -> bool;

    /// Hang-up or error on the descriptor
    fn is_disconnect(&self, index: usize) -> bool;

    /// Data (or a pending connection) can be read
    fn is_readable(&self, index: usize) -> bool;
}

/// Readiness multiplexer
///
/// **Contract:**
/// - `wait_for_events` blocks with no timeout until at least one event is
///   ready. An interrupted wait (EINTR) returns `Ok(0)`.
/// - `add_read_watch` / `remove_read_watch` are safe to call concurrently
///   with a blocked `wait_for_events`.
pub trait KernelEventBackend: Send + Sync + 'static {
    type Events: EventBuffer;

    fn name(&self) -> &'static str;

    fn new_event_buffer(&self, capacity: usize) -> Self::Events;

    fn add_read_watch(&self, fd: Fd) -> io::Result<()>;

    fn remove_read_watch(&self, fd: Fd) -> io::Result<()>;

    /// Returns the number of events written into `events`
    fn wait_for_events(&self, events: &mut Self::Events) -> io::Result<usize>;
}

/// How the event loop should treat one ready descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Peer closed or the descriptor errored: stop tracking and close
    Closed,
    /// Dispatch to the socket service handler
    Readable,
    /// Nothing actionable
    Ignore,
}

impl Readiness {
    /// Close conditions win over readability: a peer that sent data and
    /// then closed is reported as closed.
    pub fn classify<E: EventBuffer + ?Sized>(events: &E, index: usize) -> Self {
        if events.is_read_close(index) || events.is_disconnect(index) {
            Readiness::Closed
        } else if events.is_readable(index) {
            Readiness::Readable
        } else {
            Readiness::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// (fd, read_close, disconnect, readable)
    struct Scripted(Vec<(Fd, bool, bool, bool)>);

    impl EventBuffer for Scripted {
        fn capacity(&self) -> usize {
            self.0.len()
        }
        fn fd(&self, index: usize) -> Fd {
            self.0[index].0
        }
        fn is_read_close(&self, index: usize) -> bool {
            self.0[index].1
        }
        fn is_disconnect(&self, index: usize) -> bool {
            self.0[index].2
        }
        fn is_readable(&self, index: usize) -> bool {
            self.0[index].3
        }
    }

    #[test]
    fn test_classify() {
        let events = Scripted(vec![
            (5, false, false, true),
            (6, true, false, true),
            (7, false, true, false),
            (8, false, false, false),
        ]);
        assert_eq!(Readiness::classify(&events, 0), Readiness::Readable);
        assert_eq!(Readiness::classify(&events, 1), Readiness::Closed);
        assert_eq!(Readiness::classify(&events, 2), Readiness::Closed);
        assert_eq!(Readiness::classify(&events, 3), Readiness::Ignore);
    }
}
