//! Placeholder backend for unix targets without epoll or kqueue
//!
//! Creation always fails, so callers fall back to the accept loop.

use sockserve_core::kernel_events::{EventBuffer, Fd, KernelEventBackend};
use std::io;

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "no kernel event backend on this platform")
}

pub struct Unavailable {
    _private: (),
}

impl Unavailable {
    pub fn new() -> io::Result<Self> {
        Err(unsupported())
    }
}

pub struct NoEvents;

impl EventBuffer for NoEvents {
    fn capacity(&self) -> usize {
        0
    }
    fn fd(&self, _index: usize) -> Fd {
        -1
    }
    fn is_read_close(&self, _index: usize) -> bool {
        false
    }
    fn is_disconnect(&self, _index: usize) -> bool {
        false
    }
    fn is_readable(&self, _index: usize) -> bool {
        false
    }
}

impl KernelEventBackend for Unavailable {
    type Events = NoEvents;

    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn new_event_buffer(&self, _capacity: usize) -> NoEvents {
        NoEvents
    }

    fn add_read_watch(&self, _fd: Fd) -> io::Result<()> {
        Err(unsupported())
    }

    fn remove_read_watch(&self, _fd: Fd) -> io::Result<()> {
        Err(unsupported())
    }

    fn wait_for_events(&self, _events: &mut NoEvents) -> io::Result<usize> {
        Err(unsupported())
    }
}
