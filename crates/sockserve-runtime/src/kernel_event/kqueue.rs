//! kqueue backend (macOS and the BSDs)
//!
//! One `EVFILT_READ` filter per descriptor. End of stream shows up as
//! `EV_EOF` on the read filter, errors as `EV_ERROR`.

use sockserve_core::kernel_events::{EventBuffer, Fd, KernelEventBackend};
use std::io;
use std::mem;
use std::ptr;

pub struct Kqueue {
    kq: Fd,
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq })
    }

    fn change(&self, fd: Fd, flags: u32) -> io::Result<()> {
        let mut change: libc::kevent = unsafe { mem::zeroed() };
        change.ident = fd as libc::uintptr_t;
        change.filter = libc::EVFILT_READ as _;
        change.flags = flags as _;

        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

pub struct KqueueEvents {
    events: Vec<libc::kevent>,
}

// Safety: udata is never set, so the raw pointer inside kevent is always null
unsafe impl Send for KqueueEvents {}

impl EventBuffer for KqueueEvents {
    fn capacity(&self) -> usize {
        self.events.len()
    }

    fn fd(&self, index: usize) -> Fd {
        self.events[index].ident as Fd
    }

    fn is_read_close(&self, index: usize) -> bool {
        self.events[index].flags as u32 & libc::EV_EOF as u32 != 0
    }

    fn is_disconnect(&self, index: usize) -> bool {
        self.events[index].flags as u32 & libc::EV_ERROR as u32 != 0
    }

    fn is_readable(&self, index: usize) -> bool {
        self.events[index].filter == libc::EVFILT_READ as _
    }
}

impl KernelEventBackend for Kqueue {
    type Events = KqueueEvents;

    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn new_event_buffer(&self, capacity: usize) -> KqueueEvents {
        let empty: libc::kevent = unsafe { mem::zeroed() };
        KqueueEvents {
            events: vec![empty; capacity.max(1)],
        }
    }

    fn add_read_watch(&self, fd: Fd) -> io::Result<()> {
        self.change(fd, (libc::EV_ADD | libc::EV_ENABLE) as u32)
    }

    fn remove_read_watch(&self, fd: Fd) -> io::Result<()> {
        self.change(fd, libc::EV_DELETE as u32)
    }

    fn wait_for_events(&self, events: &mut KqueueEvents) -> io::Result<usize> {
        let max = events.events.len().min(libc::c_int::MAX as usize);
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.events.as_mut_ptr(),
                max as _,
                ptr::null(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_readable_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let kq = Kqueue::new().unwrap();
        kq.add_read_watch(server.as_raw_fd()).unwrap();
        client.write_all(b"x").unwrap();

        let mut events = kq.new_event_buffer(8);
        assert_eq!(kq.wait_for_events(&mut events).unwrap(), 1);
        assert_eq!(events.fd(0), server.as_raw_fd());
        assert!(events.is_readable(0));

        kq.remove_read_watch(server.as_raw_fd()).unwrap();
    }
}
