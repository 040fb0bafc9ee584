//! epoll backend (Linux)
//!
//! Level-triggered. Connections are watched for `EPOLLIN | EPOLLRDHUP`; the
//! kernel always reports `EPOLLHUP` and `EPOLLERR`. The descriptor rides in
//! the event's user data.

use sockserve_core::kernel_events::{EventBuffer, Fd, KernelEventBackend};
use std::io;

const READ_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;

pub struct Epoll {
    epfd: Fd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: Fd, interest: u32) -> io::Result<()> {
        // DEL ignores the event, but kernels before 2.6.9 reject a null one
        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

pub struct EpollEvents {
    events: Vec<libc::epoll_event>,
}

impl EventBuffer for EpollEvents {
    fn capacity(&self) -> usize {
        self.events.len()
    }

    fn fd(&self, index: usize) -> Fd {
        let data = self.events[index].u64;
        data as Fd
    }

    fn is_read_close(&self, index: usize) -> bool {
        let flags = self.events[index].events;
        flags & libc::EPOLLRDHUP as u32 != 0
    }

    fn is_disconnect(&self, index: usize) -> bool {
        let flags = self.events[index].events;
        flags & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }

    fn is_readable(&self, index: usize) -> bool {
        let flags = self.events[index].events;
        flags & libc::EPOLLIN as u32 != 0
    }
}

impl KernelEventBackend for Epoll {
    type Events = EpollEvents;

    fn name(&self) -> &'static str {
        "epoll"
    }

    fn new_event_buffer(&self, capacity: usize) -> EpollEvents {
        EpollEvents {
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        }
    }

    fn add_read_watch(&self, fd: Fd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, READ_INTEREST) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            other => other,
        }
    }

    fn remove_read_watch(&self, fd: Fd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn wait_for_events(&self, events: &mut EpollEvents) -> io::Result<usize> {
        let max = events.events.len().min(libc::c_int::MAX as usize) as libc::c_int;
        let n = unsafe { libc::epoll_wait(self.epfd, events.events.as_mut_ptr(), max, -1) };
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

        let epoll = Epoll::new().unwrap();
        epoll.add_read_watch(server.as_raw_fd()).unwrap();
        // Second add is tolerated
        epoll.add_read_watch(server.as_raw_fd()).unwrap();

        client.write_all(b"x").unwrap();
        let mut events = epoll.new_event_buffer(8);
        let n = epoll.wait_for_events(&mut events).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.fd(0), server.as_raw_fd());
        assert!(events.is_readable(0));
        assert!(!events.is_read_close(0));

        epoll.remove_read_watch(server.as_raw_fd()).unwrap();
        assert!(epoll.remove_read_watch(server.as_raw_fd()).is_err());
    }

    #[test]
    fn test_peer_close_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let epoll = Epoll::new().unwrap();
        epoll.add_read_watch(server.as_raw_fd()).unwrap();
        drop(client);

        let mut events = epoll.new_event_buffer(8);
        assert_eq!(epoll.wait_for_events(&mut events).unwrap(), 1);
        assert!(events.is_read_close(0));
    }
}
