//! Sockets and listeners
//!
//! `Socket` is the connection handed to request handlers. It owns the
//! stream, so dropping it closes the connection; `close()` does the same
//! early and leaves the `Socket` in a closed state that the event server
//! recognizes when the handler hands it back.
//!
//! Reads retry on EINTR. Two message helpers sit on top of the byte
//! stream: newline-delimited lines and length-prefixed frames (4-byte
//! big-endian length, then payload).

use log::{debug, trace};
use sockserve_core::kernel_events::Fd;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};

/// Longest line `read_line` accepts
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Largest payload `receive_framed` accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// True if `fd` refers to an open descriptor in this process
pub fn is_valid_fd(fd: Fd) -> bool {
    fd >= 0 && nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn set_int_option(fd: Fd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    cvt(rc).map(|_| ())
}

fn get_int_option(fd: Fd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    cvt(rc).map(|_| value)
}

// ============================================================================
// Socket
// ============================================================================

/// Options applied to every accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
    /// SO_SNDBUF, left to the OS when `None`
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF, left to the OS when `None`
    pub receive_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keep_alive: false,
            send_buffer_size: None,
            receive_buffer_size: None,
        }
    }
}

impl SocketOptions {
    pub fn apply(&self, socket: &Socket) -> io::Result<()> {
        socket.set_tcp_nodelay(self.tcp_nodelay)?;
        socket.set_keep_alive(self.keep_alive)?;
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket.set_receive_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Connected stream socket
pub struct Socket {
    stream: Option<TcpStream>,
    /// Cleared by `close()`; the descriptor itself lives until drop
    open: bool,
    fd: Fd,
    peer: Option<SocketAddr>,
    /// Bytes read past the end of the last line or frame
    pending: Vec<u8>,
}

impl Socket {
    pub fn from_stream(stream: TcpStream) -> Self {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            open: true,
            fd,
            peer,
            pending: Vec::new(),
        }
    }

    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_stream(TcpStream::connect(addr)?))
    }

    /// Descriptor the socket was created with. Still reported after
    /// `close()`, for bookkeeping.
    pub fn file_descriptor(&self) -> Fd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.open && self.stream.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Shut down both directions. No-op if already closed.
    ///
    /// The descriptor stays allocated until the socket is dropped, so its
    /// number cannot be handed to a new connection while this one is still
    /// in someone's bookkeeping.
    pub fn close(&mut self) {
        if self.open {
            if let Some(stream) = &self.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.open = false;
            trace!("fd {} shut down", self.fd);
        }
        self.pending.clear();
    }

    /// True if bytes already read from the kernel are waiting in the
    /// line/frame buffer. Readiness events will not report them.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Give up ownership of the descriptor without closing it
    pub fn into_raw_fd(mut self) -> Option<Fd> {
        self.stream.take().map(IntoRawFd::into_raw_fd)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        loop {
            match stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Read available bytes. `Ok(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.read_raw(buf)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream()?.write_all(buf)
    }

    /// Pull more bytes into `pending`. Returns false on EOF.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.read_raw(&mut chunk)?;
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }

    /// Ensure `pending` holds at least `n` bytes. Returns false on a clean
    /// EOF before any byte arrived.
    fn fill_exact(&mut self, n: usize) -> io::Result<bool> {
        while self.pending.len() < n {
            if !self.fill()? {
                if self.pending.is_empty() {
                    return Ok(false);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-message"));
            }
        }
        Ok(true)
    }

    /// Read one line, without its `\n` (and `\r\n`). `None` on EOF; a
    /// final unterminated line is returned as-is.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos;
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
            scanned = self.pending.len();
            if scanned > MAX_LINE_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if !self.fill()? {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = mem::take(&mut self.pending);
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
    }

    /// Send `payload` as one length-prefixed frame
    pub fn send_framed(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.write_all(&frame)
    }

    /// Receive one length-prefixed frame. `None` on EOF at a frame
    /// boundary.
    pub fn receive_framed(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.fill_exact(4)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        if !self.fill_exact(4 + len)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame"));
        }
        let mut frame: Vec<u8> = self.pending.drain(..4 + len).collect();
        frame.drain(..4);
        Ok(Some(frame))
    }

    pub fn set_tcp_nodelay(&self, enabled: bool) -> io::Result<()> {
        set_int_option(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as libc::c_int)
    }

    pub fn set_keep_alive(&self, enabled: bool) -> io::Result<()> {
        set_int_option(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enabled as libc::c_int)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        set_int_option(self.fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size.min(i32::MAX as usize) as libc::c_int)
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> io::Result<()> {
        set_int_option(self.fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size.min(i32::MAX as usize) as libc::c_int)
    }

    /// Effective SO_SNDBUF (the kernel may round or double the request)
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        get_int_option(self.fd, libc::SOL_SOCKET, libc::SO_SNDBUF).map(|v| v as usize)
    }

    pub fn receive_buffer_size(&self) -> io::Result<usize> {
        get_int_option(self.fd, libc::SOL_SOCKET, libc::SO_RCVBUF).map(|v| v as usize)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("open", &self.is_open())
            .field("peer", &self.peer)
            .finish()
    }
}

// ============================================================================
// Listener
// ============================================================================

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn new_stream_socket(family: libc::c_int) -> io::Result<Fd> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            cvt(unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })
        } else {
            let fd = cvt(unsafe { libc::socket(family, libc::SOCK_STREAM, 0) })?;
            let flags = nix::fcntl::FdFlag::FD_CLOEXEC;
            if let Err(e) = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(flags)) {
                unsafe { libc::close(fd) };
                return Err(e.into());
            }
            Ok(fd)
        }
    }
}

/// Create a listening TCP socket: SO_REUSEADDR, bind, listen.
///
/// Port 0 binds an ephemeral port; read it back with `local_addr()`.
pub fn setup_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_stream_socket(family)?;
    // From here on the listener owns fd and closes it on error
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    set_int_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

    let (storage, len) = sockaddr_of(&addr);
    cvt(unsafe { libc::bind(fd, &storage as *const libc::sockaddr_storage as *const libc::sockaddr, len) })?;

    let backlog = backlog.clamp(1, libc::c_int::MAX as usize) as libc::c_int;
    cvt(unsafe { libc::listen(fd, backlog) })?;

    debug!("listening on {} (fd {}, backlog {})", addr, fd, backlog);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn loopback() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    /// Connected (client, server-side) pair over loopback
    fn pair() -> (Socket, Socket) {
        let listener = setup_listener(loopback(), 16).unwrap();
        let client = Socket::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, Socket::from_stream(server))
    }

    #[test]
    fn test_setup_listener_ephemeral_port() {
        let listener = setup_listener(loopback(), 8).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_setup_listener_port_in_use() {
        let first = setup_listener(loopback(), 8).unwrap();
        let taken = first.local_addr().unwrap();
        // SO_REUSEADDR does not permit two listeners on one port
        assert!(setup_listener(taken, 8).is_err());
    }

    #[test]
    fn test_read_line_splits_and_strips() {
        let (mut client, mut server) = pair();
        client.write_all(b"hello\r\nworld\npartial").unwrap();
        client.close();

        assert_eq!(server.read_line().unwrap().as_deref(), Some("hello"));
        assert!(server.has_pending());
        assert_eq!(server.read_line().unwrap().as_deref(), Some("world"));
        assert_eq!(server.read_line().unwrap().as_deref(), Some("partial"));
        assert_eq!(server.read_line().unwrap(), None);
    }

    #[test]
    fn test_framed_messages() {
        let (mut client, mut server) = pair();
        client.send_framed(b"first").unwrap();
        client.send_framed(b"").unwrap();
        client.close();

        assert_eq!(server.receive_framed().unwrap(), Some(b"first".to_vec()));
        assert_eq!(server.receive_framed().unwrap(), Some(Vec::new()));
        assert_eq!(server.receive_framed().unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let (mut client, mut server) = pair();
        client.write_all(&10u32.to_be_bytes()).unwrap();
        client.write_all(b"abc").unwrap();
        client.close();

        let err = server.receive_framed().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_close_and_validity() {
        let (_client, mut server) = pair();
        let fd = server.file_descriptor();
        assert!(server.is_open());
        assert!(is_valid_fd(fd));

        server.close();
        assert!(!server.is_open());
        assert_eq!(server.file_descriptor(), fd);
        // Shut down but still allocated until drop
        assert!(is_valid_fd(fd));
        assert_eq!(server.write_all(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(!is_valid_fd(-1));
    }

    #[test]
    fn test_options_apply() {
        let (_client, server) = pair();
        let opts = SocketOptions {
            send_buffer_size: Some(16 * 1024),
            ..SocketOptions::default()
        };
        opts.apply(&server).unwrap();
        assert!(server.send_buffer_size().unwrap() >= 16 * 1024);
    }
}
