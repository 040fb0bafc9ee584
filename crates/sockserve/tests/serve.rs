//! End-to-end serving over loopback in both modes

use sockserve::{PlatformThreadingFactory, RequestHandler, ServerConfig, ServerMode, Socket, SocketServer};
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Echoes lines back upper-cased; "boom" panics, "bye" hangs up
struct Shout {
    served: AtomicUsize,
}

impl RequestHandler for Shout {
    fn handle_request(&self, socket: &mut Socket) -> bool {
        loop {
            let line = match socket.read_line() {
                Ok(Some(line)) => line,
                _ => return false,
            };
            match line.as_str() {
                "boom" => panic!("handler asked to fail"),
                "bye" => return false,
                _ => {}
            }
            self.served.fetch_add(1, Ordering::SeqCst);
            if socket.write_all(format!("{}\n", line.to_uppercase()).as_bytes()).is_err() {
                return false;
            }
            if !socket.has_pending() {
                return true;
            }
        }
    }
}

/// Port the OS just handed out; free again by the time it is returned
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn start(mode: ServerMode, threads: usize) -> (SocketAddr, Arc<Shout>, ServerMode) {
    sockserve::logging::init();
    let handler = Arc::new(Shout { served: AtomicUsize::new(0) });
    let config = ServerConfig::new()
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(free_port())
        .thread_pool_size(threads)
        .server_mode(mode);

    let mut server = SocketServer::new(config, Arc::new(PlatformThreadingFactory::new())).with_handler(handler.clone());
    server.init().unwrap();
    let addr = server.local_addr().unwrap();
    let actual = server.mode().unwrap();

    std::thread::spawn(move || server.run());
    (addr, handler, actual)
}

fn client(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn round_trip(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, line: &str) -> String {
    stream.write_all(format!("{}\n", line).as_bytes()).unwrap();
    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    reply.trim_end().to_string()
}

fn exercise(addr: SocketAddr) {
    let (mut a, mut ra) = client(addr);
    let (mut b, mut rb) = client(addr);

    assert_eq!(round_trip(&mut a, &mut ra, "hello"), "HELLO");
    assert_eq!(round_trip(&mut b, &mut rb, "from b"), "FROM B");
    // Same connection keeps being serviced
    assert_eq!(round_trip(&mut a, &mut ra, "again"), "AGAIN");
    assert_eq!(round_trip(&mut b, &mut rb, "and b"), "AND B");
}

#[test]
fn test_accept_loop_with_pool() {
    let (addr, handler, mode) = start(ServerMode::AcceptLoop, 2);
    assert_eq!(mode, ServerMode::AcceptLoop);
    exercise(addr);
    assert_eq!(handler.served.load(Ordering::SeqCst), 4);
}

#[test]
fn test_accept_loop_inline() {
    let (addr, _, _) = start(ServerMode::AcceptLoop, 0);
    let (mut a, mut ra) = client(addr);
    assert_eq!(round_trip(&mut a, &mut ra, "solo"), "SOLO");
}

#[test]
fn test_kernel_events_with_pool() {
    let (addr, handler, mode) = start(ServerMode::KernelEvents, 2);
    assert_eq!(mode, ServerMode::platform_default());
    exercise(addr);
    assert_eq!(handler.served.load(Ordering::SeqCst), 4);
}

#[test]
fn test_kernel_events_inline() {
    let (addr, _, _) = start(ServerMode::KernelEvents, 0);
    exercise(addr);
}

#[test]
fn test_pipelined_lines_all_answered() {
    let (addr, _, _) = start(ServerMode::KernelEvents, 2);
    let (mut a, mut ra) = client(addr);
    a.write_all(b"one\ntwo\nthree\n").unwrap();

    let mut replies = Vec::new();
    for _ in 0..3 {
        let mut line = String::new();
        ra.read_line(&mut line).unwrap();
        replies.push(line.trim_end().to_string());
    }
    assert_eq!(replies, vec!["ONE", "TWO", "THREE"]);
}

#[test]
fn test_handler_panic_keeps_server_alive() {
    for mode in [ServerMode::AcceptLoop, ServerMode::KernelEvents] {
        let (addr, _, _) = start(mode, 1);

        let (mut bad, mut rbad) = client(addr);
        bad.write_all(b"boom\n").unwrap();
        let mut reply = String::new();
        // Connection is closed without a reply
        assert_eq!(rbad.read_line(&mut reply).unwrap(), 0);

        let (mut good, mut rgood) = client(addr);
        assert_eq!(round_trip(&mut good, &mut rgood, "still here"), "STILL HERE");
    }
}

#[test]
fn test_hang_up_closes_connection() {
    let (addr, _, _) = start(ServerMode::KernelEvents, 1);
    let (mut a, mut ra) = client(addr);
    a.write_all(b"bye\n").unwrap();
    let mut reply = String::new();
    assert_eq!(ra.read_line(&mut reply).unwrap(), 0);
}
