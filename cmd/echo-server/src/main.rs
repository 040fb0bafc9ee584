//! Line echo server
//!
//! Every line received is written back unchanged. A line reading `quit`
//! ends the connection.
//!
//! Usage:
//!     cargo build --release -p sockserve-echo-server
//!     ./target/release/echo-server --port 9000 --threads 4 --mode kernel_events
//!     ./target/release/echo-server --config sockserve.ini
//!
//! Test with:
//!     echo "hello" | nc localhost 9000

use clap::Parser;
use log::info;
use sockserve::{logging, PlatformThreadingFactory, RequestHandler, ServerConfig, ServerMode, Socket, SocketServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "echo-server")]
#[command(about = "Line echo server over a thread pool")]
#[command(version)]
struct Args {
    /// INI file with a [server] section
    #[arg(short, long, env = "SOCKSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Listening port (overrides the file and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Pool workers, 0 runs the handler on the serving thread
    #[arg(short, long)]
    threads: Option<usize>,

    /// accept_loop or kernel_events
    #[arg(short, long)]
    mode: Option<ServerMode>,
}

struct Echo {
    lines: AtomicU64,
}

impl RequestHandler for Echo {
    fn handle_request(&self, socket: &mut Socket) -> bool {
        loop {
            let line = match socket.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => return false,
                Err(e) => {
                    log::debug!("fd {}: read failed: {}", socket.file_descriptor(), e);
                    return false;
                }
            };
            if line == "quit" {
                return false;
            }
            if socket.write_all(format!("{}\n", line).as_bytes()).is_err() {
                return false;
            }
            self.lines.fetch_add(1, Ordering::Relaxed);
            // One readiness event may carry several lines
            if !socket.has_pending() {
                return true;
            }
        }
    }
}

fn main() {
    logging::init();
    let args = Args::parse();

    let mut config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("critical: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config = config.port(port);
    }
    if let Some(threads) = args.threads {
        config = config.thread_pool_size(threads);
    }
    if let Some(mode) = args.mode {
        config = config.server_mode(mode);
    }

    info!("echo-server starting on {} ({} mode)", config.listen_addr(), config.server_mode);

    let handler = Arc::new(Echo { lines: AtomicU64::new(0) });
    let mut server = SocketServer::new(config, Arc::new(PlatformThreadingFactory::new())).with_handler(handler);
    std::process::exit(server.run());
}
