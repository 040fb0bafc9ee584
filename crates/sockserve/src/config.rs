//! Server configuration
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (`SOCKSERVE_*`)
//! 2. INI file, `[server]` section
//! 3. Library defaults
//!
//! A value that is present but malformed is logged and ignored; the lower
//! priority value stays in effect.
//!
//! # Example
//!
//! ```ini
//! [server]
//! port = 9000
//! thread_pool_size = 8
//! server_mode = kernel_events
//! socket_send_buffer_size = 16384
//! log_level = debug
//! ```
//!
//! ```rust,ignore
//! let config = ServerConfig::load(Some(Path::new("sockserve.ini")))?;
//! let config = ServerConfig::from_env().thread_pool_size(2);
//! ```

use config::{Config, File, FileFormat};
use log::{warn, LevelFilter};
use sockserve_core::constants::{
    DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, DEFAULT_SOCKET_BUFFER_SIZE,
    DEFAULT_THREAD_POOL_SIZE,
};
use sockserve_core::env::env_var;
use sockserve_core::error::{ServerError, ServerResult};
use sockserve_core::logging::parse_level;
use sockserve_runtime::{kernel_events_supported, SocketOptions};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

/// INI section holding the server keys
pub const SECTION: &str = "server";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SOCKSERVE_";

/// How connections are accepted and dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Blocking `accept()` loop, one pool job per connection
    AcceptLoop,
    /// Readiness loop (epoll / kqueue), one pool job per readable event
    KernelEvents,
}

impl ServerMode {
    /// Kernel events where the platform has them, accept loop otherwise
    pub fn platform_default() -> Self {
        if kernel_events_supported() {
            ServerMode::KernelEvents
        } else {
            ServerMode::AcceptLoop
        }
    }
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "accept" | "accept_loop" | "blocking" => Ok(ServerMode::AcceptLoop),
            "kernel_events" | "kernel" | "events" | "epoll" | "kqueue" => Ok(ServerMode::KernelEvents),
            other => Err(format!("unknown server mode '{}'", other)),
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::AcceptLoop => write!(f, "accept_loop"),
            ServerMode::KernelEvents => write!(f, "kernel_events"),
        }
    }
}

/// Socket server configuration with builder pattern
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Listening port; must be non-zero
    pub port: u16,
    pub bind_address: IpAddr,
    /// Pool workers; 0 runs handlers inline on the serving thread
    pub thread_pool_size: usize,
    /// SO_SNDBUF for accepted sockets; 0 leaves the OS default
    pub socket_send_buffer_size: usize,
    /// SO_RCVBUF for accepted sockets; 0 leaves the OS default
    pub socket_receive_buffer_size: usize,
    pub server_mode: ServerMode,
    /// Listen backlog; must be non-zero
    pub max_connections: usize,
    pub tcp_nodelay: bool,
    pub log_level: LevelFilter,
    /// Readiness events fetched per kernel wait
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("not a boolean: '{}'", other)),
    }
}

fn parse_log_level(raw: &str) -> Result<LevelFilter, String> {
    parse_level(raw).ok_or_else(|| format!("unknown log level '{}'", raw.trim()))
}

fn parse_from<T: FromStr>(raw: &str) -> Result<T, String> {
    raw.trim().parse().map_err(|_| format!("cannot parse '{}'", raw.trim()))
}

/// Overwrite `slot` with `raw` if it parses; warn otherwise
fn apply<T>(source: &str, key: &str, raw: Option<String>, parse: fn(&str) -> Result<T, String>, slot: &mut T) {
    let Some(raw) = raw else {
        return;
    };
    match parse(&raw) {
        Ok(value) => *slot = value,
        Err(reason) => warn!("{}: ignoring {}: {}", source, key, reason),
    }
}

impl ServerConfig {
    /// Library defaults, no file or environment
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            socket_send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            socket_receive_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            server_mode: ServerMode::platform_default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tcp_nodelay: true,
            log_level: LevelFilter::Info,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `SOCKSERVE_PORT`
    /// - `SOCKSERVE_BIND_ADDRESS`
    /// - `SOCKSERVE_THREAD_POOL_SIZE`
    /// - `SOCKSERVE_SOCKET_SEND_BUFFER_SIZE`
    /// - `SOCKSERVE_SOCKET_RECEIVE_BUFFER_SIZE`
    /// - `SOCKSERVE_SERVER_MODE` - accept_loop | kernel_events
    /// - `SOCKSERVE_MAX_CONNECTIONS`
    /// - `SOCKSERVE_TCP_NODELAY` - 0/1
    /// - `SOCKSERVE_LOG_LEVEL`
    /// - `SOCKSERVE_EVENT_CAPACITY`
    pub fn from_env() -> Self {
        Self::new().with_env_overrides()
    }

    /// Defaults, then the INI file at `path` (if given), then environment
    pub fn load(path: Option<&Path>) -> ServerResult<Self> {
        let config = match path {
            Some(path) => Self::new().with_ini_file(path)?,
            None => Self::new(),
        };
        Ok(config.with_env_overrides())
    }

    /// Apply the `[server]` section of an INI file
    pub fn with_ini_file(self, path: &Path) -> ServerResult<Self> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(self.with_settings(&settings, &path.display().to_string()))
    }

    /// Apply the `[server]` section of INI text
    pub fn with_ini_str(self, text: &str) -> ServerResult<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(self.with_settings(&settings, "ini"))
    }

    fn with_settings(mut self, settings: &Config, source: &str) -> Self {
        let get = |key: &str| settings.get_string(&format!("{}.{}", SECTION, key)).ok();
        self.apply_all(source, get);
        self
    }

    fn with_env_overrides(mut self) -> Self {
        let get = |key: &str| env_var(&format!("{}{}", ENV_PREFIX, key.to_uppercase()));
        self.apply_all("environment", get);
        self
    }

    fn apply_all(&mut self, source: &str, get: impl Fn(&str) -> Option<String>) {
        apply(source, "port", get("port"), parse_from, &mut self.port);
        apply(source, "bind_address", get("bind_address"), parse_from, &mut self.bind_address);
        apply(source, "thread_pool_size", get("thread_pool_size"), parse_from, &mut self.thread_pool_size);
        apply(
            source,
            "socket_send_buffer_size",
            get("socket_send_buffer_size"),
            parse_from,
            &mut self.socket_send_buffer_size,
        );
        apply(
            source,
            "socket_receive_buffer_size",
            get("socket_receive_buffer_size"),
            parse_from,
            &mut self.socket_receive_buffer_size,
        );
        apply(source, "server_mode", get("server_mode"), parse_from, &mut self.server_mode);
        apply(source, "max_connections", get("max_connections"), parse_from, &mut self.max_connections);
        apply(source, "tcp_nodelay", get("tcp_nodelay"), parse_flag, &mut self.tcp_nodelay);
        apply(source, "log_level", get("log_level"), parse_log_level, &mut self.log_level);
        apply(source, "event_capacity", get("event_capacity"), parse_from, &mut self.event_capacity);
    }

    // Builder methods

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn thread_pool_size(mut self, n: usize) -> Self {
        self.thread_pool_size = n;
        self
    }

    pub fn socket_send_buffer_size(mut self, size: usize) -> Self {
        self.socket_send_buffer_size = size;
        self
    }

    pub fn socket_receive_buffer_size(mut self, size: usize) -> Self {
        self.socket_receive_buffer_size = size;
        self
    }

    pub fn server_mode(mut self, mode: ServerMode) -> Self {
        self.server_mode = mode;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    /// Reject settings the server cannot start with
    pub fn validate(&self) -> ServerResult<()> {
        if self.port == 0 {
            return Err(ServerError::Config("port must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ServerError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Options applied to each accepted connection
    pub fn socket_options(&self) -> SocketOptions {
        let size = |n: usize| (n > 0).then_some(n);
        SocketOptions {
            tcp_nodelay: self.tcp_nodelay,
            keep_alive: false,
            send_buffer_size: size(self.socket_send_buffer_size),
            receive_buffer_size: size(self.socket_receive_buffer_size),
        }
    }
}
