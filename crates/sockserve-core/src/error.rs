//! Error types for threading primitives and the thread pool

use core::fmt;

/// Result type for primitive creation and thread operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for thread pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by a threading backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Mutex attribute setup or `pthread_mutex_init` failed
    MutexInit { name: String, errno: i32 },

    /// `pthread_cond_init` failed
    CondvarInit { name: String, errno: i32 },

    /// OS refused to spawn a thread
    SpawnFailed { name: String, reason: String },

    /// `start()` called on a thread that was already started
    AlreadyStarted,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::MutexInit { name, errno } => {
                write!(f, "mutex '{}' init failed: errno {}", name, errno)
            }
            SyncError::CondvarInit { name, errno } => {
                write!(f, "condition variable '{}' init failed: errno {}", name, errno)
            }
            SyncError::SpawnFailed { name, reason } => {
                write!(f, "failed to spawn thread '{}': {}", name, reason)
            }
            SyncError::AlreadyStarted => write!(f, "thread already started"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Thread pool errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The queue was shut down and accepts no more work
    QueueShutDown,

    /// The requested operation has no implementation yet
    Unsupported(&'static str),

    /// Invalid argument (e.g. zero workers)
    InvalidArgument(&'static str),

    /// A primitive could not be created
    Sync(SyncError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::QueueShutDown => write!(f, "work queue shut down"),
            PoolError::Unsupported(op) => write!(f, "unsupported operation: {}", op),
            PoolError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            PoolError::Sync(e) => write!(f, "sync error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for PoolError {
    fn from(e: SyncError) -> Self {
        PoolError::Sync(e)
    }
}

/// Result type for server setup and the serve loop
pub type ServerResult<T> = Result<T, ServerError>;

/// Socket server errors
#[derive(Debug)]
pub enum ServerError {
    /// Invalid or unreadable configuration
    Config(String),

    /// Socket, bind, listen or kernel-event syscall failed
    Io(std::io::Error),

    /// Thread pool could not be created or started
    Pool(PoolError),

    /// No readiness backend on this platform
    KernelEventsUnavailable,

    /// `run()` called before a successful `init()`
    NotInitialized,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(msg) => write!(f, "configuration error: {}", msg),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Pool(e) => write!(f, "thread pool error: {}", e),
            ServerError::KernelEventsUnavailable => {
                write!(f, "kernel events not available on this platform")
            }
            ServerError::NotInitialized => write!(f, "server not initialized"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<PoolError> for ServerError {
    fn from(e: PoolError) -> Self {
        ServerError::Pool(e)
    }
}

impl From<SyncError> for ServerError {
    fn from(e: SyncError) -> Self {
        ServerError::Pool(PoolError::Sync(e))
    }
}
