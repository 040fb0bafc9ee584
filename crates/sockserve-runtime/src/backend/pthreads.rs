//! POSIX threads backend
//!
//! Mutexes are created with `PTHREAD_MUTEX_ERRORCHECK`, so relocking from the
//! owning thread and unlocking from a non-owner fail with an error code
//! instead of deadlocking or corrupting state. Both are reported as `false`.
//!
//! The pthread objects live in a `Box` because they must not move once
//! initialized.

use log::{debug, error, trace};
use sockserve_core::error::{SyncError, SyncResult};
use sockserve_core::factory::ThreadingFactory;
use sockserve_core::runnable::WorkItem;
use sockserve_core::sync::{ConditionVariable, Mutex};
use sockserve_core::thread::{Thread, ThreadRoutine};
use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// ============================================================================
// Mutex
// ============================================================================

/// Error-checking pthread mutex
pub struct PthreadsMutex {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    /// Advisory: last lock/unlock outcome through this handle
    locked: AtomicBool,
    name: String,
}

// Safety: pthread mutexes are designed to be shared between threads; the
// boxed storage never moves.
unsafe impl Send for PthreadsMutex {}
unsafe impl Sync for PthreadsMutex {}

impl PthreadsMutex {
    pub fn new(name: &str) -> SyncResult<Self> {
        let init_err = |errno| SyncError::MutexInit {
            name: name.to_string(),
            errno,
        };

        let mut attr: libc::pthread_mutexattr_t = unsafe { mem::zeroed() };
        let rc = unsafe { libc::pthread_mutexattr_init(&mut attr) };
        if rc != 0 {
            return Err(init_err(rc));
        }

        let rc = unsafe { libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK) };
        if rc != 0 {
            unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
            return Err(init_err(rc));
        }

        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        let rc = unsafe { libc::pthread_mutex_init(raw.get(), &attr) };
        unsafe { libc::pthread_mutexattr_destroy(&mut attr) };
        if rc != 0 {
            return Err(init_err(rc));
        }

        trace!("mutex '{}' created", name);
        Ok(Self {
            raw,
            locked: AtomicBool::new(false),
            name: name.to_string(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }
}

impl Mutex for PthreadsMutex {
    fn lock(&self) -> bool {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        if rc != 0 {
            debug!("mutex '{}' lock failed: errno {}", self.name, rc);
            return false;
        }
        self.locked.store(true, Ordering::Relaxed);
        true
    }

    fn try_lock(&self) -> bool {
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        if rc != 0 {
            if rc != libc::EBUSY {
                debug!("mutex '{}' trylock failed: errno {}", self.name, rc);
            }
            return false;
        }
        self.locked.store(true, Ordering::Relaxed);
        true
    }

    fn unlock(&self) -> bool {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if rc != 0 {
            debug!("mutex '{}' unlock failed: errno {}", self.name, rc);
            return false;
        }
        self.locked.store(false, Ordering::Relaxed);
        true
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PthreadsMutex {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        if rc != 0 {
            error!("mutex '{}' destroyed while in use: errno {}", self.name, rc);
        }
    }
}

// ============================================================================
// Condition variable
// ============================================================================

/// pthread condition variable, paired with `PthreadsMutex`
pub struct PthreadsConditionVariable {
    raw: Box<UnsafeCell<libc::pthread_cond_t>>,
    name: String,
}

// Safety: as for PthreadsMutex
unsafe impl Send for PthreadsConditionVariable {}
unsafe impl Sync for PthreadsConditionVariable {}

impl PthreadsConditionVariable {
    pub fn new(name: &str) -> SyncResult<Self> {
        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        let rc = unsafe { libc::pthread_cond_init(raw.get(), std::ptr::null()) };
        if rc != 0 {
            return Err(SyncError::CondvarInit {
                name: name.to_string(),
                errno: rc,
            });
        }

        trace!("condition variable '{}' created", name);
        Ok(Self {
            raw,
            name: name.to_string(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.raw.get()
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now
fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);

    let mut deadline: libc::timespec = unsafe { mem::zeroed() };
    deadline.tv_sec = secs.min(libc::time_t::MAX as u64) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    deadline
}

impl ConditionVariable for PthreadsConditionVariable {
    type Mutex = PthreadsMutex;

    fn wait(&self, mutex: &PthreadsMutex) -> bool {
        let rc = unsafe { libc::pthread_cond_wait(self.raw(), mutex.raw()) };
        if rc != 0 {
            debug!("condvar '{}' wait on '{}' failed: errno {}", self.name, mutex.name, rc);
            return false;
        }
        true
    }

    fn wait_timeout(&self, mutex: &PthreadsMutex, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let rc = unsafe { libc::pthread_cond_timedwait(self.raw(), mutex.raw(), &deadline) };
        match rc {
            0 => true,
            libc::ETIMEDOUT => false,
            _ => {
                debug!("condvar '{}' timed wait failed: errno {}", self.name, rc);
                false
            }
        }
    }

    fn notify_one(&self) {
        unsafe { libc::pthread_cond_signal(self.raw()) };
    }

    fn notify_all(&self) {
        unsafe { libc::pthread_cond_broadcast(self.raw()) };
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PthreadsConditionVariable {
    fn drop(&mut self) {
        unsafe { libc::pthread_cond_destroy(self.raw()) };
    }
}

// ============================================================================
// Thread
// ============================================================================

/// Kernel thread id of the calling thread, where the OS exposes one
fn current_native_id() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
            let mut id: u64 = 0;
            unsafe { libc::pthread_threadid_np(0, &mut id) };
            id
        } else {
            0
        }
    }
}

/// Named OS thread running one `WorkItem`
pub struct PthreadsThread {
    name: String,
    item: Option<WorkItem>,
    alive: Arc<AtomicBool>,
    native_id: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl PthreadsThread {
    pub fn new(item: WorkItem, name: &str) -> Self {
        Self {
            name: name.to_string(),
            item: Some(item),
            alive: Arc::new(AtomicBool::new(false)),
            native_id: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }
}

impl Thread for PthreadsThread {
    fn start(&mut self) -> SyncResult<()> {
        let item = self.item.take().ok_or(SyncError::AlreadyStarted)?;

        let name = self.name.clone();
        let alive = Arc::clone(&self.alive);
        let native_id = Arc::clone(&self.native_id);

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                native_id.store(current_native_id(), Ordering::Release);
                ThreadRoutine::new(&name, alive, item).run();
            })
            .map_err(|e| SyncError::SpawnFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    fn join(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn native_id(&self) -> Option<u64> {
        match self.native_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Threading factory over POSIX threads
#[derive(Debug, Default, Clone, Copy)]
pub struct PthreadsThreadingFactory;

impl PthreadsThreadingFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ThreadingFactory for PthreadsThreadingFactory {
    type Mutex = PthreadsMutex;
    type ConditionVariable = PthreadsConditionVariable;
    type Thread = PthreadsThread;

    fn create_mutex(&self, name: &str) -> SyncResult<PthreadsMutex> {
        PthreadsMutex::new(name)
    }

    fn create_condition_variable(&self, name: &str) -> SyncResult<PthreadsConditionVariable> {
        PthreadsConditionVariable::new(name)
    }

    fn create_thread(&self, item: WorkItem, name: &str) -> SyncResult<PthreadsThread> {
        Ok(PthreadsThread::new(item, name))
    }

    fn backend_name(&self) -> &'static str {
        "pthreads"
    }
}
