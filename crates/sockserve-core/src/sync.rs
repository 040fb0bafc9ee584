//! Mutual exclusion and condition waiting
//!
//! `Mutex` and `ConditionVariable` are the contract every threading backend
//! implements. `lock()` / `unlock()` report success as booleans instead of
//! panicking, so callers can react to a double lock or an unlock by a
//! non-owner (backends use error-checking mutexes to detect both).
//!
//! A condition variable is typed by the mutex it pairs with, so a wait can
//! never be handed a mutex from a different backend.
//!
//! `Guarded<M, T>` couples a backend mutex with the data it protects and is
//! what the rest of the workspace actually uses.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::time::Duration;

/// OS mutual-exclusion primitive
pub trait Mutex: Send + Sync {
    /// Block until the mutex is acquired. Returns false on error
    /// (e.g. relocking a mutex the caller already holds).
    fn lock(&self) -> bool;

    /// Acquire without blocking. Returns false if held elsewhere or on error.
    fn try_lock(&self) -> bool;

    /// Release the mutex. Returns false if the caller does not own it.
    fn unlock(&self) -> bool;

    /// Outcome of the last successful lock/unlock made through this handle.
    ///
    /// Advisory only: it is not a read of the kernel object and says
    /// nothing reliable about other threads.
    fn is_locked(&self) -> bool;

    /// Diagnostic name given at creation
    fn name(&self) -> &str;
}

/// Condition variable paired with one mutex type
pub trait ConditionVariable: Send + Sync {
    type Mutex: Mutex;

    /// Atomically release `mutex`, block, and re-acquire before returning.
    ///
    /// The caller must hold `mutex`. Wakeups may be spurious: always
    /// re-check the predicate in a loop. Returns false on error.
    fn wait(&self, mutex: &Self::Mutex) -> bool;

    /// Like `wait`, bounded by `timeout`. Returns true if woken before the
    /// timeout elapsed, false on timeout or error.
    fn wait_timeout(&self, mutex: &Self::Mutex, timeout: Duration) -> bool;

    /// Wake one waiter. Never blocks.
    fn notify_one(&self);

    /// Wake every waiter. Never blocks.
    fn notify_all(&self);

    fn name(&self) -> &str;
}

/// RAII lock over a bare `Mutex`
///
/// Unlocks on drop if (and only if) the lock was acquired.
pub struct MutexLock<'a, M: Mutex + ?Sized> {
    mutex: &'a M,
    locked: bool,
}

impl<'a, M: Mutex + ?Sized> MutexLock<'a, M> {
    pub fn new(mutex: &'a M) -> Self {
        let locked = mutex.lock();
        Self { mutex, locked }
    }

    /// Whether the constructor actually acquired the mutex
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Release early. Returns the unlock outcome; a second call is a no-op
    /// returning false.
    pub fn unlock(&mut self) -> bool {
        if !self.locked {
            return false;
        }
        self.locked = false;
        self.mutex.unlock()
    }
}

impl<'a, M: Mutex + ?Sized> Drop for MutexLock<'a, M> {
    fn drop(&mut self) {
        if self.locked {
            self.mutex.unlock();
        }
    }
}

/// Data protected by a backend mutex
///
/// Access goes through `lock()`, which returns a guard only if the mutex
/// was acquired. The guard also exposes condition waits, so state guarded
/// here can be waited on without ever touching the raw mutex.
pub struct Guarded<M: Mutex, T> {
    mutex: M,
    data: UnsafeCell<T>,
}

// Safety: the data is only reachable through a GuardedLock, which exists
// only while `mutex` is held.
unsafe impl<M: Mutex, T: Send> Send for Guarded<M, T> {}
unsafe impl<M: Mutex, T: Send> Sync for Guarded<M, T> {}

impl<M: Mutex, T> Guarded<M, T> {
    pub fn new(mutex: M, value: T) -> Self {
        Self {
            mutex,
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the mutex. `None` means the backend reported a lock failure.
    pub fn lock(&self) -> Option<GuardedLock<'_, M, T>> {
        if self.mutex.lock() {
            Some(GuardedLock { guarded: self })
        } else {
            None
        }
    }

    pub fn try_lock(&self) -> Option<GuardedLock<'_, M, T>> {
        if self.mutex.try_lock() {
            Some(GuardedLock { guarded: self })
        } else {
            None
        }
    }

    pub fn mutex(&self) -> &M {
        &self.mutex
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Guard that releases the `Guarded` mutex when dropped
pub struct GuardedLock<'a, M: Mutex, T> {
    guarded: &'a Guarded<M, T>,
}

impl<'a, M: Mutex, T> GuardedLock<'a, M, T> {
    /// Wait on `cond`, releasing the mutex while blocked.
    ///
    /// Single wait, no predicate loop: callers loop themselves.
    pub fn wait<C>(&mut self, cond: &C) -> bool
    where
        C: ConditionVariable<Mutex = M>,
    {
        cond.wait(&self.guarded.mutex)
    }

    pub fn wait_timeout<C>(&mut self, cond: &C, timeout: Duration) -> bool
    where
        C: ConditionVariable<Mutex = M>,
    {
        cond.wait_timeout(&self.guarded.mutex, timeout)
    }
}

impl<'a, M: Mutex, T> Deref for GuardedLock<'a, M, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.guarded.data.get() }
    }
}

impl<'a, M: Mutex, T> DerefMut for GuardedLock<'a, M, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.guarded.data.get() }
    }
}

impl<'a, M: Mutex, T> Drop for GuardedLock<'a, M, T> {
    fn drop(&mut self) {
        self.guarded.mutex.unlock();
    }
}
