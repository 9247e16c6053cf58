//! Locking Primitives
//!
//! Provides:
//! - `RawMutex`: a benaphore. An atomic counter carries the uncontended
//!   path; only contended lock/unlock touch the backing semaphore.
//! - `Mutex<T>`: a data-carrying lock over `RawMutex` whose guard is the
//!   scoped locker used by caches and descriptor tables.
//! - `RecursiveLock`: a semaphore with an owner and a recursion count.
//!
//! Unlocking a lock the calling thread does not hold is a kernel bug and
//! panics.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::kern::sem::Semaphore;
use crate::kern::thread::current_thread;
use crate::types::ThreadId;

/// Holder value of an unowned lock
const NO_HOLDER: u64 = u64::MAX;

fn holder_from_raw(raw: u64) -> Option<ThreadId> {
    if raw == NO_HOLDER {
        None
    } else {
        Some(ThreadId(raw))
    }
}

// ============================================================================
// Mutex (benaphore)
// ============================================================================

/// A sleeping mutex with an atomic fast path
#[derive(Debug)]
pub struct RawMutex {
    /// Holders plus waiters
    count: AtomicI32,
    /// Waiters block here
    sem: Semaphore,
    holder: AtomicU64,
    name: &'static str,
}

impl RawMutex {
    /// Create a new unlocked mutex
    pub const fn new(name: &'static str) -> Self {
        Self {
            count: AtomicI32::new(0),
            sem: Semaphore::new(name, 0),
            holder: AtomicU64::new(NO_HOLDER),
            name,
        }
    }

    /// Acquire the mutex, blocking while another thread holds it
    pub fn lock(&self) {
        if self.count.fetch_add(1, Ordering::AcqRel) > 0 {
            self.sem.acquire();
        }
        self.holder.store(current_thread().0, Ordering::Release);
    }

    /// Try to acquire the mutex without blocking
    pub fn try_lock(&self) -> bool {
        if self
            .count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.holder.store(current_thread().0, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Release the mutex
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not the holder.
    pub fn unlock(&self) {
        let thread = current_thread();
        let holder = self.holder.load(Ordering::Acquire);
        if holder != thread.0 {
            panic!(
                "mutex_unlock: mutex {} not held by thread {} (holder {:?})",
                self.name,
                thread.0,
                holder_from_raw(holder)
            );
        }
        self.holder.store(NO_HOLDER, Ordering::Release);
        if self.count.fetch_sub(1, Ordering::AcqRel) > 1 {
            self.sem.release(1);
        }
    }

    /// Check if the mutex is held
    pub fn is_locked(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }

    /// Thread holding the mutex
    pub fn holder(&self) -> Option<ThreadId> {
        holder_from_raw(self.holder.load(Ordering::Acquire))
    }

    /// Mutex name (for debugging)
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Mutex with Data
// ============================================================================

/// A mutex that protects data
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            raw: RawMutex::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Access the data through a unique borrow, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// The underlying raw mutex
    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.raw.name())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped holder of a [`Mutex`]; unlocks on drop
///
/// Guards stay on the thread that locked them.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard holds, for re-locking after a wait
    pub fn mutex(this: &Self) -> &'a Mutex<T> {
        this.mutex
    }
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

// ============================================================================
// Recursive Lock
// ============================================================================

/// A lock the holding thread may take again without blocking
#[derive(Debug)]
pub struct RecursiveLock {
    sem: Semaphore,
    holder: AtomicU64,
    /// Only written by the holder
    recursion: AtomicU32,
    name: &'static str,
}

impl RecursiveLock {
    /// Create a new unlocked recursive lock
    pub const fn new(name: &'static str) -> Self {
        Self {
            sem: Semaphore::new(name, 1),
            holder: AtomicU64::new(NO_HOLDER),
            recursion: AtomicU32::new(0),
            name,
        }
    }

    /// Acquire the lock; re-entry by the holder only bumps the count
    pub fn lock(&self) {
        let thread = current_thread();
        if self.holder.load(Ordering::Acquire) == thread.0 {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sem.acquire();
        self.holder.store(thread.0, Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> bool {
        let thread = current_thread();
        if self.holder.load(Ordering::Acquire) == thread.0 {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if !self.sem.try_acquire() {
            return false;
        }
        self.holder.store(thread.0, Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
        true
    }

    /// Release one level of the lock
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not the holder.
    pub fn unlock(&self) {
        let thread = current_thread();
        let holder = self.holder.load(Ordering::Acquire);
        if holder != thread.0 {
            panic!(
                "recursive_lock_unlock: lock {} not held by thread {} (holder {:?})",
                self.name,
                thread.0,
                holder_from_raw(holder)
            );
        }
        if self.recursion.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.holder.store(NO_HOLDER, Ordering::Release);
            self.sem.release(1);
        }
    }

    /// Times the holder has taken the lock (0 when unlocked)
    pub fn recursion(&self) -> u32 {
        if self.holder().is_some() {
            self.recursion.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Thread holding the lock
    pub fn holder(&self) -> Option<ThreadId> {
        holder_from_raw(self.holder.load(Ordering::Acquire))
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}

/// RAII guard for a recursive lock
pub struct RecursiveLockGuard<'a> {
    lock: &'a RecursiveLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RecursiveLockGuard<'a> {
    pub fn new(lock: &'a RecursiveLock) -> Self {
        lock.lock();
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for RecursiveLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ============================================================================
// Compatibility Functions
// ============================================================================

/// Acquire a mutex
pub fn mutex_lock(lock: &RawMutex) {
    lock.lock();
}

/// Release a mutex
pub fn mutex_unlock(lock: &RawMutex) {
    lock.unlock();
}

/// Try to acquire a mutex
pub fn mutex_trylock(lock: &RawMutex) -> bool {
    lock.try_lock()
}

/// Acquire a recursive lock
pub fn recursive_lock_lock(lock: &RecursiveLock) {
    lock.lock();
}

/// Release a recursive lock
pub fn recursive_lock_unlock(lock: &RecursiveLock) {
    lock.unlock();
}

/// Try to acquire a recursive lock
pub fn recursive_lock_trylock(lock: &RecursiveLock) -> bool {
    lock.try_lock()
}

/// Current recursion depth of a recursive lock
pub fn recursive_lock_get_recursion(lock: &RecursiveLock) -> u32 {
    lock.recursion()
}
