//! Scheduling Primitives - Wait/Notify
//!
//! Threads wait for events through a [`ConditionVariable`]. The protocol
//! mirrors a kernel wait queue:
//!
//! 1. While holding the lock that protects the condition, call
//!    [`ConditionVariable::add`] to get an entry.
//! 2. Drop the lock.
//! 3. Call [`ConditionVariableEntry::wait`].
//! 4. Re-take the lock and re-check the condition.
//!
//! An entry taken before the lock is dropped observes every notification
//! issued after it, so no wakeup is lost between steps 2 and 3. Wakeups
//! may be spurious; callers always re-check.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::kern::thread::thread_yield;

/// Result of a wait operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A notification arrived
    Normal,
    /// The variable was notified before the wait began
    AlreadyNotified,
}

/// Event that threads can wait on
#[derive(Debug)]
pub struct ConditionVariable {
    /// Bumped by every notification
    sequence: AtomicU64,
    /// Threads currently between `add` and the end of `wait`
    waiters: AtomicU32,
    name: &'static str,
}

impl ConditionVariable {
    /// Create a new condition variable
    pub const fn new(name: &'static str) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            waiters: AtomicU32::new(0),
            name,
        }
    }

    /// Register interest in the next notification
    pub fn add(&self) -> ConditionVariableEntry<'_> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        ConditionVariableEntry {
            variable: self,
            sequence: self.sequence.load(Ordering::Acquire),
        }
    }

    /// Wake every thread waiting on this variable
    pub fn notify_all(&self) {
        self.sequence.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of registered waiters
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Name (for debugging)
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A registered waiter on a [`ConditionVariable`]
pub struct ConditionVariableEntry<'a> {
    variable: &'a ConditionVariable,
    sequence: u64,
}

impl ConditionVariableEntry<'_> {
    /// Block until a notification newer than this entry arrives
    pub fn wait(self) -> WaitResult {
        if self.notified() {
            return WaitResult::AlreadyNotified;
        }
        while !self.notified() {
            thread_yield();
        }
        WaitResult::Normal
    }

    fn notified(&self) -> bool {
        self.variable.sequence.load(Ordering::Acquire) != self.sequence
    }
}

impl Drop for ConditionVariableEntry<'_> {
    fn drop(&mut self) {
        self.variable.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
