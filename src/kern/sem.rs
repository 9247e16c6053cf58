//! Counting semaphore
//!
//! The blocking half of the kernel locks. A thread that cannot take a
//! unit spins briefly and then yields until another thread releases one.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::kern::thread::thread_yield;

/// Spins before a waiting thread starts yielding
const SPIN_LIMIT: u32 = 64;

/// A counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    count: AtomicI32,
    name: &'static str,
}

impl Semaphore {
    /// Create a semaphore holding `count` units
    pub const fn new(name: &'static str, count: i32) -> Self {
        Self {
            count: AtomicI32::new(count),
            name,
        }
    }

    /// Take one unit, blocking until one is available
    pub fn acquire(&self) {
        let mut spins = 0;
        while !self.try_acquire() {
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                thread_yield();
            }
        }
    }

    /// Take one unit if available
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.load(Ordering::Relaxed);
        while count > 0 {
            match self.count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
        false
    }

    /// Return `units` to the semaphore; each admits exactly one acquirer
    pub fn release(&self, units: i32) {
        debug_assert!(units > 0, "semaphore {}: bad release count", self.name);
        self.count.fetch_add(units, Ordering::Release);
    }

    /// Units currently available
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Semaphore name (for debugging)
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn test_try_acquire_counts_down() {
        let sem = Semaphore::new("test", 2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release(1);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new("handoff", 0));
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.acquire())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!waiter.is_finished());

        sem.release(1);
        waiter.join().unwrap();
        assert_eq!(sem.count(), 0);
    }
}
