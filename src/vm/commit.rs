//! Committed Memory Accounting
//!
//! Tracks how much memory has been promised to stores. A reservation at a
//! given priority must leave that priority's reserve untouched, so user
//! allocations fail before system ones and VIP requests can drain the pool.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Allocation priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum Priority {
    /// Ordinary team allocations
    User = 0,
    /// Kernel allocations
    System = 1,
    /// Allocations that must not fail while anything is left
    Vip = 2,
}

impl Priority {
    /// Index into a per-priority reserve table
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// System-wide committed-memory counter
#[derive(Debug)]
pub struct CommitAccounting {
    /// Bytes not yet promised to anyone
    available: AtomicU64,
    /// Total bytes this accounting started with
    total: u64,
    /// Bytes each priority must leave behind
    reserve: [u64; 3],
}

impl CommitAccounting {
    /// Create accounting for `available` bytes
    pub const fn new(available: u64, reserve: [u64; 3]) -> Self {
        Self {
            available: AtomicU64::new(available),
            total: available,
            reserve,
        }
    }

    /// Try to reserve `bytes`
    pub fn try_reserve(&self, bytes: u64, priority: Priority) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let minimum = self.reserve[priority.index()];

        let mut available = self.available.load(Ordering::Acquire);
        loop {
            if available < bytes.saturating_add(minimum) {
                log::warn!(
                    "vm_try_reserve_memory: {} bytes at {:?} denied ({} available)",
                    bytes,
                    priority,
                    available
                );
                return Err(Error::NoMemory);
            }
            match self.available.compare_exchange_weak(
                available,
                available - bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => available = current,
            }
        }
    }

    /// Return `bytes` to the pool
    pub fn unreserve(&self, bytes: u64) {
        let previous = self.available.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(
            previous + bytes <= self.total,
            "vm_unreserve_memory: more memory returned than reserved"
        );
    }

    /// Bytes still available
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Bytes currently promised
    pub fn reserved(&self) -> u64 {
        self.total - self.available()
    }

    /// Total accountable bytes
    pub fn total(&self) -> u64 {
        self.total
    }
}
