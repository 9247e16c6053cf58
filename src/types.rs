//! Common types used across the crate
//!
//! This module defines shared identifiers to avoid circular dependencies.

use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Thread that runs kernel startup
    pub const BOOT: Self = Self(1);

    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(2);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Team (process) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(pub u64);

impl TeamId {
    /// The kernel team
    pub const KERNEL: Self = Self(0);

    /// Create a new team ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TeamId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Vnode identifier, unique for the lifetime of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VnodeId(pub u64);

impl VnodeId {
    /// Create a new vnode ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        VnodeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// VM cache identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmCacheId(pub u64);

impl VmCacheId {
    /// Create a new cache ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        VmCacheId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
