//! Kernel configuration
//!
//! Sizing for the page pool, committed-memory accounting, descriptor
//! tables and the DPC callback pool. A `KernelConfig` is handed to
//! [`crate::init`]; individual subsystems can also be built directly from
//! one for tests.

use crate::error::{Error, Result};
use crate::vm::vm_page::PAGE_SIZE;

/// Default number of descriptor slots in a fresh io_context
pub const DEFAULT_FD_TABLE_SIZE: usize = 128;

/// Upper bound for a resized descriptor table
pub const MAX_FD_TABLE_SIZE: usize = 8192;

/// Recyclable function callbacks owned by each DPC queue
pub const DEFAULT_FUNCTION_CALLBACKS: usize = 64;

/// Buckets in the vnode cache registry (power of two)
pub const DEFAULT_VNODE_CACHE_BUCKETS: usize = 64;

/// Default physical page pool size (4 MiB)
pub const DEFAULT_PAGE_COUNT: usize = 1024;

/// Memory the user priority may not dip into
pub const VM_MEMORY_RESERVE_USER: u64 = 16 * PAGE_SIZE as u64;

/// Memory the system priority may not dip into
pub const VM_MEMORY_RESERVE_SYSTEM: u64 = 4 * PAGE_SIZE as u64;

/// Kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Physical pages in the global page pool
    pub page_count: usize,
    /// Bytes available to committed-memory reservations
    pub available_memory: u64,
    /// Untouchable reserve per priority (user, system, VIP)
    pub memory_reserve: [u64; 3],
    /// Initial descriptor table size
    pub fd_table_size: usize,
    /// Largest descriptor table a context may grow to
    pub max_fd_table_size: usize,
    /// Function callbacks pre-allocated per DPC queue
    pub dpc_function_callbacks: usize,
    /// Bucket count of the vnode cache registry
    pub vnode_cache_buckets: usize,
    /// Console log level
    pub log_level: log::LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            page_count: DEFAULT_PAGE_COUNT,
            available_memory: (DEFAULT_PAGE_COUNT * PAGE_SIZE) as u64,
            memory_reserve: [VM_MEMORY_RESERVE_USER, VM_MEMORY_RESERVE_SYSTEM, 0],
            fd_table_size: DEFAULT_FD_TABLE_SIZE,
            max_fd_table_size: MAX_FD_TABLE_SIZE,
            dpc_function_callbacks: DEFAULT_FUNCTION_CALLBACKS,
            vnode_cache_buckets: DEFAULT_VNODE_CACHE_BUCKETS,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// Check that the configuration describes a usable kernel
    pub fn validate(&self) -> Result<()> {
        if self.page_count == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.fd_table_size == 0
            || self.max_fd_table_size > MAX_FD_TABLE_SIZE
            || self.fd_table_size > self.max_fd_table_size
        {
            return Err(Error::InvalidArgument);
        }
        if self.dpc_function_callbacks == 0 {
            return Err(Error::InvalidArgument);
        }
        if !self.vnode_cache_buckets.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}
