//! Kern subsystem - Core kernel primitives
//!
//! Thread substrate, blocking locks, the lock-free hash table and the
//! deferred procedure call queue.

pub mod atomic_hash;
pub mod dpc;
pub mod lock;
pub mod sched_prim;
pub mod sem;
pub mod thread;

pub use atomic_hash::{AtomicHashTable, HashDefinition};
pub use dpc::{DpcCallback, DpcQueue, SchedulerState};
pub use lock::{Mutex, MutexGuard, RawMutex, RecursiveLock, RecursiveLockGuard};
pub use sched_prim::{ConditionVariable, ConditionVariableEntry, WaitResult};
pub use sem::Semaphore;
pub use thread::{current_thread, spawn_kernel_thread, thread_yield};

use crate::config::KernelConfig;
use crate::error::Result;

/// Initialize the kern subsystem
pub fn init(config: &KernelConfig) -> Result<()> {
    dpc::init(config)?;
    log::debug!("kern: default dpc queue ready");
    Ok(())
}
