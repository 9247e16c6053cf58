//! Anonymous no-swap store
//!
//! Pages have no source other than the cache itself. Commitment is taken
//! from the system-wide accounting and handed back when the store is
//! destroyed.

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::error::Result;
use crate::vm::commit::Priority;
use crate::vm::store::Store;
use crate::vm::VmSystem;

pub struct AnonymousStore {
    system: Arc<VmSystem>,
    priority: Priority,
    committed: Mutex<u64>,
}

impl AnonymousStore {
    pub fn new(system: Arc<VmSystem>, priority: Priority) -> Self {
        Self {
            system,
            priority,
            committed: Mutex::new(0),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl Store for AnonymousStore {
    fn committed_size(&self) -> u64 {
        *self.committed.lock()
    }

    fn commit(&self, size: u64) -> Result<u64> {
        let mut committed = self.committed.lock();
        if size > *committed {
            self.system
                .commit
                .try_reserve(size - *committed, self.priority)?;
        } else {
            self.system.commit.unreserve(*committed - size);
        }
        log::trace!("anonymous store: commit {} -> {}", *committed, size);
        *committed = size;
        Ok(size)
    }

    fn has_page(&self, _offset: u64) -> bool {
        false
    }

    fn read(&self, offset: u64, _vecs: &mut [&mut [u8]]) -> Result<usize> {
        panic!("anonymous_read: store has no content to read at {:#x}", offset);
    }

    /// Nothing to persist; the page daemon must keep or discard the page.
    fn write(&self, _offset: u64, _vecs: &[&[u8]]) -> Result<usize> {
        Ok(0)
    }
}

impl Drop for AnonymousStore {
    fn drop(&mut self) {
        let committed = *self.committed.get_mut();
        if committed > 0 {
            self.system.commit.unreserve(committed);
        }
    }
}

impl fmt::Debug for AnonymousStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousStore")
            .field("priority", &self.priority)
            .field("committed", &self.committed_size())
            .finish()
    }
}
