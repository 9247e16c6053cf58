//! Page Stores
//!
//! A store decides where a cache's page contents come from and where they
//! go when written back. Each cache owns exactly one store.

use crate::error::Result;
use crate::vm::store_anonymous::AnonymousStore;
use crate::vm::store_vnode::VnodeStore;

/// Backing-store capability
pub trait Store: Send + Sync {
    /// Bytes guaranteed to have backing
    fn committed_size(&self) -> u64;

    /// Grow or shrink the commitment to `size`, returning the new size
    fn commit(&self, size: u64) -> Result<u64>;

    /// Can the store produce the page at `offset`?
    fn has_page(&self, offset: u64) -> bool;

    /// Fill `vecs` with content starting at `offset`
    fn read(&self, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize>;

    /// Persist `vecs` starting at `offset`
    fn write(&self, offset: u64, vecs: &[&[u8]]) -> Result<usize>;

    /// Resolve a fault at `offset` without the cache
    ///
    /// `None` means the store has no fault handler.
    fn fault(&self, _offset: u64) -> Option<Result<()>> {
        None
    }

    fn acquire_ref(&self) {}

    fn release_ref(&self) {}
}

/// The store variants a cache can own
#[derive(Debug)]
pub enum VmStore {
    /// Ephemeral memory that is never swapped
    AnonymousNoSwap(AnonymousStore),
    /// Pages round-trip to a file
    Vnode(VnodeStore),
}

impl VmStore {
    fn inner(&self) -> &dyn Store {
        match self {
            VmStore::AnonymousNoSwap(store) => store,
            VmStore::Vnode(store) => store,
        }
    }

    /// Is this the anonymous variant?
    pub fn is_anonymous(&self) -> bool {
        matches!(self, VmStore::AnonymousNoSwap(_))
    }
}

impl Store for VmStore {
    fn committed_size(&self) -> u64 {
        self.inner().committed_size()
    }

    fn commit(&self, size: u64) -> Result<u64> {
        self.inner().commit(size)
    }

    fn has_page(&self, offset: u64) -> bool {
        self.inner().has_page(offset)
    }

    fn read(&self, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize> {
        self.inner().read(offset, vecs)
    }

    fn write(&self, offset: u64, vecs: &[&[u8]]) -> Result<usize> {
        self.inner().write(offset, vecs)
    }

    fn fault(&self, offset: u64) -> Option<Result<()>> {
        self.inner().fault(offset)
    }

    fn acquire_ref(&self) {
        self.inner().acquire_ref()
    }

    fn release_ref(&self) {
        self.inner().release_ref()
    }
}

impl From<AnonymousStore> for VmStore {
    fn from(store: AnonymousStore) -> Self {
        VmStore::AnonymousNoSwap(store)
    }
}

impl From<VnodeStore> for VmStore {
    fn from(store: VnodeStore) -> Self {
        VmStore::Vnode(store)
    }
}
