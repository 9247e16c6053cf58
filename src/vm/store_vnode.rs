//! Vnode-backed store
//!
//! The file is the backing store: commitment needs no memory reservation
//! and page I/O goes straight to the VFS.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::fs::vnode::{
    vfs_readpage, vfs_vnode_acquire_ref, vfs_vnode_release_ref, vfs_writepage, Vnode,
};
use crate::vm::store::Store;

#[derive(Debug)]
pub struct VnodeStore {
    vnode: Arc<Vnode>,
    committed: AtomicU64,
}

impl VnodeStore {
    pub fn new(vnode: Arc<Vnode>) -> Self {
        Self {
            vnode,
            committed: AtomicU64::new(0),
        }
    }

    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }
}

impl Store for VnodeStore {
    fn committed_size(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn commit(&self, size: u64) -> Result<u64> {
        self.committed.store(size, Ordering::Release);
        Ok(size)
    }

    fn has_page(&self, _offset: u64) -> bool {
        true
    }

    fn read(&self, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize> {
        vfs_readpage(&self.vnode, offset, vecs)
    }

    fn write(&self, offset: u64, vecs: &[&[u8]]) -> Result<usize> {
        vfs_writepage(&self.vnode, offset, vecs)
    }

    fn acquire_ref(&self) {
        vfs_vnode_acquire_ref(&self.vnode);
    }

    fn release_ref(&self) {
        vfs_vnode_release_ref(&self.vnode);
    }
}
