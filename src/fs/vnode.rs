//! Vnodes
//!
//! A vnode is the VFS handle for one file, independent of any descriptor.
//! Filesystems plug in through [`VnodeOps`]; the VM layer only uses the
//! page I/O entry points and the reference count.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::Result;
use crate::types::VnodeId;

/// Filesystem private per-open state
pub type Cookie = usize;

/// Filesystem hooks behind a vnode
pub trait VnodeOps: Send + Sync {
    /// Scatter `vecs` from the file starting at `offset`
    fn read_page(&self, vnode: &Vnode, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize>;

    /// Gather `vecs` into the file starting at `offset`
    fn write_page(&self, vnode: &Vnode, offset: u64, vecs: &[&[u8]]) -> Result<usize>;

    /// Read through an open cookie
    fn read(&self, vnode: &Vnode, cookie: Cookie, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write through an open cookie
    fn write(&self, vnode: &Vnode, cookie: Cookie, pos: u64, data: &[u8]) -> Result<usize>;

    /// Flush file data
    fn fsync(&self, _vnode: &Vnode) -> Result<()> {
        Ok(())
    }

    /// Last descriptor using `cookie` was closed
    fn close(&self, _vnode: &Vnode, _cookie: Cookie) -> Result<()> {
        Ok(())
    }

    /// Release `cookie`
    fn free_cookie(&self, _vnode: &Vnode, _cookie: Cookie) {}

    /// Current file size
    fn size(&self, vnode: &Vnode) -> u64;
}

/// VFS node
pub struct Vnode {
    id: VnodeId,
    ref_count: AtomicU32,
    ops: Arc<dyn VnodeOps>,
}

impl Vnode {
    /// Create an unreferenced vnode
    pub fn new(ops: Arc<dyn VnodeOps>) -> Arc<Self> {
        Arc::new(Self {
            id: VnodeId::new(),
            ref_count: AtomicU32::new(0),
            ops,
        })
    }

    pub fn id(&self) -> VnodeId {
        self.id
    }

    /// Outstanding VFS references
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn ops(&self) -> &dyn VnodeOps {
        &*self.ops
    }

    pub fn size(&self) -> u64 {
        self.ops.size(self)
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Read page-sized vectors from `vnode`
pub fn vfs_readpage(vnode: &Vnode, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize> {
    vnode.ops.read_page(vnode, offset, vecs)
}

/// Write page-sized vectors to `vnode`
pub fn vfs_writepage(vnode: &Vnode, offset: u64, vecs: &[&[u8]]) -> Result<usize> {
    vnode.ops.write_page(vnode, offset, vecs)
}

/// Take a reference on `vnode`
pub fn vfs_vnode_acquire_ref(vnode: &Vnode) {
    vnode.ref_count.fetch_add(1, Ordering::AcqRel);
}

/// Drop a reference taken with [`vfs_vnode_acquire_ref`]
///
/// Releasing an unreferenced vnode is a kernel bug and panics.
pub fn vfs_vnode_release_ref(vnode: &Vnode) {
    let previous = vnode
        .ref_count
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    match previous {
        Ok(1) => log::trace!("vnode {} unused", vnode.id.0),
        Ok(_) => {}
        Err(_) => panic!("vfs_vnode_release_ref: vnode {} has no references", vnode.id.0),
    }
}

/// Helper for filesystems: total length of an I/O vector list
pub fn iovec_len(vecs: &[&[u8]]) -> usize {
    vecs.iter().map(|v| v.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFile;

    #[test]
    fn test_vnode_refs() {
        let vnode = Vnode::new(RamFile::new());
        assert_eq!(vnode.ref_count(), 0);
        vfs_vnode_acquire_ref(&vnode);
        vfs_vnode_acquire_ref(&vnode);
        assert_eq!(vnode.ref_count(), 2);
        vfs_vnode_release_ref(&vnode);
        vfs_vnode_release_ref(&vnode);
        assert_eq!(vnode.ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "has no references")]
    fn test_release_unreferenced_panics() {
        let vnode = Vnode::new(RamFile::new());
        vfs_vnode_release_ref(&vnode);
    }

    #[test]
    fn test_page_io_goes_through_ops() {
        let vnode = Vnode::new(RamFile::new());
        let data = [7u8; 16];
        assert_eq!(vfs_writepage(&vnode, 4, &[&data[..8], &data[8..]]), Ok(16));
        assert_eq!(vnode.size(), 20);

        let mut a = [0u8; 4];
        let mut b = [0u8; 16];
        assert_eq!(vfs_readpage(&vnode, 0, &mut [&mut a[..], &mut b[..]]), Ok(20));
        assert_eq!(a, [0, 0, 0, 0]);
        assert_eq!(b, [7; 16]);
    }

    #[test]
    fn test_iovec_len() {
        assert_eq!(iovec_len(&[&b"ab"[..], &b"cde"[..]]), 5);
        assert_eq!(iovec_len(&[]), 0);
    }
}
