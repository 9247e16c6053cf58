//! RAM-backed files
//!
//! The simplest filesystem behind a vnode: file contents live in a
//! growable buffer. Used for the boot image and by the kernel tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::fs::vnode::{iovec_len, Cookie, Vnode, VnodeOps};

/// Status reported for writes to a read-only file
pub const EROFS: i32 = -30;

/// A file held entirely in memory
#[derive(Debug, Default)]
pub struct RamFile {
    data: Mutex<Vec<u8>>,
    read_only: AtomicBool,
    page_reads: AtomicUsize,
    page_writes: AtomicUsize,
}

impl RamFile {
    /// Create an empty file
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a file with initial contents
    pub fn with_contents(contents: &[u8]) -> Arc<Self> {
        let file = Self::default();
        file.data.lock().extend_from_slice(contents);
        Arc::new(file)
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Make writes fail with `EROFS`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Number of `read_page` calls served
    pub fn page_reads(&self) -> usize {
        self.page_reads.load(Ordering::Acquire)
    }

    /// Number of `write_page` calls served
    pub fn page_writes(&self) -> usize {
        self.page_writes.load(Ordering::Acquire)
    }

    /// Copy from `pos`, zero-filling past end of file
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let start = (pos as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        buf[count..].fill(0);
        count
    }

    fn write_at(&self, pos: u64, src: &[u8]) -> Result<usize> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::Io(EROFS));
        }
        let mut data = self.data.lock();
        let start = pos as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(src.len())
    }
}

impl VnodeOps for RamFile {
    fn read_page(&self, _vnode: &Vnode, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize> {
        self.page_reads.fetch_add(1, Ordering::AcqRel);
        let mut pos = offset;
        let mut total = 0;
        for vec in vecs.iter_mut() {
            total += self.read_at(pos, vec);
            pos += vec.len() as u64;
        }
        Ok(total)
    }

    fn write_page(&self, _vnode: &Vnode, offset: u64, vecs: &[&[u8]]) -> Result<usize> {
        self.page_writes.fetch_add(1, Ordering::AcqRel);
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::Io(EROFS));
        }
        let mut pos = offset;
        for vec in vecs {
            self.write_at(pos, vec)?;
            pos += vec.len() as u64;
        }
        Ok(iovec_len(vecs))
    }

    fn read(&self, _vnode: &Vnode, _cookie: Cookie, pos: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.read_at(pos, buf))
    }

    fn write(&self, _vnode: &Vnode, _cookie: Cookie, pos: u64, data: &[u8]) -> Result<usize> {
        self.write_at(pos, data)
    }

    fn size(&self, _vnode: &Vnode) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end_zero_fills() {
        let file = RamFile::with_contents(b"hello");
        let vnode = Vnode::new(file.clone());
        let mut buf = [0xffu8; 8];
        assert_eq!(file.read(&vnode, 0, 3, &mut buf), Ok(2));
        assert_eq!(&buf, b"lo\0\0\0\0\0\0");
        assert_eq!(file.read(&vnode, 0, 100, &mut buf), Ok(0));
    }

    #[test]
    fn test_write_extends_file() {
        let file = RamFile::new();
        let vnode = Vnode::new(file.clone());
        assert_eq!(file.write(&vnode, 0, 4, b"abc"), Ok(3));
        assert_eq!(file.contents(), b"\0\0\0\0abc");
        assert_eq!(vnode.size(), 7);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let file = RamFile::with_contents(b"x");
        let vnode = Vnode::new(file.clone());
        file.set_read_only(true);
        assert_eq!(
            file.write_page(&vnode, 0, &[&b"y"[..]]),
            Err(Error::Io(EROFS))
        );
        assert_eq!(file.page_writes(), 1);
        assert_eq!(file.contents(), b"x");
    }
}
