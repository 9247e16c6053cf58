//! File descriptors and io_contexts
//!
//! A `FileDescriptor` bundles a vnode, an operation table and the
//! filesystem cookie. Two counts track it: `ref_count` for the table slots
//! and in-flight `get_fd` users, reaching zero exactly once to run `free`;
//! and `open_count` for table slots alone, running `close` when the last
//! slot lets go.
//!
//! An `IoContext` is the per-team descriptor table. Structural changes
//! happen under its mutex; descriptor counts are atomic so `get_fd` and
//! `put_fd` pairs need the table only for the lookup.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::{Mutex as SpinMutex, RwLock};

use crate::config::{KernelConfig, DEFAULT_FD_TABLE_SIZE, MAX_FD_TABLE_SIZE};
use crate::error::{Error, Result};
use crate::fs::vnode::{vfs_vnode_acquire_ref, vfs_vnode_release_ref, Cookie, Vnode};
use crate::kern::lock::Mutex;
use crate::kern::thread::current_thread;
use crate::types::ThreadId;

/// What a descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdType {
    File,
    Directory,
    Device,
}

/// File operation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Descriptor operation table
pub trait FdOps: Send + Sync {
    fn read(&self, _descriptor: &FileDescriptor, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(&self, _descriptor: &FileDescriptor, _pos: u64, _data: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Resolve `from` to an absolute position
    fn seek(&self, _descriptor: &FileDescriptor, _current: u64, _from: SeekFrom) -> Result<u64> {
        Err(Error::NotSupported)
    }

    fn fsync(&self, _descriptor: &FileDescriptor) -> Result<()> {
        Ok(())
    }

    /// Last table slot released the descriptor
    fn close(&self, _descriptor: &FileDescriptor) -> Result<()> {
        Ok(())
    }

    /// Last reference dropped
    fn free(&self, _descriptor: &FileDescriptor) {}
}

/// Operations for descriptors on vnodes
pub struct VnodeFdOps;

/// Shared operation table for vnode descriptors
pub static VNODE_FD_OPS: VnodeFdOps = VnodeFdOps;

impl VnodeFdOps {
    fn vnode(descriptor: &FileDescriptor) -> Result<&Arc<Vnode>> {
        descriptor.vnode.as_ref().ok_or(Error::BadFileDescriptor)
    }
}

impl FdOps for VnodeFdOps {
    fn read(&self, descriptor: &FileDescriptor, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let vnode = Self::vnode(descriptor)?;
        vnode.ops().read(vnode, descriptor.cookie, pos, buf)
    }

    fn write(&self, descriptor: &FileDescriptor, pos: u64, data: &[u8]) -> Result<usize> {
        let vnode = Self::vnode(descriptor)?;
        vnode.ops().write(vnode, descriptor.cookie, pos, data)
    }

    fn seek(&self, descriptor: &FileDescriptor, current: u64, from: SeekFrom) -> Result<u64> {
        let base = match from {
            SeekFrom::Start(pos) => return Ok(pos),
            SeekFrom::Current(delta) => (current, delta),
            SeekFrom::End(delta) => (Self::vnode(descriptor)?.size(), delta),
        };
        base.0
            .checked_add_signed(base.1)
            .ok_or(Error::InvalidArgument)
    }

    fn fsync(&self, descriptor: &FileDescriptor) -> Result<()> {
        let vnode = Self::vnode(descriptor)?;
        vnode.ops().fsync(vnode)
    }

    fn close(&self, descriptor: &FileDescriptor) -> Result<()> {
        let vnode = Self::vnode(descriptor)?;
        vnode.ops().close(vnode, descriptor.cookie)
    }

    fn free(&self, descriptor: &FileDescriptor) {
        if let Some(vnode) = &descriptor.vnode {
            vnode.ops().free_cookie(vnode, descriptor.cookie);
        }
    }
}

// ============================================================================
// File Descriptor
// ============================================================================

/// Reference-counted open file
pub struct FileDescriptor {
    pub fd_type: FdType,
    vnode: Option<Arc<Vnode>>,
    cookie: Cookie,
    ops: &'static dyn FdOps,
    pub open_mode: OpenMode,
    ref_count: AtomicI32,
    open_count: AtomicI32,
    pos: SpinMutex<u64>,
}

/// Create a descriptor holding one reference
///
/// The descriptor takes its own VFS reference on `vnode`.
pub fn alloc_fd(
    fd_type: FdType,
    vnode: Option<Arc<Vnode>>,
    cookie: Cookie,
    ops: &'static dyn FdOps,
    open_mode: OpenMode,
) -> Arc<FileDescriptor> {
    if let Some(vnode) = &vnode {
        vfs_vnode_acquire_ref(vnode);
    }
    Arc::new(FileDescriptor {
        fd_type,
        vnode,
        cookie,
        ops,
        open_mode,
        ref_count: AtomicI32::new(1),
        open_count: AtomicI32::new(0),
        pos: SpinMutex::new(0),
    })
}

/// Drop one descriptor reference; the last one frees it
pub fn put_fd(descriptor: Arc<FileDescriptor>) {
    let previous = descriptor.ref_count.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 {
        descriptor.ops.free(&descriptor);
        if let Some(vnode) = &descriptor.vnode {
            vfs_vnode_release_ref(vnode);
        }
    } else if previous <= 0 {
        panic!("put_fd: descriptor reference count underflow");
    }
}

impl FileDescriptor {
    pub fn vnode(&self) -> Option<&Arc<Vnode>> {
        self.vnode.as_ref()
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> i32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn position(&self) -> u64 {
        *self.pos.lock()
    }

    fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one table slot; the last one runs `close`
    fn close_slot(&self) -> Result<()> {
        if self.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ops.close(self)
        } else {
            Ok(())
        }
    }

    /// Read at the current position and advance it
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.open_mode.can_read() {
            return Err(Error::BadFileDescriptor);
        }
        let mut pos = self.pos.lock();
        let count = self.ops.read(self, *pos, buf)?;
        *pos += count as u64;
        Ok(count)
    }

    /// Write at the current position (end of file when appending)
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.open_mode.can_write() {
            return Err(Error::BadFileDescriptor);
        }
        let mut pos = self.pos.lock();
        if self.open_mode == OpenMode::Append {
            *pos = self.ops.seek(self, *pos, SeekFrom::End(0))?;
        }
        let count = self.ops.write(self, *pos, data)?;
        *pos += count as u64;
        Ok(count)
    }

    /// Move the position
    pub fn seek(&self, from: SeekFrom) -> Result<u64> {
        let mut pos = self.pos.lock();
        *pos = self.ops.seek(self, *pos, from)?;
        Ok(*pos)
    }

    pub fn fsync(&self) -> Result<()> {
        self.ops.fsync(self)
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("fd_type", &self.fd_type)
            .field("vnode", &self.vnode.as_ref().map(|v| v.id()))
            .field("open_mode", &self.open_mode)
            .field("ref_count", &self.ref_count())
            .field("open_count", &self.open_count())
            .finish()
    }
}

// ============================================================================
// IO Context
// ============================================================================

struct FdTable {
    cwd: Option<Arc<Vnode>>,
    fds: Vec<Option<Arc<FileDescriptor>>>,
    close_on_exec: Vec<bool>,
    used_count: usize,
}

impl FdTable {
    fn slot(&self, fd: usize) -> Result<&Arc<FileDescriptor>> {
        self.fds
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(Error::BadFileDescriptor)
    }
}

/// Per-team descriptor table
pub struct IoContext {
    table: Mutex<FdTable>,
    max_table_size: usize,
}

impl IoContext {
    /// Create a context, inheriting cwd and descriptors from `parent`
    ///
    /// With `purge_close_on_exec` the parent's close-on-exec descriptors
    /// are left behind.
    pub fn new(parent: Option<&IoContext>, purge_close_on_exec: bool) -> Self {
        let size = parent.map_or(DEFAULT_FD_TABLE_SIZE, IoContext::table_size);
        Self::with_table_size(parent, purge_close_on_exec, size, MAX_FD_TABLE_SIZE)
    }

    /// Create a context with an explicit table size
    pub fn with_table_size(
        parent: Option<&IoContext>,
        purge_close_on_exec: bool,
        table_size: usize,
        max_table_size: usize,
    ) -> Self {
        let mut table = FdTable {
            cwd: None,
            fds: vec![None; table_size],
            close_on_exec: vec![false; table_size],
            used_count: 0,
        };

        if let Some(parent) = parent {
            let parent = parent.table.lock();
            if let Some(cwd) = &parent.cwd {
                vfs_vnode_acquire_ref(cwd);
                table.cwd = Some(cwd.clone());
            }
            let limit = table_size.min(parent.fds.len());
            for fd in 0..limit {
                let Some(descriptor) = &parent.fds[fd] else { continue };
                let close_on_exec = parent.close_on_exec[fd];
                if purge_close_on_exec && close_on_exec {
                    continue;
                }
                descriptor.acquire();
                descriptor.open();
                table.fds[fd] = Some(descriptor.clone());
                table.close_on_exec[fd] = close_on_exec;
                table.used_count += 1;
            }
        }

        Self {
            table: Mutex::new("io_context", table),
            max_table_size,
        }
    }

    /// Install `descriptor` in the lowest free slot
    pub fn new_fd(&self, descriptor: Arc<FileDescriptor>) -> Result<usize> {
        self.new_fd_at(descriptor, 0)
    }

    /// Install `descriptor` in the lowest free slot at or above `first_index`
    ///
    /// The table takes over the caller's reference. On failure nothing
    /// changes and a caller that passed a clone still owns its reference.
    pub fn new_fd_at(&self, descriptor: Arc<FileDescriptor>, first_index: usize) -> Result<usize> {
        let mut table = self.table.lock();
        if first_index >= table.fds.len() {
            return Err(Error::InvalidArgument);
        }
        let fd = (first_index..table.fds.len())
            .find(|&fd| table.fds[fd].is_none())
            .ok_or(Error::TableFull)?;

        descriptor.open();
        table.fds[fd] = Some(descriptor);
        table.close_on_exec[fd] = false;
        table.used_count += 1;
        Ok(fd)
    }

    /// Look up `fd`, taking a reference the caller returns with `put_fd`
    pub fn get_fd(&self, fd: usize) -> Result<Arc<FileDescriptor>> {
        let table = self.table.lock();
        let descriptor = table.slot(fd)?;
        descriptor.acquire();
        Ok(descriptor.clone())
    }

    /// Clear slot `fd`, handing its reference to the caller
    pub fn remove_fd(&self, fd: usize) -> Result<Arc<FileDescriptor>> {
        let mut table = self.table.lock();
        table.slot(fd)?;
        let descriptor = table.fds[fd].take().ok_or(Error::BadFileDescriptor)?;
        table.close_on_exec[fd] = false;
        table.used_count -= 1;
        Ok(descriptor)
    }

    /// Remove `fd`, close it if it was the last slot, drop the reference
    pub fn close_fd(&self, fd: usize) -> Result<()> {
        let descriptor = self.remove_fd(fd)?;
        let result = descriptor.close_slot();
        put_fd(descriptor);
        result
    }

    /// Duplicate `fd` into the lowest free slot
    pub fn dup(&self, fd: usize) -> Result<usize> {
        let descriptor = self.get_fd(fd)?;
        match self.new_fd(descriptor.clone()) {
            Ok(new) => Ok(new),
            Err(error) => {
                put_fd(descriptor);
                Err(error)
            }
        }
    }

    /// Make `new_fd` refer to the same descriptor as `old_fd`
    ///
    /// Whatever `new_fd` held before is closed.
    pub fn dup2(&self, old_fd: usize, new_fd: usize) -> Result<usize> {
        let evicted = {
            let mut table = self.table.lock();
            let descriptor = table.slot(old_fd)?.clone();
            if new_fd >= table.fds.len() {
                return Err(Error::BadFileDescriptor);
            }
            if old_fd == new_fd {
                return Ok(new_fd);
            }

            descriptor.acquire();
            descriptor.open();
            let evicted = table.fds[new_fd].replace(descriptor);
            if evicted.is_none() {
                table.used_count += 1;
            }
            table.close_on_exec[new_fd] = false;
            evicted
        };

        if let Some(evicted) = evicted {
            if let Err(error) = evicted.close_slot() {
                log::warn!("dup2: closing replaced fd {} failed: {}", new_fd, error);
            }
            put_fd(evicted);
        }
        Ok(new_fd)
    }

    pub fn set_close_on_exec(&self, fd: usize, close_on_exec: bool) -> Result<()> {
        let mut table = self.table.lock();
        table.slot(fd)?;
        table.close_on_exec[fd] = close_on_exec;
        Ok(())
    }

    pub fn close_on_exec(&self, fd: usize) -> Result<bool> {
        let table = self.table.lock();
        table.slot(fd)?;
        Ok(table.close_on_exec[fd])
    }

    /// Change the number of descriptor slots
    ///
    /// Shrinking fails with `Busy` if a slot being dropped is in use.
    pub fn resize_fd_table(&self, new_size: usize) -> Result<()> {
        if new_size == 0 || new_size > self.max_table_size {
            return Err(Error::InvalidArgument);
        }
        let mut table = self.table.lock();
        if new_size < table.fds.len() && table.fds[new_size..].iter().any(Option::is_some) {
            return Err(Error::Busy);
        }
        table.fds.resize(new_size, None);
        table.close_on_exec.resize(new_size, false);
        Ok(())
    }

    pub fn table_size(&self) -> usize {
        self.table.lock().fds.len()
    }

    pub fn used_count(&self) -> usize {
        self.table.lock().used_count
    }

    /// The vnode behind `fd`
    pub fn get_vnode_from_fd(&self, fd: usize) -> Result<Arc<Vnode>> {
        let descriptor = self.get_fd(fd)?;
        let vnode = descriptor.vnode.clone();
        put_fd(descriptor);
        vnode.ok_or(Error::BadFileDescriptor)
    }

    /// Replace the working directory
    pub fn set_cwd(&self, vnode: Option<Arc<Vnode>>) {
        if let Some(vnode) = &vnode {
            vfs_vnode_acquire_ref(vnode);
        }
        let old = core::mem::replace(&mut self.table.lock().cwd, vnode);
        if let Some(old) = old {
            vfs_vnode_release_ref(&old);
        }
    }

    pub fn cwd(&self) -> Option<Arc<Vnode>> {
        self.table.lock().cwd.clone()
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        let mut closed = 0;
        for descriptor in table.fds.iter_mut().filter_map(Option::take) {
            if let Err(error) = descriptor.close_slot() {
                log::warn!("io_context teardown: close failed: {}", error);
            }
            put_fd(descriptor);
            closed += 1;
        }
        if let Some(cwd) = table.cwd.take() {
            vfs_vnode_release_ref(&cwd);
        }
        log::debug!("io_context destroyed, {} descriptors closed", closed);
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("table_size", &self.table_size())
            .field("used_count", &self.used_count())
            .finish()
    }
}

// ============================================================================
// Team Binding
// ============================================================================

static KERNEL_IO_CONTEXT: spin::Once<Arc<IoContext>> = spin::Once::new();
static THREAD_CONTEXTS: RwLock<BTreeMap<ThreadId, Arc<IoContext>>> = RwLock::new(BTreeMap::new());

/// Create the kernel io_context
pub fn init(config: &KernelConfig) {
    KERNEL_IO_CONTEXT.call_once(|| {
        Arc::new(IoContext::with_table_size(
            None,
            false,
            config.fd_table_size,
            config.max_fd_table_size,
        ))
    });
}

/// The kernel's io_context, once initialized
pub fn kernel_io_context() -> Option<Arc<IoContext>> {
    KERNEL_IO_CONTEXT.get().cloned()
}

/// Attach `context` to `thread` as its team's io_context
pub fn bind_thread_io_context(thread: ThreadId, context: Arc<IoContext>) {
    THREAD_CONTEXTS.write().insert(thread, context);
}

/// Detach `thread` from its team's io_context
pub fn unbind_thread_io_context(thread: ThreadId) -> Option<Arc<IoContext>> {
    THREAD_CONTEXTS.write().remove(&thread)
}

/// The kernel's io_context, or the calling thread's team context
pub fn get_current_io_context(kernel: bool) -> Option<Arc<IoContext>> {
    if !kernel {
        if let Some(context) = THREAD_CONTEXTS.read().get(&current_thread()) {
            return Some(context.clone());
        }
    }
    kernel_io_context()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFile;
    use core::sync::atomic::AtomicUsize;

    struct CountingOps {
        closes: AtomicUsize,
        frees: AtomicUsize,
    }

    impl FdOps for CountingOps {
        fn close(&self, _descriptor: &FileDescriptor) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn free(&self, _descriptor: &FileDescriptor) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_ops() -> &'static CountingOps {
        Box::leak(Box::new(CountingOps {
            closes: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }))
    }

    fn context(size: usize) -> IoContext {
        IoContext::with_table_size(None, false, size, 16)
    }

    fn file_fd(vnode: &Arc<Vnode>) -> Arc<FileDescriptor> {
        alloc_fd(FdType::File, Some(vnode.clone()), 0, &VNODE_FD_OPS, OpenMode::ReadWrite)
    }

    #[test]
    fn test_new_get_put_close() {
        let ops = counting_ops();
        let ctx = context(4);
        let fd = ctx
            .new_fd(alloc_fd(FdType::Device, None, 0, ops, OpenMode::Read))
            .unwrap();
        assert_eq!(fd, 0);
        assert_eq!(ctx.used_count(), 1);

        let descriptor = ctx.get_fd(fd).unwrap();
        assert_eq!(descriptor.ref_count(), 2);
        put_fd(descriptor);

        ctx.close_fd(fd).unwrap();
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ops.frees.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.used_count(), 0);
        assert_eq!(ctx.get_fd(fd).map(|d| d.ref_count()), Err(Error::BadFileDescriptor));
    }

    #[test]
    fn test_free_waits_for_outstanding_get() {
        let ops = counting_ops();
        let ctx = context(4);
        let fd = ctx
            .new_fd(alloc_fd(FdType::Device, None, 0, ops, OpenMode::Read))
            .unwrap();
        let held = ctx.get_fd(fd).unwrap();
        ctx.close_fd(fd).unwrap();
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ops.frees.load(Ordering::SeqCst), 0);
        put_fd(held);
        assert_eq!(ops.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_full_and_first_index() {
        let ctx = context(2);
        let vnode = Vnode::new(RamFile::new());
        assert_eq!(ctx.new_fd_at(file_fd(&vnode), 1), Ok(1));
        assert_eq!(ctx.new_fd(file_fd(&vnode)), Ok(0));

        let extra = file_fd(&vnode);
        assert_eq!(ctx.new_fd(extra.clone()), Err(Error::TableFull));
        assert_eq!(ctx.new_fd_at(extra.clone(), 5), Err(Error::InvalidArgument));
        put_fd(extra);
        assert_eq!(vnode.ref_count(), 2);
    }

    #[test]
    fn test_dup_and_dup2() {
        let ops = counting_ops();
        let ctx = context(8);
        let a = ctx
            .new_fd(alloc_fd(FdType::Device, None, 1, ops, OpenMode::Read))
            .unwrap();
        let b = ctx
            .new_fd(alloc_fd(FdType::Device, None, 2, ops, OpenMode::Read))
            .unwrap();

        let c = ctx.dup(a).unwrap();
        assert_eq!(c, 2);
        assert_eq!(ctx.get_fd(c).map(|d| {
            let cookie = d.cookie();
            put_fd(d);
            cookie
        }), Ok(1));

        // b's only slot is replaced, so its descriptor closes and frees
        assert_eq!(ctx.dup2(a, b), Ok(b));
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ops.frees.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.used_count(), 3);

        assert_eq!(ctx.dup2(a, a), Ok(a));
        assert_eq!(ctx.dup2(7, 1), Err(Error::BadFileDescriptor));
        assert_eq!(ctx.dup2(a, 8), Err(Error::BadFileDescriptor));

        ctx.close_fd(a).unwrap();
        ctx.close_fd(b).unwrap();
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        ctx.close_fd(c).unwrap();
        assert_eq!(ops.closes.load(Ordering::SeqCst), 2);
        assert_eq!(ops.frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resize_table() {
        let ctx = context(4);
        let vnode = Vnode::new(RamFile::new());
        ctx.new_fd_at(file_fd(&vnode), 3).unwrap();

        assert_eq!(ctx.resize_fd_table(2), Err(Error::Busy));
        assert_eq!(ctx.resize_fd_table(17), Err(Error::InvalidArgument));
        ctx.resize_fd_table(16).unwrap();
        assert_eq!(ctx.table_size(), 16);

        ctx.close_fd(3).unwrap();
        ctx.resize_fd_table(2).unwrap();
        assert_eq!(ctx.table_size(), 2);
    }

    #[test]
    fn test_inherit_and_purge_close_on_exec() {
        let vnode = Vnode::new(RamFile::new());
        let parent = context(4);
        parent.set_cwd(Some(vnode.clone()));
        let keep = parent.new_fd(file_fd(&vnode)).unwrap();
        let purge = parent.new_fd(file_fd(&vnode)).unwrap();
        parent.set_close_on_exec(purge, true).unwrap();
        assert_eq!(vnode.ref_count(), 3);

        let child = IoContext::new(Some(&parent), true);
        assert_eq!(child.table_size(), 4);
        assert_eq!(child.used_count(), 1);
        assert!(child.get_vnode_from_fd(keep).is_ok());
        assert_eq!(child.get_fd(purge).map(|d| d.ref_count()), Err(Error::BadFileDescriptor));
        assert!(Arc::ptr_eq(&child.cwd().unwrap(), &vnode));
        assert_eq!(vnode.ref_count(), 4);

        let forked = IoContext::new(Some(&parent), false);
        assert_eq!(forked.used_count(), 2);
        assert_eq!(forked.close_on_exec(purge), Ok(true));

        drop(forked);
        drop(child);
        drop(parent);
        assert_eq!(vnode.ref_count(), 0);
    }

    #[test]
    fn test_descriptor_io() {
        let file = RamFile::new();
        let vnode = Vnode::new(file.clone());
        let ctx = context(4);
        let fd = ctx.new_fd(file_fd(&vnode)).unwrap();

        let descriptor = ctx.get_fd(fd).unwrap();
        assert_eq!(descriptor.write(b"hello world"), Ok(11));
        assert_eq!(descriptor.seek(SeekFrom::Start(6)), Ok(6));
        let mut buf = [0u8; 5];
        assert_eq!(descriptor.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"world");
        assert_eq!(descriptor.seek(SeekFrom::End(-5)), Ok(6));
        assert_eq!(descriptor.seek(SeekFrom::Current(-7)), Err(Error::InvalidArgument));
        assert!(descriptor.fsync().is_ok());
        put_fd(descriptor);

        let read_only = alloc_fd(FdType::File, Some(vnode.clone()), 0, &VNODE_FD_OPS, OpenMode::Read);
        assert_eq!(read_only.write(b"x"), Err(Error::BadFileDescriptor));
        put_fd(read_only);
        assert_eq!(file.contents(), b"hello world");
    }

    #[test]
    fn test_append_mode() {
        let file = RamFile::with_contents(b"abc");
        let vnode = Vnode::new(file.clone());
        let descriptor = alloc_fd(FdType::File, Some(vnode), 0, &VNODE_FD_OPS, OpenMode::Append);
        descriptor.write(b"def").unwrap();
        assert_eq!(file.contents(), b"abcdef");
        assert_eq!(descriptor.position(), 6);
        put_fd(descriptor);
    }

    #[test]
    fn test_current_context_binding() {
        init(&KernelConfig::default());
        let kernel = kernel_io_context().unwrap();
        assert!(Arc::ptr_eq(&get_current_io_context(false).unwrap(), &kernel));

        let team = Arc::new(context(4));
        bind_thread_io_context(current_thread(), team.clone());
        assert!(Arc::ptr_eq(&get_current_io_context(false).unwrap(), &team));
        assert!(Arc::ptr_eq(&get_current_io_context(true).unwrap(), &kernel));

        assert!(unbind_thread_io_context(current_thread()).is_some());
        assert!(Arc::ptr_eq(&get_current_io_context(false).unwrap(), &kernel));
    }
}
