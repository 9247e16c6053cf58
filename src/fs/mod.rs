//! Filesystem layer
//!
//! Vnodes, the RAM filesystem and per-team descriptor tables.

pub mod fd;
pub mod ramfs;
pub mod vnode;

pub use fd::{
    alloc_fd, get_current_io_context, put_fd, FdOps, FdType, FileDescriptor, IoContext,
    OpenMode, SeekFrom, VNODE_FD_OPS,
};
pub use vnode::{Vnode, VnodeOps};

use crate::config::KernelConfig;

/// Initialize the filesystem layer
pub fn init(config: &KernelConfig) {
    fd::init(config);
}
