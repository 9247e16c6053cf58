//! Virtual memory: page pool, committed memory, stores and caches
//!
//! The global services (`CommitAccounting` and `PagePool`) are bundled in a
//! `VmSystem` that caches and stores hold a handle to. `init` installs the
//! kernel-wide instance; tests build their own.

pub mod cache_support;
pub mod commit;
pub mod store;
pub mod store_anonymous;
pub mod store_vnode;
pub mod vm_cache;
pub mod vm_page;
pub mod vnode_cache;

pub use cache_support::{
    cache_get_pages, cache_put_pages, cache_read, cache_write, cache_write_back,
    schedule_write_back, PageRun,
};
pub use commit::{CommitAccounting, Priority};
pub use store::{Store, VmStore};
pub use vm_cache::{CacheGuard, PageEvents, VmCache};
pub use vm_page::{PageFlags, PagePool, PageReservation, VmPage, PAGE_SIZE};
pub use vnode_cache::VnodeCacheTable;

use alloc::sync::Arc;

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::fs::fd::IoContext;
use vm_page::round_page;

/// Global VM services
pub struct VmSystem {
    pub commit: CommitAccounting,
    pub pages: PagePool,
}

impl VmSystem {
    /// Size the services from `config`
    pub fn new(config: &KernelConfig) -> Self {
        Self::with_limits(
            config.page_count,
            config.available_memory,
            config.memory_reserve,
        )
    }

    /// `page_count` frames, `available` committable bytes
    pub fn with_limits(page_count: usize, available: u64, reserve: [u64; 3]) -> Self {
        Self {
            commit: CommitAccounting::new(available, reserve),
            pages: PagePool::new(page_count),
        }
    }
}

// ============================================================================
// Global State
// ============================================================================

static VM_SYSTEM: spin::Once<Arc<VmSystem>> = spin::Once::new();
static VNODE_CACHES: spin::Once<VnodeCacheTable> = spin::Once::new();

/// Initialize the VM subsystem
pub fn init(config: &KernelConfig) {
    VM_SYSTEM.call_once(|| Arc::new(VmSystem::new(config)));
    VNODE_CACHES.call_once(|| VnodeCacheTable::new(config.vnode_cache_buckets));
}

/// The kernel-wide VM services
///
/// Falls back to the default configuration if `init` has not run.
pub fn system() -> Arc<VmSystem> {
    VM_SYSTEM
        .call_once(|| Arc::new(VmSystem::new(&KernelConfig::default())))
        .clone()
}

/// The kernel-wide vnode cache registry
pub fn vnode_caches() -> &'static VnodeCacheTable {
    VNODE_CACHES.call_once(|| VnodeCacheTable::new(crate::config::DEFAULT_VNODE_CACHE_BUCKETS))
}

// ============================================================================
// Mapping
// ============================================================================

/// Create an anonymous cache with `size` bytes committed
pub fn vm_create_anonymous_cache(
    system: &Arc<VmSystem>,
    size: u64,
    priority: Priority,
) -> Result<Arc<VmCache>> {
    let cache = VmCache::anonymous(system.clone(), priority);
    cache.commit(round_page(size))?;
    Ok(cache)
}

/// Map `[offset, offset + size)` of the file behind `fd`
///
/// All mappings of one vnode share its cache, which is committed to
/// cover the mapped range.
pub fn vm_map_file(
    system: &Arc<VmSystem>,
    registry: &VnodeCacheTable,
    context: &IoContext,
    fd: usize,
    offset: u64,
    size: u64,
) -> Result<Arc<VmCache>> {
    if size == 0 || offset % PAGE_SIZE as u64 != 0 {
        return Err(Error::InvalidArgument);
    }
    let end = offset.checked_add(size).ok_or(Error::InvalidArgument)?;

    let vnode = context.get_vnode_from_fd(fd)?;
    let cache = registry.get_or_create(system, &vnode);

    cache.commit_at_least(round_page(end))?;
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fd::{alloc_fd, FdType, OpenMode, VNODE_FD_OPS};
    use crate::fs::ramfs::RamFile;
    use crate::fs::vnode::Vnode;

    #[test]
    fn test_anonymous_cache_commits_rounded_size() {
        let system = Arc::new(VmSystem::with_limits(4, 16 * PAGE_SIZE as u64, [0; 3]));
        let cache = vm_create_anonymous_cache(&system, 100, Priority::User).unwrap();
        assert_eq!(cache.committed_size(), PAGE_SIZE as u64);
        assert_eq!(system.commit.available(), 15 * PAGE_SIZE as u64);

        assert_eq!(
            vm_create_anonymous_cache(&system, 16 * PAGE_SIZE as u64, Priority::User)
                .map(|c| c.committed_size()),
            Err(Error::NoMemory)
        );
        assert_eq!(system.commit.available(), 15 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_map_file_shares_cache() {
        let system = Arc::new(VmSystem::with_limits(4, 0, [0; 3]));
        let registry = VnodeCacheTable::new(8);
        let context = IoContext::with_table_size(None, false, 8, 8);
        let vnode = Vnode::new(RamFile::with_contents(b"mapped"));
        let fd = context
            .new_fd(alloc_fd(FdType::File, Some(vnode.clone()), 0, &VNODE_FD_OPS, OpenMode::ReadWrite))
            .unwrap();

        let a = vm_map_file(&system, &registry, &context, fd, 0, 10).unwrap();
        let b = vm_map_file(&system, &registry, &context, fd, PAGE_SIZE as u64, 10).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.committed_size(), 2 * PAGE_SIZE as u64);

        assert_eq!(
            vm_map_file(&system, &registry, &context, fd, 1, 10).map(|c| c.id()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            vm_map_file(&system, &registry, &context, 7, 0, 10).map(|c| c.id()),
            Err(Error::BadFileDescriptor)
        );
    }

    #[test]
    fn test_map_file_never_shrinks_commitment() {
        let system = Arc::new(VmSystem::with_limits(4, 0, [0; 3]));
        let registry = VnodeCacheTable::new(8);
        let context = IoContext::with_table_size(None, false, 8, 8);
        let vnode = Vnode::new(RamFile::new());
        let fd = context
            .new_fd(alloc_fd(FdType::File, Some(vnode), 0, &VNODE_FD_OPS, OpenMode::ReadWrite))
            .unwrap();

        let large = 64 * PAGE_SIZE as u64;
        std::thread::scope(|s| {
            for size in [large, PAGE_SIZE as u64, large, PAGE_SIZE as u64] {
                let (system, registry, context) = (&system, &registry, &context);
                s.spawn(move || {
                    vm_map_file(system, registry, context, fd, 0, size).unwrap();
                });
            }
        });

        let cache = vm_map_file(&system, &registry, &context, fd, 0, 10).unwrap();
        assert_eq!(cache.committed_size(), large);
    }

    #[test]
    fn test_global_system() {
        init(&KernelConfig::default());
        assert!(system().pages.page_count() > 0);
        assert!(vnode_caches().len() < usize::MAX);
    }
}
