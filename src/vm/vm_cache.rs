//! VM Cache - Page-Owning Object
//!
//! A cache owns the resident pages of one region, keyed by page-aligned
//! offset, and exactly one store that produces and persists their content.
//! Every page table operation happens through a [`CacheGuard`], the scoped
//! cache lock.
//!
//! Pages change busy state only while the cache is locked. Clearing the
//! busy flag through the guard notifies the cache's page-event condition,
//! which is what [`CacheGuard::wait_for_page_events`] sleeps on.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::fs::vnode::Vnode;
use crate::kern::lock::{Mutex, MutexGuard};
use crate::kern::sched_prim::ConditionVariable;
use crate::types::VmCacheId;
use crate::vm::commit::Priority;
use crate::vm::store::{Store, VmStore};
use crate::vm::store_anonymous::AnonymousStore;
use crate::vm::store_vnode::VnodeStore;
use crate::vm::vm_page::{round_page, VmPage, PAGE_SIZE};
use crate::vm::VmSystem;

/// Page events a waiter can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEvents(u32);

impl PageEvents {
    /// The page stopped being busy
    pub const NOT_BUSY: Self = Self(0x0001);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Cache of resident pages backed by one store
pub struct VmCache {
    id: VmCacheId,
    system: Arc<VmSystem>,
    store: VmStore,
    /// Logical size in bytes; write-back never goes past it
    virtual_end: AtomicU64,
    pages: Mutex<BTreeMap<u64, Arc<VmPage>>>,
    page_events: ConditionVariable,
}

impl VmCache {
    /// Create a cache owning `store`
    pub fn new(system: Arc<VmSystem>, store: VmStore) -> Arc<Self> {
        Self::with_virtual_end(system, store, 0)
    }

    fn with_virtual_end(system: Arc<VmSystem>, store: VmStore, virtual_end: u64) -> Arc<Self> {
        store.acquire_ref();
        let cache = Arc::new(Self {
            id: VmCacheId::new(),
            system,
            store,
            virtual_end: AtomicU64::new(virtual_end),
            pages: Mutex::new("vm cache", BTreeMap::new()),
            page_events: ConditionVariable::new("vm cache page events"),
        });
        log::trace!("vm cache {} created", cache.id.0);
        cache
    }

    /// Create an anonymous no-swap cache
    pub fn anonymous(system: Arc<VmSystem>, priority: Priority) -> Arc<Self> {
        let store = AnonymousStore::new(system.clone(), priority);
        Self::new(system, store.into())
    }

    /// Create a cache over `vnode`, sized to the file
    pub fn for_vnode(system: Arc<VmSystem>, vnode: Arc<Vnode>) -> Arc<Self> {
        let size = vnode.size();
        Self::with_virtual_end(system, VnodeStore::new(vnode).into(), size)
    }

    pub fn id(&self) -> VmCacheId {
        self.id
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.system
    }

    pub fn store(&self) -> &VmStore {
        &self.store
    }

    /// Lock the cache
    pub fn lock(&self) -> CacheGuard<'_> {
        CacheGuard {
            cache: self,
            pages: self.pages.lock(),
        }
    }

    /// Change the committed size
    pub fn commit(&self, size: u64) -> Result<u64> {
        let _guard = self.lock();
        self.store.commit(size)
    }

    /// Grow the commitment to at least `size`; never shrinks it
    pub fn commit_at_least(&self, size: u64) -> Result<u64> {
        let _guard = self.lock();
        let committed = self.store.committed_size();
        if committed >= size {
            return Ok(committed);
        }
        self.store.commit(size)
    }

    pub fn committed_size(&self) -> u64 {
        self.store.committed_size()
    }

    pub fn virtual_end(&self) -> u64 {
        self.virtual_end.load(Ordering::Acquire)
    }

    /// Set the logical size
    ///
    /// Shrinking drops the pages lying wholly past the new end, waiting
    /// for busy ones first.
    pub fn resize(&self, new_end: u64) {
        let mut freed = Vec::new();
        {
            let mut guard = self.lock();
            let old_end = self.virtual_end.swap(new_end, Ordering::AcqRel);
            if new_end < old_end {
                let first = round_page(new_end);
                loop {
                    let Some(page) = guard.pages.range(first..).next().map(|(_, p)| p.clone())
                    else {
                        break;
                    };
                    if page.is_busy() {
                        guard = guard.wait_for_page_events(&page, PageEvents::NOT_BUSY);
                        continue;
                    }
                    guard.remove_page(&page);
                    freed.push(page);
                }
            }
        }
        for page in freed {
            self.system.pages.free_page(page);
        }
    }

    /// Raise the logical size to cover `end`
    pub(crate) fn extend_virtual_end(&self, end: u64) {
        self.virtual_end.fetch_max(end, Ordering::AcqRel);
    }

    /// Is `offset` resident or producible by the store?
    pub fn has_page(&self, offset: u64) -> bool {
        self.lock().lookup_page(offset).is_some() || self.store.has_page(offset)
    }
}

impl Drop for VmCache {
    fn drop(&mut self) {
        let pages = core::mem::take(self.pages.get_mut());
        let count = pages.len();
        for (_, page) in pages {
            page.set_cache_ref(None, 0);
            self.system.pages.free_page(page);
        }
        self.store.release_ref();
        log::trace!("vm cache {} destroyed, {} pages freed", self.id.0, count);
    }
}

impl fmt::Debug for VmCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmCache")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("virtual_end", &self.virtual_end())
            .finish()
    }
}

/// The locked cache
pub struct CacheGuard<'a> {
    cache: &'a VmCache,
    pages: MutexGuard<'a, BTreeMap<u64, Arc<VmPage>>>,
}

impl<'a> CacheGuard<'a> {
    pub fn cache(&self) -> &'a VmCache {
        self.cache
    }

    /// Page resident at `offset`
    pub fn lookup_page(&self, offset: u64) -> Option<Arc<VmPage>> {
        self.pages.get(&offset).cloned()
    }

    /// Make `page` the cache's page at `offset`
    ///
    /// Panics if the page already belongs to a cache or the offset is taken.
    pub fn insert_page(&mut self, page: Arc<VmPage>, offset: u64) {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        if let Some(owner) = page.cache_ref() {
            panic!(
                "vm_cache_insert_page: page {} already in cache {}",
                page.page_num, owner.0
            );
        }
        if self.pages.contains_key(&offset) {
            panic!(
                "vm_cache_insert_page: cache {} offset {:#x} occupied",
                self.cache.id.0, offset
            );
        }
        page.set_cache_ref(Some(self.cache.id), offset);
        self.pages.insert(offset, page);
    }

    /// Take `page` out of the cache
    pub fn remove_page(&mut self, page: &VmPage) {
        if page.cache_ref() != Some(self.cache.id) {
            panic!(
                "vm_cache_remove_page: page {} not in cache {}",
                page.page_num, self.cache.id.0
            );
        }
        self.pages.remove(&page.offset());
        page.set_cache_ref(None, 0);
        self.cache.page_events.notify_all();
    }

    /// Clear the busy flag and wake page-event waiters
    pub fn mark_page_unbusy(&mut self, page: &VmPage) {
        page.set_busy(false);
        self.cache.page_events.notify_all();
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Resident pages in offset order
    pub fn pages(&self) -> Vec<Arc<VmPage>> {
        self.pages.values().cloned().collect()
    }

    /// Unlock, wait for `events` on `page`, relock
    pub fn wait_for_page_events(self, page: &VmPage, events: PageEvents) -> CacheGuard<'a> {
        let cache = self.cache;
        self.wait_for_page_events_unlocked(page, events);
        cache.lock()
    }

    /// Unlock and wait for `events` on `page` without relocking
    pub fn wait_for_page_events_unlocked(self, page: &VmPage, events: PageEvents) {
        if events.contains(PageEvents::NOT_BUSY) && !page.is_busy() {
            return;
        }
        // Registered before unlocking, so an unbusy notification issued
        // under the lock cannot be missed.
        let cache = self.cache;
        let entry = cache.page_events.add();
        drop(self);
        entry.wait();
    }
}
