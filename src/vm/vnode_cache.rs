//! Vnode cache registry
//!
//! Maps each vnode to the one cache holding its pages. Concurrent mappers
//! of the same file race through `insert_atomic`; the loser drops its
//! fresh cache and adopts the winner's.

use alloc::sync::Arc;
use spin::RwLock;

use crate::fs::vnode::Vnode;
use crate::kern::atomic_hash::{AtomicHashTable, HashDefinition};
use crate::types::VnodeId;
use crate::vm::vm_cache::VmCache;
use crate::vm::VmSystem;

struct VnodeCacheEntry {
    vnode: VnodeId,
    cache: Arc<VmCache>,
}

struct VnodeCacheDefinition;

impl HashDefinition for VnodeCacheDefinition {
    type Key = VnodeId;
    type Value = VnodeCacheEntry;

    fn hash_key(key: &VnodeId) -> usize {
        (key.0 ^ (key.0 >> 32)) as usize
    }

    fn key(value: &VnodeCacheEntry) -> &VnodeId {
        &value.vnode
    }

    fn compare(key: &VnodeId, value: &VnodeCacheEntry) -> bool {
        *key == value.vnode
    }
}

/// Registry of vnode caches
pub struct VnodeCacheTable {
    table: RwLock<AtomicHashTable<VnodeCacheDefinition>>,
}

impl VnodeCacheTable {
    pub fn new(buckets: usize) -> Self {
        Self {
            table: RwLock::new(AtomicHashTable::new(buckets)),
        }
    }

    /// The cache of `vnode`, creating it on first use
    pub fn get_or_create(&self, system: &Arc<VmSystem>, vnode: &Arc<Vnode>) -> Arc<VmCache> {
        let cache = {
            let table = self.table.read();
            if let Some(entry) = table.lookup(&vnode.id()) {
                return entry.cache.clone();
            }
            let cache = VmCache::for_vnode(system.clone(), vnode.clone());
            let entry = VnodeCacheEntry {
                vnode: vnode.id(),
                cache: cache.clone(),
            };
            if let Some(winner) = table.insert_atomic(entry) {
                log::trace!("vnode {} cache raced, adopting winner", vnode.id().0);
                return winner.cache.clone();
            }
            cache
        };
        self.table.write().resize_if_needed();
        cache
    }

    pub fn lookup(&self, vnode: VnodeId) -> Option<Arc<VmCache>> {
        self.table
            .read()
            .lookup(&vnode)
            .map(|entry| entry.cache.clone())
    }

    /// Unregister the cache of `vnode`
    pub fn remove(&self, vnode: VnodeId) -> Option<Arc<VmCache>> {
        let mut table = self.table.write();
        let entry = table.remove(&vnode)?;
        table.resize_if_needed();
        Some(entry.cache)
    }

    pub fn len(&self) -> usize {
        self.table.read().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
