//! End-to-end behaviour of the VM cache, stores and lock primitives

mod common;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Barrier, Mutex as StdMutex};
use std::time::Duration;

use proptest::prelude::*;
use vmcache::fs::fd::{alloc_fd, FdType, IoContext, OpenMode, VNODE_FD_OPS};
use vmcache::fs::ramfs::RamFile;
use vmcache::fs::vnode::{Cookie, Vnode, VnodeOps};
use vmcache::kern::atomic_hash::{AtomicHashTable, HashDefinition};
use vmcache::kern::dpc::DpcQueue;
use vmcache::kern::lock::{
    recursive_lock_get_recursion, recursive_lock_lock, recursive_lock_unlock, Mutex,
    RecursiveLock,
};
use vmcache::vm::store_anonymous::AnonymousStore;
use vmcache::vm::store_vnode::VnodeStore;
use vmcache::vm::{
    cache_get_pages, cache_put_pages, cache_read, cache_write, schedule_write_back, vm_map_file,
    Priority, Store, VmCache, VmSystem, VnodeCacheTable, PAGE_SIZE,
};
use vmcache::{Error, Result};

const MB: u64 = 1024 * 1024;

// ════════════════════════════════════════════════════════════
// Commit accounting
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Net reservation changes always equal the change in committed size
    #[test]
    fn commit_accounting_balances(sizes in prop::collection::vec(0u64..64 * 4096, 1..20)) {
        common::setup();
        let total = 32 * 4096;
        let system = Arc::new(VmSystem::with_limits(1, total, [0; 3]));
        let store = AnonymousStore::new(system.clone(), Priority::User);

        for size in sizes {
            let before = store.committed_size();
            let available = system.commit.available();
            match store.commit(size) {
                Ok(committed) => {
                    prop_assert_eq!(committed, size);
                    prop_assert_eq!(
                        available as i128 - system.commit.available() as i128,
                        size as i128 - before as i128
                    );
                }
                Err(error) => {
                    prop_assert_eq!(error, Error::NoMemory);
                    prop_assert!(size > before);
                    prop_assert_eq!(system.commit.available(), available);
                    prop_assert_eq!(store.committed_size(), before);
                }
            }
            prop_assert_eq!(system.commit.reserved(), store.committed_size());
        }

        store.commit(0).unwrap();
        prop_assert_eq!(system.commit.available(), total);
    }
}

#[test]
fn anonymous_commit_one_megabyte_follows_reservation() {
    common::setup();

    let roomy = Arc::new(VmSystem::with_limits(1, 2 * MB, [0; 3]));
    let store = AnonymousStore::new(roomy.clone(), Priority::User);
    assert_eq!(store.commit(MB), Ok(MB));
    assert_eq!(store.committed_size(), MB);
    assert_eq!(roomy.commit.available(), MB);

    let tight = Arc::new(VmSystem::with_limits(1, MB / 2, [0; 3]));
    let store = AnonymousStore::new(tight.clone(), Priority::User);
    assert_eq!(store.commit(MB), Err(Error::NoMemory));
    assert_eq!(store.committed_size(), 0);
    assert_eq!(tight.commit.available(), MB / 2);
}

// ════════════════════════════════════════════════════════════
// Page claiming
// ════════════════════════════════════════════════════════════

#[test]
fn overlapping_claims_never_share_a_page() {
    let system = common::system(16);
    let cache = VmCache::anonymous(system, Priority::User);
    let owners: Vec<AtomicBool> = (0..4).map(|_| AtomicBool::new(false)).collect();

    std::thread::scope(|s| {
        for thread in 0..4usize {
            let cache = &cache;
            let owners = &owners;
            s.spawn(move || {
                for round in 0..25 {
                    let first = (thread + round) % 3;
                    let run = cache_get_pages(
                        cache,
                        (first * PAGE_SIZE) as u64,
                        2 * PAGE_SIZE,
                        true,
                    )
                    .unwrap();
                    for index in 0..run.len() {
                        let slot = (run.page_offset(index) as usize) / PAGE_SIZE;
                        assert!(
                            !owners[slot].swap(true, Ordering::SeqCst),
                            "page {} claimed twice",
                            slot
                        );
                    }
                    std::thread::yield_now();
                    for index in 0..run.len() {
                        let slot = (run.page_offset(index) as usize) / PAGE_SIZE;
                        owners[slot].store(false, Ordering::SeqCst);
                    }
                    cache_put_pages(cache, run, true);
                }
            });
        }
    });

    assert_eq!(cache.lock().page_count(), 4);
}

#[test]
fn get_then_put_leaves_pages_resident_and_unbusy() {
    let system = common::system(8);
    let cache = VmCache::anonymous(system.clone(), Priority::User);

    let run = cache_get_pages(&cache, PAGE_SIZE as u64, 3 * PAGE_SIZE, true).unwrap();
    assert_eq!(run.missing(), 0);
    cache_put_pages(&cache, run, true);

    let guard = cache.lock();
    for index in 1..4u64 {
        let page = guard.lookup_page(index * PAGE_SIZE as u64).unwrap();
        assert!(!page.is_busy());
        assert_eq!(page.cache_ref(), Some(cache.id()));
    }
    assert_eq!(guard.page_count(), 3);
    drop(guard);
    assert_eq!(system.pages.free_count(), 5);
}

#[test]
fn failed_put_returns_new_pages_to_pool() {
    let system = common::system(8);
    let cache = VmCache::anonymous(system.clone(), Priority::User);
    cache_write(&cache, 0, b"keep").unwrap();
    assert_eq!(system.pages.free_count(), 7);

    let run = cache_get_pages(&cache, 0, 3 * PAGE_SIZE, true).unwrap();
    assert_eq!(system.pages.free_count(), 5);
    cache_put_pages(&cache, run, false);

    assert_eq!(system.pages.free_count(), 7);
    let guard = cache.lock();
    assert_eq!(guard.page_count(), 1);
    assert!(guard.lookup_page(PAGE_SIZE as u64).is_none());
    assert!(!guard.lookup_page(0).unwrap().is_busy());
    drop(guard);

    let mut buf = [0u8; 4];
    cache_read(&cache, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"keep");
}

#[test]
fn second_writer_waits_for_first_put() {
    let system = common::system(4);
    let cache = VmCache::anonymous(system, Priority::User);
    let first_done = AtomicBool::new(false);
    let second_claimed = AtomicBool::new(false);

    let run = cache_get_pages(&cache, 0, PAGE_SIZE, true).unwrap();
    std::thread::scope(|s| {
        s.spawn(|| {
            let run = cache_get_pages(&cache, 0, PAGE_SIZE, true).unwrap();
            assert!(first_done.load(Ordering::SeqCst));
            second_claimed.store(true, Ordering::SeqCst);
            assert!(!run.is_fresh(0));
            cache_put_pages(&cache, run, true);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!second_claimed.load(Ordering::SeqCst));
        first_done.store(true, Ordering::SeqCst);
        cache_put_pages(&cache, run, true);
    });

    assert!(second_claimed.load(Ordering::SeqCst));
    assert_eq!(cache.lock().page_count(), 1);
}

// ════════════════════════════════════════════════════════════
// Lock primitives
// ════════════════════════════════════════════════════════════

#[test]
fn recursive_lock_is_reentrant() {
    common::setup();
    let lock = RecursiveLock::new("scenario");
    for depth in 1..=5 {
        recursive_lock_lock(&lock);
        assert_eq!(recursive_lock_get_recursion(&lock), depth);
    }
    for _ in 0..5 {
        recursive_lock_unlock(&lock);
    }
    assert!(!lock.is_locked());
    assert!(lock.holder().is_none());
}

#[test]
fn mutex_admits_one_thread_at_a_time() {
    common::setup();
    let mutex = Mutex::new("scenario", 0u64);
    let inside = AtomicI32::new(0);
    let max_inside = AtomicI32::new(0);

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..500 {
                    let mut guard = mutex.lock();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    *guard += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(*mutex.lock(), 1000);
}

// ════════════════════════════════════════════════════════════
// Vnode store delegation
// ════════════════════════════════════════════════════════════

/// Records page I/O and answers with a fixed result
struct RecordingOps {
    calls: StdMutex<Vec<(&'static str, u64, Vec<usize>)>>,
    answer: Result<usize>,
}

impl VnodeOps for RecordingOps {
    fn read_page(&self, _vnode: &Vnode, offset: u64, vecs: &mut [&mut [u8]]) -> Result<usize> {
        let lengths = vecs.iter().map(|v| v.len()).collect();
        self.calls.lock().unwrap().push(("read", offset, lengths));
        self.answer
    }

    fn write_page(&self, _vnode: &Vnode, offset: u64, vecs: &[&[u8]]) -> Result<usize> {
        let lengths = vecs.iter().map(|v| v.len()).collect();
        self.calls.lock().unwrap().push(("write", offset, lengths));
        self.answer
    }

    fn read(&self, _: &Vnode, _: Cookie, _: u64, _: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(&self, _: &Vnode, _: Cookie, _: u64, _: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn size(&self, _: &Vnode) -> u64 {
        0
    }
}

#[test]
fn vnode_store_forwards_page_io_unmodified() {
    for answer in [Ok(1234), Err(Error::Io(-5))] {
        let ops = Arc::new(RecordingOps {
            calls: StdMutex::new(Vec::new()),
            answer,
        });
        let store = VnodeStore::new(Vnode::new(ops.clone()));

        let mut a = [0u8; 16];
        let mut b = [0u8; 32];
        assert_eq!(store.read(0x3000, &mut [&mut a[..], &mut b[..]]), answer);
        assert_eq!(store.write(0x5000, &[&a[..8]]), answer);

        let calls = ops.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![("read", 0x3000, vec![16, 32]), ("write", 0x5000, vec![8])]
        );
    }
}

// ════════════════════════════════════════════════════════════
// Atomic hash table
// ════════════════════════════════════════════════════════════

struct Registration {
    key: u32,
    owner: usize,
}

struct RegistrationDefinition;

impl HashDefinition for RegistrationDefinition {
    type Key = u32;
    type Value = Registration;

    fn hash_key(key: &u32) -> usize {
        *key as usize
    }

    fn key(value: &Registration) -> &u32 {
        &value.key
    }

    fn compare(key: &u32, value: &Registration) -> bool {
        *key == value.key
    }
}

#[test]
fn racing_inserts_elect_one_winner() {
    for _ in 0..100 {
        let table = AtomicHashTable::<RegistrationDefinition>::new(8);
        let barrier = Barrier::new(2);

        let results: Vec<(usize, Option<usize>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|owner| {
                    let table = &table;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        let existing = table.insert_atomic(Registration { key: 42, owner });
                        (owner, existing.map(|r| r.owner))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_none()).collect();
        assert_eq!(winners.len(), 1);
        let winner = winners[0].0;
        let loser = results.iter().find(|(_, r)| r.is_some()).unwrap();
        assert_eq!(loser.1, Some(winner));
        assert_eq!(table.lookup(&42).map(|r| r.owner), Some(winner));
        assert_eq!(table.count(), 1);
    }
}

// ════════════════════════════════════════════════════════════
// Mapping files
// ════════════════════════════════════════════════════════════

#[test]
fn mapped_file_round_trips_through_cache_and_dpc_write_back() {
    let system = common::system(8);
    let registry = VnodeCacheTable::new(8);
    let context = IoContext::with_table_size(None, false, 8, 8);

    let file = RamFile::with_contents(b"mapped file contents");
    let vnode = Vnode::new(file.clone());
    let fd = context
        .new_fd(alloc_fd(FdType::File, Some(vnode.clone()), 0, &VNODE_FD_OPS, OpenMode::ReadWrite))
        .unwrap();

    let cache = vm_map_file(&system, &registry, &context, fd, 0, 20).unwrap();
    assert_eq!(cache.committed_size(), PAGE_SIZE as u64);
    assert_eq!(vnode.ref_count(), 2);

    let mut buf = [0u8; 6];
    cache_read(&cache, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"mapped");

    // Dirty the resident page behind the store's back, then flush it.
    cache.lock().lookup_page(0).unwrap().write_at(0, b"MAPPED");
    let queue = DpcQueue::init("scenario write-back", 4).unwrap();
    let writes_before = file.page_writes();
    schedule_write_back(&queue, &cache).unwrap();
    queue.close(false);
    assert_eq!(file.page_writes(), writes_before + 1);
    assert_eq!(file.contents(), b"MAPPED file contents");

    context.close_fd(fd).unwrap();
    drop(cache);
    let cache = registry.remove(vnode.id()).unwrap();
    drop(cache);
    assert_eq!(vnode.ref_count(), 0);
}

#[test]
fn anonymous_cache_runs_out_of_pages_cleanly() {
    let system = common::system(2);
    let cache = VmCache::anonymous(system.clone(), Priority::User);
    assert_eq!(
        cache_write(&cache, 0, &vec![1u8; 3 * PAGE_SIZE]),
        Err(Error::NoMemory)
    );
    assert_eq!(system.pages.free_count(), 2);
    assert_eq!(cache.lock().page_count(), 0);

    for page in 0..2 {
        cache_write(&cache, (page * PAGE_SIZE) as u64, b"x").unwrap();
    }
    assert_eq!(system.pages.free_count(), 0);
}
