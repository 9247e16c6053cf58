//! Atomic Hash Table - lock-free insert-or-find
//!
//! A chained hash table whose insert path needs no table lock. Threads
//! racing to register the same key all walk the bucket chain and try to
//! link their node with a compare-and-swap on the `next` slot; exactly one
//! wins, the others are handed the winner's entry.
//!
//! Only `insert_atomic` and `lookup` may run concurrently. `remove` and
//! the resize operations take `&mut self`, so they cannot overlap an
//! insert. A table shared between threads sits behind a
//! `spin::RwLock`: inserts under the read side, removal and rehashing
//! under the write side.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Smallest bucket array the table will use
pub const MIN_TABLE_SIZE: usize = 8;

/// Describes how values are keyed and hashed
pub trait HashDefinition {
    type Key: ?Sized;
    type Value;

    /// Hash of a key
    fn hash_key(key: &Self::Key) -> usize;

    /// Key a value is stored under
    fn key(value: &Self::Value) -> &Self::Key;

    /// Does `value` match `key`?
    fn compare(key: &Self::Key, value: &Self::Value) -> bool;

    /// Hash of a stored value
    fn hash(value: &Self::Value) -> usize {
        Self::hash_key(Self::key(value))
    }
}

struct Node<V> {
    value: V,
    next: AtomicPtr<Node<V>>,
}

/// Hash table with an atomic insert-or-find path
pub struct AtomicHashTable<D: HashDefinition> {
    buckets: Box<[AtomicPtr<Node<D::Value>>]>,
    count: AtomicUsize,
    _definition: PhantomData<D>,
}

unsafe impl<D: HashDefinition> Send for AtomicHashTable<D> where D::Value: Send {}
unsafe impl<D: HashDefinition> Sync for AtomicHashTable<D> where D::Value: Send + Sync {}

fn empty_buckets<V>(size: usize) -> Box<[AtomicPtr<Node<V>>]> {
    (0..size)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl<D: HashDefinition> AtomicHashTable<D> {
    /// Create a table with at least `size` buckets (rounded to a power of two)
    pub fn new(size: usize) -> Self {
        let size = size.max(MIN_TABLE_SIZE).next_power_of_two();
        Self {
            buckets: empty_buckets(size),
            count: AtomicUsize::new(0),
            _definition: PhantomData,
        }
    }

    fn bucket(&self, hash: usize) -> &AtomicPtr<Node<D::Value>> {
        &self.buckets[hash & (self.buckets.len() - 1)]
    }

    /// Insert `value` unless an entry with the same key exists
    ///
    /// Returns `None` when `value` became the canonical entry, or the
    /// entry that won the race; `value` is dropped in that case.
    pub fn insert_atomic(&self, value: D::Value) -> Option<&D::Value> {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        // SAFETY: `node` is ours until a CAS publishes it.
        let key = D::key(unsafe { &(*node).value });
        let mut slot = self.bucket(D::hash_key(key));

        loop {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                match slot.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.count.fetch_add(1, Ordering::AcqRel);
                        return None;
                    }
                    // Someone linked first; look at what they linked.
                    Err(_) => continue,
                }
            }

            // SAFETY: published nodes are only freed through `&mut self`.
            let existing = unsafe { &*current };
            if D::compare(key, &existing.value) {
                // SAFETY: `node` was never published.
                drop(unsafe { Box::from_raw(node) });
                return Some(&existing.value);
            }
            slot = &existing.next;
        }
    }

    /// Find the entry stored under `key`
    pub fn lookup(&self, key: &D::Key) -> Option<&D::Value> {
        let mut current = self.bucket(D::hash_key(key)).load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: published nodes are only freed through `&mut self`.
            let node = unsafe { &*current };
            if D::compare(key, &node.value) {
                return Some(&node.value);
            }
            current = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Unlink and return the entry stored under `key`
    pub fn remove(&mut self, key: &D::Key) -> Option<D::Value> {
        let mut link: *const AtomicPtr<Node<D::Value>> = self.bucket(D::hash_key(key));
        loop {
            // SAFETY: `link` points into the bucket array or a live node,
            // and `&mut self` excludes every other accessor.
            let current = unsafe { (*link).load(Ordering::Relaxed) };
            if current.is_null() {
                return None;
            }
            let node = unsafe { &*current };
            if D::compare(key, &node.value) {
                let next = node.next.load(Ordering::Relaxed);
                unsafe { (*link).store(next, Ordering::Relaxed) };
                self.count.fetch_sub(1, Ordering::Relaxed);
                let node = unsafe { Box::from_raw(current) };
                return Some(node.value);
            }
            link = &node.next;
        }
    }

    /// Rehash into `size` buckets (rounded to a power of two)
    pub fn resize(&mut self, size: usize) {
        let size = size.max(MIN_TABLE_SIZE).next_power_of_two();
        if size == self.buckets.len() {
            return;
        }

        let old = core::mem::replace(&mut self.buckets, empty_buckets(size));
        for bucket in old.iter() {
            let mut current = bucket.load(Ordering::Relaxed);
            while !current.is_null() {
                // SAFETY: exclusive access; every node is relinked exactly once.
                let node = unsafe { &*current };
                let next = node.next.load(Ordering::Relaxed);
                let head = self.bucket(D::hash(&node.value));
                node.next.store(head.load(Ordering::Relaxed), Ordering::Relaxed);
                head.store(current, Ordering::Relaxed);
                current = next;
            }
        }
    }

    /// Grow or shrink the bucket array to suit the item count
    ///
    /// Returns `true` if the table was rehashed.
    pub fn resize_if_needed(&mut self) -> bool {
        let size = self.buckets.len();
        let count = self.count();
        let new_size = if count > size {
            size * 2
        } else if count < size / 4 && size > MIN_TABLE_SIZE {
            size / 2
        } else {
            return false;
        };
        self.resize(new_size);
        true
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of buckets
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> Iter<'_, D> {
        Iter {
            table: self,
            bucket: 0,
            current: ptr::null_mut(),
        }
    }
}

impl<D: HashDefinition> Drop for AtomicHashTable<D> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Relaxed);
            while !current.is_null() {
                // SAFETY: exclusive access during drop.
                let node = unsafe { Box::from_raw(current) };
                current = node.next.load(Ordering::Relaxed);
            }
        }
    }
}

/// Iterator over the entries of an [`AtomicHashTable`]
pub struct Iter<'a, D: HashDefinition> {
    table: &'a AtomicHashTable<D>,
    bucket: usize,
    current: *mut Node<D::Value>,
}

impl<'a, D: HashDefinition> Iterator for Iter<'a, D> {
    type Item = &'a D::Value;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current.is_null() {
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.current = self.table.buckets[self.bucket].load(Ordering::Acquire);
            self.bucket += 1;
        }
        // SAFETY: nodes outlive the shared borrow of the table.
        let node: &'a Node<D::Value> = unsafe { &*self.current };
        self.current = node.next.load(Ordering::Acquire);
        Some(&node.value)
    }
}
