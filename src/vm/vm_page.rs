//! VM Page Management - Physical Page Pool
//!
//! A `VmPage` is one physical frame. Pages live in the global `PagePool`
//! until allocated against a `PageReservation`; a cache then owns them by
//! offset until they are freed back to the pool.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::types::VmCacheId;
use crate::vm::commit::Priority;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

// ============================================================================
// Allocation Flags
// ============================================================================

/// Flags for `PagePool::allocate_page`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Zero the frame
    pub const CLEAR: Self = Self(0x0001);
    /// Wire the page
    pub const WIRED: Self = Self(0x0002);
    /// Hand the page out busy
    pub const BUSY: Self = Self(0x0004);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Virtual Memory Page
#[derive(Debug)]
pub struct VmPage {
    /// Page number in the pool
    pub page_num: u32,

    /// Offset within the owning cache
    offset: AtomicU64,

    /// Owning cache, `None` while unowned
    cache: Mutex<Option<VmCacheId>>,

    /// Exclusive operation in progress
    busy: AtomicBool,

    /// Wire count (reference count for wiring)
    wire_count: AtomicU32,

    /// Page sits in the pool's free list
    free: AtomicBool,

    /// Frame contents
    frame: Mutex<Box<[u8]>>,
}

impl VmPage {
    /// Create a new VM page
    pub fn new(page_num: u32) -> Self {
        Self {
            page_num,
            offset: AtomicU64::new(0),
            cache: Mutex::new(None),
            busy: AtomicBool::new(false),
            wire_count: AtomicU32::new(0),
            free: AtomicBool::new(true),
            frame: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// Offset within the owning cache
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Owning cache
    pub fn cache_ref(&self) -> Option<VmCacheId> {
        *self.cache.lock()
    }

    /// Bind the page to a cache offset, or unbind it
    pub(crate) fn set_cache_ref(&self, cache: Option<VmCacheId>, offset: u64) {
        *self.cache.lock() = cache;
        self.offset.store(offset, Ordering::Release);
    }

    /// Check if page is busy
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Set or clear the busy flag
    ///
    /// Owned pages change busy state only under their cache's lock.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Wire the page (pin in memory)
    pub fn wire(&self) {
        self.wire_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Unwire the page
    pub fn unwire(&self) {
        let prev = self.wire_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "vm_page_unwire: page {} not wired", self.page_num);
    }

    /// Check if page is wired
    pub fn is_wired(&self) -> bool {
        self.wire_count.load(Ordering::Acquire) > 0
    }

    /// Is the page in the pool's free list?
    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    /// Lock and access the frame
    pub fn frame(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.frame.lock()
    }

    /// Zero the frame
    pub fn clear(&self) {
        self.frame.lock().fill(0);
    }

    /// Copy frame bytes starting at `page_offset` into `buf`
    pub fn read_at(&self, page_offset: usize, buf: &mut [u8]) {
        let frame = self.frame.lock();
        buf.copy_from_slice(&frame[page_offset..page_offset + buf.len()]);
    }

    /// Copy `data` into the frame starting at `page_offset`
    pub fn write_at(&self, page_offset: usize, data: &[u8]) {
        let mut frame = self.frame.lock();
        frame[page_offset..page_offset + data.len()].copy_from_slice(data);
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Pages promised to a caller
///
/// Allocations draw from the reservation; leftovers must be handed back
/// with [`PagePool::unreserve_pages`].
#[derive(Debug)]
#[must_use = "unused page reservations must be returned with unreserve_pages"]
pub struct PageReservation {
    count: usize,
}

impl PageReservation {
    /// Pages still reserved
    pub fn count(&self) -> usize {
        self.count
    }
}

// ============================================================================
// Page Pool
// ============================================================================

/// Global physical page pool
pub struct PagePool {
    /// All pages in the system (indexed by page number)
    pages: Vec<Arc<VmPage>>,

    /// Free page stack
    free_list: Mutex<Vec<Arc<VmPage>>>,

    /// Free pages not promised to any reservation
    unreserved: AtomicUsize,

    /// Pages each priority must leave unreserved
    reserve: [usize; 3],
}

impl PagePool {
    /// Create a pool of `page_count` zeroed pages
    pub fn new(page_count: usize) -> Self {
        let pages: Vec<Arc<VmPage>> = (0..page_count)
            .map(|i| Arc::new(VmPage::new(i as u32)))
            .collect();
        let free_list = pages.iter().rev().cloned().collect();

        Self {
            pages,
            free_list: Mutex::new(free_list),
            unreserved: AtomicUsize::new(page_count),
            reserve: [page_count / 32, page_count / 128, 0],
        }
    }

    /// Reserve `count` pages without blocking
    pub fn reserve_pages(&self, count: usize, priority: Priority) -> Result<PageReservation> {
        let minimum = self.reserve[priority.index()];

        let mut unreserved = self.unreserved.load(Ordering::Acquire);
        loop {
            if unreserved < count + minimum {
                log::warn!(
                    "vm_page_reserve_pages: {} pages at {:?} denied ({} free)",
                    count,
                    priority,
                    unreserved
                );
                return Err(Error::NoMemory);
            }
            match self.unreserved.compare_exchange_weak(
                unreserved,
                unreserved - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(PageReservation { count }),
                Err(current) => unreserved = current,
            }
        }
    }

    /// Return the unused part of a reservation
    pub fn unreserve_pages(&self, reservation: PageReservation) {
        self.unreserved.fetch_add(reservation.count, Ordering::AcqRel);
    }

    /// Allocate one page from `reservation`
    ///
    /// Panics if the reservation is exhausted.
    pub fn allocate_page(&self, reservation: &mut PageReservation, flags: PageFlags) -> Arc<VmPage> {
        if reservation.count == 0 {
            panic!("vm_page_allocate_page: reservation exhausted");
        }
        let page = match self.free_list.lock().pop() {
            Some(page) => page,
            None => panic!("vm_page_allocate_page: reserved page missing from free list"),
        };
        reservation.count -= 1;

        page.free.store(false, Ordering::Release);
        if flags.contains(PageFlags::CLEAR) {
            page.clear();
        }
        if flags.contains(PageFlags::WIRED) {
            page.wire();
        }
        page.set_busy(flags.contains(PageFlags::BUSY));

        log::trace!("vm_page_allocate_page: page {}", page.page_num);
        page
    }

    /// Free a page back to the pool
    ///
    /// The page must already be removed from its cache.
    pub fn free_page(&self, page: Arc<VmPage>) {
        if page.free.swap(true, Ordering::AcqRel) {
            panic!("vm_page_free: page {} freed twice", page.page_num);
        }
        if let Some(cache) = page.cache_ref() {
            panic!("vm_page_free: page {} still owned by cache {}", page.page_num, cache.0);
        }
        page.set_busy(false);
        page.wire_count.store(0, Ordering::Release);
        page.offset.store(0, Ordering::Release);

        log::trace!("vm_page_free: page {}", page.page_num);
        self.free_list.lock().push(page);
        self.unreserved.fetch_add(1, Ordering::AcqRel);
    }

    /// Get number of free pages
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Free pages not promised to a reservation
    pub fn unreserved_count(&self) -> usize {
        self.unreserved.load(Ordering::Acquire)
    }

    /// Total page count
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Get page by number
    pub fn get_page(&self, page_num: u32) -> Option<&Arc<VmPage>> {
        self.pages.get(page_num as usize)
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        let free = self.free_count();
        let unreserved = self.unreserved_count();
        let wired = self.pages.iter().filter(|p| p.is_wired()).count();
        PageStats {
            total: self.pages.len(),
            free,
            reserved: free.saturating_sub(unreserved),
            allocated: self.pages.len() - free,
            wired,
        }
    }
}

/// Page statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub total: usize,
    pub free: usize,
    pub reserved: usize,
    pub allocated: usize,
    pub wired: usize,
}
