//! Cache page I/O helpers
//!
//! `cache_get_pages` claims the pages covering a byte range; the matching
//! `cache_put_pages` releases them. Every successful get must be paired
//! with exactly one put, or the claimed pages stay busy forever.
//!
//! Pages are claimed in ascending offset order. A call never waits for a
//! busy page while holding pages it inserted itself: if another thread
//! filled a missing slot first, everything is released and the claim is
//! retried.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::error::{Error, Result};
use crate::kern::dpc::{DpcCallback, DpcQueue, SchedulerState};
use crate::vm::commit::Priority;
use crate::vm::store::Store;
use crate::vm::vm_cache::{PageEvents, VmCache};
use crate::vm::vm_page::{round_page, trunc_page, PageFlags, VmPage, PAGE_SIZE};

/// Pages claimed by [`cache_get_pages`]
#[derive(Debug)]
pub struct PageRun {
    offset: u64,
    pages: Vec<Option<Arc<VmPage>>>,
    fresh: Vec<bool>,
}

impl PageRun {
    fn new(offset: u64, count: usize) -> Self {
        Self {
            offset,
            pages: (0..count).map(|_| None).collect(),
            fresh: (0..count).map(|_| false).collect(),
        }
    }

    /// Offset of the first page
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Claimed pages; `None` for slots left missing on a read
    pub fn pages(&self) -> &[Option<Arc<VmPage>>] {
        &self.pages
    }

    /// Was slot `index` allocated by this claim?
    pub fn is_fresh(&self, index: usize) -> bool {
        self.fresh[index]
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Cache offset of slot `index`
    pub fn page_offset(&self, index: usize) -> u64 {
        self.offset + (index * PAGE_SIZE) as u64
    }

    /// Slots with no page
    pub fn missing(&self) -> usize {
        self.pages.iter().filter(|p| p.is_none()).count()
    }
}

/// Claim the pages covering `[offset, offset + length)`
///
/// Resident pages are marked busy, waiting for any that are busy already.
/// On a write every missing page is allocated (wired and busy) and
/// inserted; on a read missing slots stay `None`. Fails with `NoMemory`
/// if the missing pages cannot be reserved, in which case nothing stays
/// claimed.
pub fn cache_get_pages(cache: &VmCache, offset: u64, length: usize, is_write: bool) -> Result<PageRun> {
    let start = trunc_page(offset);
    let end = round_page(offset + length as u64);
    let count = ((end - start) / PAGE_SIZE as u64) as usize;

    loop {
        let mut run = PageRun::new(start, count);
        let mut guard = cache.lock();

        let mut index = 0;
        while index < count {
            let page_offset = run.page_offset(index);
            match guard.lookup_page(page_offset) {
                Some(page) if page.is_busy() => {
                    guard = guard.wait_for_page_events(&page, PageEvents::NOT_BUSY);
                }
                Some(page) => {
                    page.set_busy(true);
                    run.pages[index] = Some(page);
                    index += 1;
                }
                None => index += 1,
            }
        }

        let missing = run.missing();
        if !is_write || missing == 0 {
            return Ok(run);
        }
        drop(guard);

        let mut fresh = match allocate_pages(cache, missing) {
            Ok(pages) => pages,
            Err(error) => {
                cache_put_pages(cache, run, false);
                return Err(error);
            }
        };
        #[cfg(test)]
        tests::after_allocate(cache);

        let mut guard = cache.lock();
        let mut conflict = None;
        for index in 0..count {
            if run.pages[index].is_some() {
                continue;
            }
            let page_offset = run.page_offset(index);
            if let Some(existing) = guard.lookup_page(page_offset) {
                conflict = Some(existing);
                break;
            }
            let page = fresh.remove(0);
            guard.insert_page(page.clone(), page_offset);
            run.pages[index] = Some(page);
            run.fresh[index] = true;
        }

        let Some(existing) = conflict else {
            return Ok(run);
        };
        drop(guard);

        log::trace!(
            "cache_get_pages: cache {} raced at {:#x}, retrying",
            cache.id().0,
            existing.offset()
        );
        for page in fresh {
            page.unwire();
            cache.system().pages.free_page(page);
        }
        cache_put_pages(cache, run, false);
        cache
            .lock()
            .wait_for_page_events_unlocked(&existing, PageEvents::NOT_BUSY);
    }
}

fn allocate_pages(cache: &VmCache, count: usize) -> Result<Vec<Arc<VmPage>>> {
    let pool = &cache.system().pages;
    let mut reservation = pool.reserve_pages(count, Priority::System)?;
    let pages = (0..count)
        .map(|_| {
            pool.allocate_page(
                &mut reservation,
                PageFlags::CLEAR | PageFlags::WIRED | PageFlags::BUSY,
            )
        })
        .collect();
    pool.unreserve_pages(reservation);
    Ok(pages)
}

/// Release the pages claimed by [`cache_get_pages`]
///
/// Pages the claim allocated stay in the cache on `success` and are
/// removed and freed otherwise. Pages that were already resident are just
/// unbusied.
pub fn cache_put_pages(cache: &VmCache, run: PageRun, success: bool) {
    let mut freed = Vec::new();
    {
        let mut guard = cache.lock();
        for (page, fresh) in run.pages.into_iter().zip(run.fresh) {
            let Some(page) = page else { continue };
            if fresh {
                page.unwire();
                if success {
                    guard.mark_page_unbusy(&page);
                } else {
                    guard.remove_page(&page);
                    freed.push(page);
                }
            } else {
                guard.mark_page_unbusy(&page);
            }
        }
    }
    for page in freed {
        cache.system().pages.free_page(page);
    }
}

/// Byte range of slot `index` that overlaps `[offset, offset + length)`,
/// relative to the page start
fn slot_range(run: &PageRun, index: usize, offset: u64, length: usize) -> Range<usize> {
    let page_start = run.page_offset(index);
    let page_end = page_start + PAGE_SIZE as u64;
    let start = offset.max(page_start);
    let end = (offset + length as u64).min(page_end);
    (start - page_start) as usize..(end - page_start) as usize
}

/// Fill freshly allocated pages from the store
///
/// With `partial_only`, pages the caller will overwrite completely are
/// skipped.
fn fill_fresh_pages(
    cache: &VmCache,
    run: &PageRun,
    offset: u64,
    length: usize,
    partial_only: bool,
) -> Result<()> {
    for (index, slot) in run.pages().iter().enumerate() {
        let Some(page) = slot else { continue };
        if !run.is_fresh(index) {
            continue;
        }
        let page_offset = run.page_offset(index);
        if partial_only && slot_range(run, index, offset, length).len() == PAGE_SIZE {
            continue;
        }
        if !cache.store().has_page(page_offset) {
            continue;
        }
        let mut frame = page.frame();
        cache.store().read(page_offset, &mut [&mut frame[..]])?;
    }
    Ok(())
}

/// Read `buf.len()` bytes at `offset` through the cache
///
/// Missing pages the store can produce are read in and kept; missing
/// pages of an anonymous cache read as zeroes.
pub fn cache_read(cache: &VmCache, offset: u64, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let populate = cache.store().has_page(trunc_page(offset));
    let run = cache_get_pages(cache, offset, buf.len(), populate)?;

    if let Err(error) = fill_fresh_pages(cache, &run, offset, buf.len(), false) {
        cache_put_pages(cache, run, false);
        return Err(error);
    }

    let mut copied = 0;
    for (index, slot) in run.pages().iter().enumerate() {
        let range = slot_range(&run, index, offset, buf.len());
        let dest = &mut buf[copied..copied + range.len()];
        match slot {
            Some(page) => page.read_at(range.start, dest),
            None => dest.fill(0),
        }
        copied += range.len();
    }

    cache_put_pages(cache, run, true);
    Ok(copied)
}

/// Write `data` at `offset` through the cache and on to the store
///
/// The store sees the data first; resident pages only change once it has
/// accepted the write. If the store rejects it, pages allocated for the
/// write are discarded and resident pages keep their old content.
pub fn cache_write(cache: &VmCache, offset: u64, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let run = cache_get_pages(cache, offset, data.len(), true)?;

    if let Err(error) = fill_fresh_pages(cache, &run, offset, data.len(), true) {
        cache_put_pages(cache, run, false);
        return Err(error);
    }

    match write_through(cache, &run, offset, data) {
        Ok(()) => {
            cache.extend_virtual_end(offset + data.len() as u64);
            cache_put_pages(cache, run, true);
            Ok(data.len())
        }
        Err(error) => {
            log::warn!(
                "cache_write: cache {} store write at {:#x} failed: {}",
                cache.id().0,
                offset,
                error
            );
            cache_put_pages(cache, run, false);
            Err(error)
        }
    }
}

/// Hand `data` to the store, then copy it into the claimed pages
fn write_through(cache: &VmCache, run: &PageRun, offset: u64, data: &[u8]) -> Result<()> {
    if run.missing() > 0 {
        return Err(Error::InvalidArgument);
    }
    cache.store().write(offset, &[data])?;

    let mut consumed = 0;
    for (index, page) in run.pages().iter().flatten().enumerate() {
        let range = slot_range(run, index, offset, data.len());
        let length = range.len();
        page.write_at(range.start, &data[consumed..consumed + length]);
        consumed += length;
    }
    Ok(())
}

/// Write every resident page to the store
///
/// Nothing past the cache's logical end or its commitment is written. Returns the bytes the
/// store accepted; anonymous stores accept nothing.
pub fn cache_write_back(cache: &VmCache) -> Result<usize> {
    let pages: Vec<Arc<VmPage>> = {
        let guard = cache.lock();
        let mut claimed = Vec::new();
        for page in guard.pages() {
            if !page.is_busy() {
                page.set_busy(true);
                claimed.push(page);
            }
        }
        claimed
    };

    let end = cache.committed_size().min(cache.virtual_end());
    let mut written = 0;
    let mut result = Ok(());
    for page in &pages {
        let page_offset = page.offset();
        if page_offset >= end {
            continue;
        }
        let length = ((end - page_offset) as usize).min(PAGE_SIZE);
        let frame = page.frame();
        match cache.store().write(page_offset, &[&frame[..length]]) {
            Ok(bytes) => written += bytes,
            Err(error) => {
                result = Err(error);
                break;
            }
        }
    }

    let mut guard = cache.lock();
    for page in &pages {
        guard.mark_page_unbusy(page);
    }
    drop(guard);

    result.map(|()| written)
}

/// DPC callback writing a cache back
pub struct WriteBackCallback {
    cache: Arc<VmCache>,
}

impl WriteBackCallback {
    pub fn cache(&self) -> &Arc<VmCache> {
        &self.cache
    }
}

impl DpcCallback for WriteBackCallback {
    fn do_dpc(&self, _queue: &DpcQueue) {
        match cache_write_back(&self.cache) {
            Ok(bytes) => log::debug!("write-back of cache {}: {} bytes", self.cache.id().0, bytes),
            Err(error) => log::error!("write-back of cache {} failed: {}", self.cache.id().0, error),
        }
    }
}

/// Defer [`cache_write_back`] to `queue`
pub fn schedule_write_back(queue: &DpcQueue, cache: &Arc<VmCache>) -> Result<Arc<WriteBackCallback>> {
    let callback = Arc::new(WriteBackCallback {
        cache: cache.clone(),
    });
    queue.add(callback.clone(), SchedulerState::Unlocked)?;
    Ok(callback)
}
