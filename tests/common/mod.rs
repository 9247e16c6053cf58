//! Shared setup for the integration tests
//!
//! The library is built without `cfg(test)` here, so the tests plug the
//! host's threads in through the same hooks a kernel scheduler would use.

use std::cell::Cell;
use std::sync::Arc;

use vmcache::kern::thread::{install_thread_hooks, ThreadEntry, ThreadHooks};
use vmcache::types::ThreadId;
use vmcache::vm::{VmSystem, PAGE_SIZE};
use vmcache::Result;

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

fn current() -> ThreadId {
    CURRENT.with(|current| match current.get() {
        Some(id) => id,
        None => {
            let id = ThreadId::new();
            current.set(Some(id));
            id
        }
    })
}

fn spawn(name: &str, entry: ThreadEntry) -> Result<ThreadId> {
    let id = ThreadId::new();
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            CURRENT.with(|current| current.set(Some(id)));
            entry();
        })
        .map_err(|_| vmcache::Error::NoMemory)?;
    Ok(id)
}

/// Install host thread hooks (first caller wins)
pub fn setup() {
    install_thread_hooks(ThreadHooks {
        current,
        spawn,
        yield_now: std::thread::yield_now,
    });
}

/// A private VM system with `pages` frames and as many committable bytes
pub fn system(pages: usize) -> Arc<VmSystem> {
    setup();
    Arc::new(VmSystem::with_limits(pages, (pages * PAGE_SIZE) as u64, [0; 3]))
}
