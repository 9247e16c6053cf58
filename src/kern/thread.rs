//! Thread identity and kernel thread creation
//!
//! Lock ownership and the DPC worker need to know which thread is running
//! and need a way to start a dedicated kernel thread. Hosted builds (tests
//! or the `std` feature) get both from the host; a freestanding kernel
//! installs [`ThreadHooks`] from its scheduler during startup.

use alloc::boxed::Box;

use crate::error::Result;
use crate::types::ThreadId;

/// Entry point of a kernel thread
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler services supplied by the embedding kernel
#[derive(Clone, Copy)]
pub struct ThreadHooks {
    /// Identify the calling thread
    pub current: fn() -> ThreadId,
    /// Start a kernel thread running `entry`
    pub spawn: fn(&str, ThreadEntry) -> Result<ThreadId>,
    /// Give up the CPU to another ready thread
    pub yield_now: fn(),
}

static HOOKS: spin::Once<ThreadHooks> = spin::Once::new();

/// Install scheduler hooks
///
/// Returns `false` if hooks were already installed; the first set wins.
pub fn install_thread_hooks(hooks: ThreadHooks) -> bool {
    let mut installed = false;
    HOOKS.call_once(|| {
        installed = true;
        hooks
    });
    installed
}

#[cfg(any(test, feature = "std"))]
mod hosted {
    use core::cell::Cell;

    use super::ThreadEntry;
    use crate::error::{Error, Result};
    use crate::types::ThreadId;

    std::thread_local! {
        static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    }

    pub fn current() -> ThreadId {
        CURRENT.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = ThreadId::new();
                current.set(Some(id));
                id
            }
        })
    }

    pub fn spawn(name: &str, entry: ThreadEntry) -> Result<ThreadId> {
        let id = ThreadId::new();
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(id)));
                entry();
            })
            .map_err(|_| Error::NoMemory)?;
        Ok(id)
    }

    pub fn yield_now() {
        std::thread::yield_now();
    }
}

/// Get the ID of the calling thread
pub fn current_thread() -> ThreadId {
    if let Some(hooks) = HOOKS.get() {
        return (hooks.current)();
    }

    #[cfg(any(test, feature = "std"))]
    {
        hosted::current()
    }

    #[cfg(not(any(test, feature = "std")))]
    {
        ThreadId::BOOT
    }
}

/// Start a named kernel thread
pub fn spawn_kernel_thread(name: &str, entry: ThreadEntry) -> Result<ThreadId> {
    if let Some(hooks) = HOOKS.get() {
        return (hooks.spawn)(name, entry);
    }

    #[cfg(any(test, feature = "std"))]
    {
        hosted::spawn(name, entry)
    }

    #[cfg(not(any(test, feature = "std")))]
    {
        let _ = (name, entry);
        Err(crate::error::Error::NotSupported)
    }
}

/// Yield the CPU while waiting for another thread to make progress
pub fn thread_yield() {
    if let Some(hooks) = HOOKS.get() {
        (hooks.yield_now)();
        return;
    }

    #[cfg(any(test, feature = "std"))]
    hosted::yield_now();

    #[cfg(not(any(test, feature = "std")))]
    core::hint::spin_loop();
}
