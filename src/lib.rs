//! vmcache - kernel virtual memory cache and page store core
//!
//! This crate provides the page-owning cache layer of a kernel VM system
//! together with the primitives it depends on:
//! - Lock primitives (`mutex`, `recursive_lock`) built on counting semaphores
//! - A lock-optional atomic hash table for registries
//! - A deferred procedure call (DPC) worker queue
//! - Anonymous and vnode-backed page stores
//! - Per-process io_context / file descriptor tables
//!
//! The crate is `no_std` + `alloc`; it links `std` for tests or with the
//! `std` feature, which also provides the threading substrate.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Id constructors allocate fresh ids, so they are not `Default`
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod config;
pub mod console;
pub mod error;
pub mod types;

pub mod fs;
pub mod kern;
pub mod vm;

pub use config::KernelConfig;
pub use error::{Error, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "vmcache";

/// Initialize the kernel library
///
/// Installs the console logger, the global VM services, the kernel
/// io_context and the default DPC queue. Each piece is set up once;
/// later calls keep the first configuration.
pub fn init(config: KernelConfig) -> Result<()> {
    config.validate()?;

    console::init(config.log_level);

    vm::init(&config);
    fs::init(&config);
    kern::init(&config)?;

    log::info!(
        "{} {} initialized: {} pages, {} bytes committable",
        NAME,
        VERSION,
        config.page_count,
        config.available_memory
    );
    Ok(())
}
