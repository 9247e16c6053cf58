//! Error types for kernel VM and descriptor operations

use thiserror::Error;

/// Result type for kernel operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur in the VM, lock and descriptor layers
///
/// Programmer errors (reading from an anonymous store, unlocking a lock
/// held by another thread) are not represented here; they panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Commitment or page reservation could not be satisfied
    #[error("out of memory")]
    NoMemory,

    /// Descriptor slot is empty or out of range
    #[error("bad file descriptor")]
    BadFileDescriptor,

    /// No free slot left in the descriptor table
    #[error("file descriptor table full")]
    TableFull,

    /// Argument out of range or otherwise malformed
    #[error("invalid argument")]
    InvalidArgument,

    /// Resource is in use
    #[error("resource busy")]
    Busy,

    /// Operation is not provided by this object
    #[error("operation not supported")]
    NotSupported,

    /// Filesystem or device reported an I/O failure
    #[error("I/O error ({0})")]
    Io(i32),

    /// Queue or object has been shut down
    #[error("object closed")]
    Closed,

    /// Subsystem used before `init`
    #[error("subsystem not initialized")]
    NotInitialized,
}

// Status codes handed across the syscall boundary
const STATUS_NO_MEMORY: i32 = -12;
const STATUS_BAD_FD: i32 = -9;
const STATUS_TABLE_FULL: i32 = -24;
const STATUS_INVALID_ARGUMENT: i32 = -22;
const STATUS_BUSY: i32 = -16;
const STATUS_NOT_SUPPORTED: i32 = -95;
const STATUS_IO: i32 = -5;
const STATUS_CLOSED: i32 = -108;
const STATUS_NOT_INITIALIZED: i32 = -19;

impl Error {
    /// Negative status code for this error
    ///
    /// An `Io` error without a negative code reports a generic I/O failure.
    pub fn status(&self) -> i32 {
        match self {
            Error::NoMemory => STATUS_NO_MEMORY,
            Error::BadFileDescriptor => STATUS_BAD_FD,
            Error::TableFull => STATUS_TABLE_FULL,
            Error::InvalidArgument => STATUS_INVALID_ARGUMENT,
            Error::Busy => STATUS_BUSY,
            Error::NotSupported => STATUS_NOT_SUPPORTED,
            Error::Io(code) if *code < 0 => *code,
            Error::Io(_) => STATUS_IO,
            Error::Closed => STATUS_CLOSED,
            Error::NotInitialized => STATUS_NOT_INITIALIZED,
        }
    }

    /// Convert a raw negative status code into an error
    ///
    /// Unknown codes become `Io` carrying the original value.
    pub fn from_status(status: i32) -> Self {
        match status {
            STATUS_NO_MEMORY => Error::NoMemory,
            STATUS_BAD_FD => Error::BadFileDescriptor,
            STATUS_TABLE_FULL => Error::TableFull,
            STATUS_INVALID_ARGUMENT => Error::InvalidArgument,
            STATUS_BUSY => Error::Busy,
            STATUS_NOT_SUPPORTED => Error::NotSupported,
            STATUS_CLOSED => Error::Closed,
            STATUS_NOT_INITIALIZED => Error::NotInitialized,
            other => Error::Io(other),
        }
    }
}

/// Turn a `ssize_t`-style return value into a byte count or error
pub fn check_transfer(result: isize) -> Result<usize> {
    if result < 0 {
        Err(Error::from_status(result as i32))
    } else {
        Ok(result as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NoMemory.status(), -12);
        assert_eq!(Error::from_status(-12), Error::NoMemory);
        assert_eq!(Error::from_status(Error::Busy.status()), Error::Busy);
        assert_eq!(Error::from_status(-1000), Error::Io(-1000));
        assert_eq!(Error::Io(-5).status(), -5);
        assert_eq!(Error::Io(0).status(), -5);
        assert_eq!(Error::Io(-30).status(), -30);
    }

    #[test]
    fn test_check_transfer() {
        assert_eq!(check_transfer(4096), Ok(4096));
        assert_eq!(check_transfer(0), Ok(0));
        assert_eq!(check_transfer(-9), Err(Error::BadFileDescriptor));
    }
}
