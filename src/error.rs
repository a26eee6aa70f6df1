use std::io;
use std::result;
use std::time::Duration;

use thiserror::Error;

/// Custom result type for environment operations
pub type Result<T> = result::Result<T, Error>;

/// Errors raised by the locking, mapping and write layers
#[derive(Debug, Error)]
pub enum Error {
    /// Lock was not obtained within the configured timeout
    #[error("timed out after {0:?} waiting for file lock")]
    LockTimeout(Duration),
    /// The lock primitive failed for a reason other than contention
    #[error("file lock error: {0}")]
    OsLock(#[source] io::Error),
    /// The mapping syscall failed
    #[error("mmap error: {0}")]
    Map(#[source] io::Error),
    /// The random-access hint was rejected; the mapping is still usable
    #[error("madvise: {0}")]
    Advise(#[source] io::Error),
    /// Growing the file failed
    #[error("file resize error: could not grow file to {size} bytes: {source}")]
    Resize {
        /// Requested file length
        size: u64,
        #[source]
        source: io::Error,
    },
    /// Forcing bytes to stable storage failed
    #[error("file sync error: {0}")]
    Sync(#[source] io::Error),
    /// Opening or inspecting the data file failed
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Environment is read-only
    #[error("environment is read-only")]
    ReadOnly,
    /// Environment has no active mapping
    #[error("environment is not mapped")]
    NotMapped,
    /// Access outside the current mapping
    #[error("range {offset}+{len} is outside the mapped size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// Requested map size exceeds the platform maximum
    #[error("mmap too large: {0} bytes")]
    MapTooLarge(usize),
    /// Configured page size is not usable
    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),
    /// Environment is already open
    #[error("environment is already open")]
    EnvAlreadyOpen,
}

impl Error {
    /// Returns true if the error is a lock timeout, which callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }
}
