//! Memory mapping, file locking and file growth for a single-file,
//! page-structured key-value store.
//!
//! An [`Environment`] opens the data file, takes a shared or exclusive
//! advisory lock on it, maps it, and routes positional writes through a
//! page-aligned, synchronously flushed write path.

#[cfg(not(unix))]
compile_error!("lumomap only supports unix platforms");

pub mod constants;
pub mod env;
pub mod error;
pub mod lock;
pub mod mmap;
mod write;

pub use constants::{EnvFlags, MapFlags, FLOCK_RETRY_TIMEOUT};
pub use env::{EnvInfo, EnvState, Environment, FileState};
pub use error::{Error, Result};
pub use lock::{Clock, FileLock, LockLike, LockMode, SystemClock};
pub use mmap::{DataView, MappedRegionLike, MmapRegion};
