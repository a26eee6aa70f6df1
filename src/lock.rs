use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::constants::FLOCK_RETRY_TIMEOUT;
use crate::error::{Error, Result};

/// Lock mode requested on the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders may coexist
    Shared,
    /// Excludes every other holder
    Exclusive,
}

/// Whole-file advisory lock primitive.
///
/// One implementation per platform family; the acquisition loop only sees
/// this trait.
pub trait LockLike {
    /// Attempt to take the lock without blocking.
    ///
    /// Returns `Ok(false)` when the lock is held elsewhere and the attempt
    /// should be retried.
    fn try_lock(&self, mode: LockMode) -> io::Result<bool>;

    /// Drop whatever lock is held.
    fn unlock(&self) -> io::Result<()>;
}

/// Time source for the acquisition loop
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, dur: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) {
        thread::sleep(dur)
    }
}

/// `flock(2)` on the data file descriptor
#[derive(Debug, Clone, Copy)]
pub struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    pub fn new(file: &'a File) -> Self {
        FileLock { file }
    }
}

impl LockLike for FileLock<'_> {
    fn try_lock(&self, mode: LockMode) -> io::Result<bool> {
        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        // SAFETY: the descriptor is owned by `self.file`, which outlives the call.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        // SAFETY: as in `try_lock`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Acquire `lock` in `mode`, polling until it is granted.
///
/// With no timeout the loop retries forever. With a timeout, the call fails
/// with [`Error::LockTimeout`] once the time since the first attempt exceeds
/// `timeout - FLOCK_RETRY_TIMEOUT`, so the last attempt lands close to the
/// deadline. Errors other than contention are returned immediately.
pub fn acquire<L, C>(lock: &L, mode: LockMode, timeout: Option<Duration>, clock: &C) -> Result<()>
where
    L: LockLike + ?Sized,
    C: Clock + ?Sized,
{
    let start = clock.now();
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        if lock.try_lock(mode).map_err(Error::OsLock)? {
            if attempts > 1 {
                debug!("{:?} lock acquired after {} attempts", mode, attempts);
            }
            return Ok(());
        }

        if let Some(timeout) = timeout {
            let elapsed = clock.now().saturating_duration_since(start);
            if elapsed > timeout.saturating_sub(FLOCK_RETRY_TIMEOUT) {
                debug!("{:?} lock timed out after {:?} ({} attempts)", mode, elapsed, attempts);
                return Err(Error::LockTimeout(timeout));
            }
        }

        trace!("{:?} lock contended, retrying in {:?}", mode, FLOCK_RETRY_TIMEOUT);
        clock.sleep(FLOCK_RETRY_TIMEOUT);
    }
}

/// Release the lock unconditionally.
pub fn release<L: LockLike + ?Sized>(lock: &L) -> Result<()> {
    lock.unlock().map_err(Error::OsLock)
}
