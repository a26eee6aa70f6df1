use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::constants::{
    EnvFlags, MapFlags, DEFAULT_PAGE_SIZE, MAX_MAP_SIZE, MAX_MMAP_STEP, MIN_MMAP_SHIFT,
    MIN_PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::lock::{self, Clock, FileLock, LockMode, SystemClock};
use crate::mmap::{DataView, MappedRegionLike, MmapRegion};
use crate::write::{page_align, WritePath};

/// Lifecycle of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    /// No file is open
    Closed,
    /// Waiting for the file lock
    Locking,
    /// Locked and mapped
    Mapped { read_only: bool },
}

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the current mapping
    pub map_size: usize,
    /// Tracked size of the data file
    pub file_size: usize,
    /// Page size
    pub page_size: usize,
    /// Whether the environment is read-only
    pub read_only: bool,
}

/// File-level state of an open environment.
///
/// Owned by exactly one [`Environment`] and passed by reference to the
/// mapping and write operations.
#[derive(Debug)]
pub struct FileState {
    /// Data file, locked for the lifetime of this state
    pub(crate) file: File,
    /// Page size, fixed at open
    pub(crate) page_size: usize,
    /// Read-only flag, fixed at open
    pub(crate) read_only: bool,
    /// Flags passed to the mapping call
    pub(crate) map_flags: MapFlags,
    /// Current mapping
    pub(crate) region: Option<MmapRegion>,
    /// Size of the current mapping, 0 when unmapped
    pub(crate) datasz: usize,
    /// Last known size of the data file
    pub(crate) filesz: usize,
    /// Present on read-write environments only
    pub(crate) write_path: Option<WritePath>,
}

impl FileState {
    pub(crate) fn new(file: File, page_size: usize, read_only: bool, map_flags: MapFlags) -> Result<Self> {
        let filesz = file.metadata()?.len() as usize;
        Ok(FileState {
            file,
            page_size,
            read_only,
            map_flags,
            region: None,
            datasz: 0,
            filesz,
            write_path: if read_only { None } else { Some(WritePath) },
        })
    }

    /// Replace the current mapping with one of `size` bytes.
    pub(crate) fn mmap(&mut self, size: usize) -> Result<()> {
        self.munmap();
        let region = MmapRegion::establish(&self.file, size, self.read_only, self.map_flags)?;
        self.region = Some(region);
        self.datasz = size;
        Ok(())
    }

    /// Drop the current mapping, if any.
    ///
    /// memmap2 unmaps in `Drop` and discards any `munmap` error, so there is
    /// nothing to report here.
    pub(crate) fn munmap(&mut self) {
        if let Some(region) = self.region.take() {
            drop(region);
            debug!("unmapped {} bytes", self.datasz);
        }
        self.datasz = 0;
    }

    /// Mapped bytes that are backed by the file.
    pub fn data(&self) -> Result<DataView<'_>> {
        let region = self.region.as_ref().ok_or(Error::NotMapped)?;
        let bytes = region.as_bytes();
        let len = self.datasz.min(self.filesz);
        Ok(DataView::new(&bytes[..len], self.page_size))
    }

    pub fn mapped_size(&self) -> usize {
        self.datasz
    }

    pub fn file_size(&self) -> usize {
        self.filesz
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Database environment: owns the locked, mapped data file
#[derive(Debug)]
pub struct Environment {
    /// Path to the data file
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Page size used for growth and views
    page_size: usize,
    /// How long to wait for the file lock, `None` waits forever
    lock_timeout: Option<Duration>,
    /// Flags passed to the mapping call
    map_flags: MapFlags,
    /// Lower bound for the mapping size
    initial_map_size: usize,
    /// Current lifecycle state
    state: EnvState,
    /// Present while open
    file_state: Option<FileState>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create a new, unopened environment
    pub fn new() -> Self {
        Environment {
            path: PathBuf::new(),
            flags: EnvFlags::empty(),
            page_size: os_page_size(),
            lock_timeout: None,
            map_flags: MapFlags::empty(),
            initial_map_size: 0,
            state: EnvState::Closed,
            file_state: None,
        }
    }

    /// Set the page size. Must be a power of two of at least 512 bytes.
    pub fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        self.check_unopened()?;
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() || page_size > MAX_MMAP_STEP {
            return Err(Error::InvalidPageSize(page_size));
        }
        self.page_size = page_size;
        Ok(())
    }

    /// Set how long `open` waits for the file lock. `None` waits forever.
    pub fn set_lock_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.check_unopened()?;
        self.lock_timeout = timeout;
        Ok(())
    }

    /// Set the flags passed to the mapping call
    pub fn set_map_flags(&mut self, flags: MapFlags) -> Result<()> {
        self.check_unopened()?;
        self.map_flags = flags;
        Ok(())
    }

    /// Set the minimum mapping size, useful to avoid remaps as the file grows
    pub fn set_initial_map_size(&mut self, size: usize) -> Result<()> {
        self.check_unopened()?;
        if size > MAX_MAP_SIZE {
            return Err(Error::MapTooLarge(size));
        }
        self.initial_map_size = size;
        Ok(())
    }

    fn check_unopened(&self) -> Result<()> {
        if self.file_state.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        Ok(())
    }

    /// Open the data file at `path`, lock it and map it.
    ///
    /// Read-write environments create the file if needed and take an
    /// exclusive lock; `EnvFlags::RDONLY` takes a shared lock.
    pub fn open<P: AsRef<Path>>(self, path: P, flags: EnvFlags) -> Result<Self> {
        self.open_with_clock(path, flags, &SystemClock)
    }

    /// Like [`Environment::open`], polling the lock with `clock`.
    pub fn open_with_clock<P, C>(mut self, path: P, flags: EnvFlags, clock: &C) -> Result<Self>
    where
        P: AsRef<Path>,
        C: Clock + ?Sized,
    {
        self.check_unopened()?;

        let read_only = flags.contains(EnvFlags::RDONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .mode(0o644)
            .open(path.as_ref())?;

        self.path = path.as_ref().to_path_buf();
        self.flags = flags;
        self.state = EnvState::Locking;

        let mode = if read_only { LockMode::Shared } else { LockMode::Exclusive };
        if let Err(err) = lock::acquire(&FileLock::new(&file), mode, self.lock_timeout, clock) {
            self.state = EnvState::Closed;
            return Err(err);
        }

        let file_state = match FileState::new(file, self.page_size, read_only, self.map_flags) {
            Ok(state) => state,
            Err(err) => {
                // Dropping the file releases the lock
                self.state = EnvState::Closed;
                return Err(err);
            }
        };
        self.file_state = Some(file_state);

        if let Err(err) = self.map_at_least(0) {
            if let Err(close_err) = self.close() {
                warn!("close after failed open of {}: {}", self.path.display(), close_err);
            }
            return Err(err);
        }

        self.state = EnvState::Mapped { read_only };
        debug!(
            "opened {} ({:?} lock, {} byte mapping)",
            self.path.display(),
            mode,
            self.file_state.as_ref().map_or(0, |s| s.datasz)
        );
        Ok(self)
    }

    /// Make sure the mapping covers at least `min_size` bytes and the whole
    /// file, remapping if it does not. The mapping never shrinks.
    pub fn map_at_least(&mut self, min_size: usize) -> Result<()> {
        let initial = self.initial_map_size;
        let page_size = self.page_size;
        let state = self.file_state.as_mut().ok_or(Error::NotMapped)?;

        // Another process may have grown the file under its own lock
        let on_disk = state.file.metadata()?.len() as usize;
        state.filesz = state.filesz.max(on_disk);

        let size = mmap_size(state.filesz.max(min_size).max(initial), page_size)?;
        if size <= state.datasz {
            return Ok(());
        }
        self.remap(size)
    }

    /// Remap to at least `new_size` bytes, rounded up to a whole page.
    pub fn grow_mapping(&mut self, new_size: usize) -> Result<()> {
        let size = page_align(new_size, self.page_size)
            .filter(|&size| size <= MAX_MAP_SIZE)
            .ok_or(Error::MapTooLarge(new_size))?;
        let state = self.file_state.as_ref().ok_or(Error::NotMapped)?;
        if size <= state.datasz {
            return Ok(());
        }
        self.remap(size)
    }

    /// Replace the mapping. A failed mapping leaves the environment unusable,
    /// so it is closed before the error is returned.
    fn remap(&mut self, size: usize) -> Result<()> {
        let state = self.file_state.as_mut().ok_or(Error::NotMapped)?;
        let old = state.datasz;
        match state.mmap(size) {
            Ok(()) => {
                if old != 0 {
                    debug!("remapped {} from {} to {} bytes", self.path.display(), old, size);
                }
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = self.close() {
                    warn!("close after failed remap of {}: {}", self.path.display(), close_err);
                }
                Err(err)
            }
        }
    }

    /// Durably write `bytes` at `offset`, growing the file as needed.
    ///
    /// The mapping must already cover the written range; see
    /// [`Environment::map_at_least`].
    pub fn write_at(&mut self, bytes: &[u8], offset: usize) -> Result<usize> {
        let state = self.file_state.as_mut().ok_or(Error::NotMapped)?;
        let write_path = state.write_path.ok_or(Error::ReadOnly)?;
        write_path.write_at(state, bytes, offset)
    }

    /// Flush the whole data file to disk
    pub fn sync(&self) -> Result<()> {
        let state = self.file_state.as_ref().ok_or(Error::NotMapped)?;
        if state.read_only {
            return Err(Error::ReadOnly);
        }
        state.file.sync_data().map_err(Error::Sync)
    }

    /// View of the mapped bytes backed by the file
    pub fn data(&self) -> Result<DataView<'_>> {
        self.file_state.as_ref().ok_or(Error::NotMapped)?.data()
    }

    /// Non-fatal advise failure of the current mapping, if any
    pub fn advise_warning(&self) -> Option<&Error> {
        self.file_state
            .as_ref()
            .and_then(|s| s.region.as_ref())
            .and_then(|r| r.advise_warning())
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let state = self.file_state.as_ref().ok_or(Error::NotMapped)?;
        Ok(EnvInfo {
            map_size: state.datasz,
            file_size: state.filesz,
            page_size: state.page_size,
            read_only: state.read_only,
        })
    }

    /// File state of an open environment
    pub fn file_state(&self) -> Option<&FileState> {
        self.file_state.as_ref()
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    /// Unmap, unlock and close the data file.
    ///
    /// The mapping is always dropped before the lock is released. Closing a closed environment is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut state) = self.file_state.take() else {
            self.state = EnvState::Closed;
            return Ok(());
        };

        state.munmap();
        let unlocked = lock::release(&FileLock::new(&state.file));
        drop(state);
        self.state = EnvState::Closed;
        debug!("closed {}", self.path.display());

        unlocked
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("error closing {}: {}", self.path.display(), err);
        }
    }
}

/// Mapping size for a file of `size` bytes.
///
/// Doubles from 32KB up to 1GB, then grows in 1GB steps. The result is a
/// multiple of `page_size` and never above `MAX_MAP_SIZE` rounded down to
/// a whole page.
pub(crate) fn mmap_size(size: usize, page_size: usize) -> Result<usize> {
    for shift in MIN_MMAP_SHIFT..=30 {
        let step = 1usize << shift;
        if size <= step {
            return Ok(step.max(page_size));
        }
    }

    if size > MAX_MAP_SIZE {
        return Err(Error::MapTooLarge(size));
    }

    let mut sz = size;
    let remainder = sz % MAX_MMAP_STEP;
    if remainder > 0 {
        sz += MAX_MMAP_STEP - remainder;
    }
    if sz % page_size != 0 {
        sz = (sz / page_size + 1) * page_size;
    }
    Ok(sz.min(MAX_MAP_SIZE / page_size * page_size))
}

fn os_page_size() -> usize {
    // SAFETY: sysconf only reads a configuration value and touches no memory
    // of ours.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;
    const GB: usize = 1 << 30;

    #[test]
    fn test_mmap_size_doubles_from_32k() {
        assert_eq!(mmap_size(0, 4096).unwrap(), 32 * 1024);
        assert_eq!(mmap_size(1, 4096).unwrap(), 32 * 1024);
        assert_eq!(mmap_size(32 * 1024, 4096).unwrap(), 32 * 1024);
        assert_eq!(mmap_size(32 * 1024 + 1, 4096).unwrap(), 64 * 1024);
        assert_eq!(mmap_size(3 * MB, 4096).unwrap(), 4 * MB);
        assert_eq!(mmap_size(GB, 4096).unwrap(), GB);
    }

    #[test]
    fn test_mmap_size_large_page_floor() {
        assert_eq!(mmap_size(100, 65536).unwrap(), 65536);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_mmap_size_steps_by_gigabyte() {
        assert_eq!(mmap_size(GB + 1, 4096).unwrap(), 2 * GB);
        assert_eq!(mmap_size(5 * GB - 7, 4096).unwrap(), 5 * GB);
        assert!(matches!(mmap_size(MAX_MAP_SIZE + 1, 4096), Err(Error::MapTooLarge(_))));

        let capped = mmap_size(MAX_MAP_SIZE, 4096).unwrap();
        assert_eq!(capped % 4096, 0);
        assert!(capped <= MAX_MAP_SIZE);
        assert!(capped > MAX_MAP_SIZE - 4096);
        assert_eq!(mmap_size(MAX_MAP_SIZE - 10, 65536).unwrap() % 65536, 0);
    }

    #[test]
    fn test_page_size_validation() {
        let mut env = Environment::new();
        assert!(matches!(env.set_page_size(1000), Err(Error::InvalidPageSize(1000))));
        assert!(matches!(env.set_page_size(256), Err(Error::InvalidPageSize(256))));
        env.set_page_size(16384).unwrap();
        assert_eq!(env.page_size(), 16384);
    }

    #[test]
    fn test_munmap_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("data.db"))
            .unwrap();
        let mut state = FileState::new(file, 4096, false, MapFlags::empty()).unwrap();

        state.mmap(32 * 1024).unwrap();
        assert_eq!(state.mapped_size(), 32 * 1024);
        state.munmap();
        state.munmap();
        assert_eq!(state.mapped_size(), 0);
        assert!(state.region.is_none());
        assert!(matches!(state.data(), Err(Error::NotMapped)));
    }

    #[test]
    fn test_os_page_size_is_power_of_two() {
        assert!(os_page_size().is_power_of_two());
    }
}
