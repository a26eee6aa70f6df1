use std::fs::File;
use std::io;

use log::{debug, warn};
use memmap2::{Advice, Mmap, MmapMut, MmapOptions};

use crate::constants::MapFlags;
use crate::error::{Error, Result};

/// A whole-file mapping owned by one environment.
///
/// One implementation per platform family; the environment and write path
/// only see this trait.
pub trait MappedRegionLike {
    /// Mapped bytes
    fn as_bytes(&self) -> &[u8];
    /// Mapped bytes for writing, `None` if the mapping is read-only
    fn as_bytes_mut(&mut self) -> Option<&mut [u8]>;
    /// Synchronously flush `len` bytes starting at `offset` to stable storage
    fn flush_range(&self, offset: usize, len: usize) -> io::Result<()>;

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// Shared memory mapping of the data file
#[derive(Debug)]
pub struct MmapRegion {
    map: Mapping,
    /// Rejected random-access hint, kept for the caller
    advise_warning: Option<Error>,
}

impl MmapRegion {
    /// Map the first `size` bytes of `file`.
    ///
    /// The mapping is shared, read-only or read-write according to
    /// `read_only`, and advised for random access. A kernel without
    /// madvise support is ignored; any other advise failure is kept as a
    /// warning on the region.
    pub fn establish(file: &File, size: usize, read_only: bool, flags: MapFlags) -> Result<Self> {
        if size == 0 {
            return Err(Error::Map(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            )));
        }

        let mut options = MmapOptions::new();
        options.len(size);
        if flags.contains(MapFlags::POPULATE) {
            options.populate();
        }

        // SAFETY: the caller holds the advisory lock on `file` for as long as
        // the region lives, and cooperating processes only modify the file
        // under the exclusive lock.
        let map = unsafe {
            if read_only {
                Mapping::ReadOnly(options.map(file).map_err(Error::Map)?)
            } else {
                Mapping::ReadWrite(options.map_mut(file).map_err(Error::Map)?)
            }
        };

        let advised = match &map {
            Mapping::ReadOnly(m) => m.advise(Advice::Random),
            Mapping::ReadWrite(m) => m.advise(Advice::Random),
        };
        let advise_warning = match advised {
            Ok(()) => None,
            Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => None,
            Err(err) => {
                warn!("madvise(MADV_RANDOM) failed on {} byte mapping: {}", size, err);
                Some(Error::Advise(err))
            }
        };

        debug!("mapped {} bytes (read_only={})", size, read_only);
        Ok(MmapRegion {
            map,
            advise_warning,
        })
    }

    /// The non-fatal advise failure recorded when the region was mapped
    pub fn advise_warning(&self) -> Option<&Error> {
        self.advise_warning.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.map, Mapping::ReadOnly(_))
    }
}

impl MappedRegionLike for MmapRegion {
    fn as_bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::ReadWrite(m) => &m[..],
        }
    }

    fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.map {
            Mapping::ReadOnly(_) => None,
            Mapping::ReadWrite(m) => Some(&mut m[..]),
        }
    }

    fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match &self.map {
            // Nothing of ours can be dirty in a read-only mapping
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::ReadWrite(m) => m.flush_range(offset, len),
        }
    }
}

/// Bounds-checked view over mapped bytes.
///
/// Borrows the region it was created from, so it cannot outlive an unmap
/// or remap.
#[derive(Debug, Clone, Copy)]
pub struct DataView<'a> {
    bytes: &'a [u8],
    page_size: usize,
}

impl<'a> DataView<'a> {
    pub(crate) fn new(bytes: &'a [u8], page_size: usize) -> Self {
        DataView { bytes, page_size }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages in the view
    pub fn page_count(&self) -> u64 {
        (self.bytes.len() / self.page_size) as u64
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Bytes `[offset, offset + len)`
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => Ok(&self.bytes[offset..end]),
            None => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.bytes.len(),
            }),
        }
    }

    /// Page `pgno`
    pub fn page(&self, pgno: u64) -> Result<&'a [u8]> {
        let offset = usize::try_from(pgno)
            .ok()
            .and_then(|p| p.checked_mul(self.page_size))
            .unwrap_or(usize::MAX);
        self.slice(offset, self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn data_file(len: u64) -> (TempDir, File) {
        let dir = TempDir::new().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("data.db"))
            .unwrap();
        file.set_len(len).unwrap();
        (dir, file)
    }

    #[test]
    fn test_establish_read_write() {
        let (_dir, file) = data_file(8192);
        let mut region = MmapRegion::establish(&file, 8192, false, MapFlags::empty()).unwrap();
        assert_eq!(region.len(), 8192);
        assert!(!region.is_read_only());

        let bytes = region.as_bytes_mut().unwrap();
        bytes[100..104].copy_from_slice(b"abcd");
        region.flush_range(100, 4).unwrap();
        assert_eq!(&region.as_bytes()[100..104], b"abcd");
        assert!(region.advise_warning().is_none());
    }

    #[test]
    fn test_establish_read_only_has_no_mut_access() {
        let (_dir, file) = data_file(4096);
        let mut region = MmapRegion::establish(&file, 4096, true, MapFlags::POPULATE).unwrap();
        assert!(region.is_read_only());
        assert!(region.as_bytes_mut().is_none());
        region.flush_range(0, 10).unwrap();
    }

    #[test]
    fn test_establish_zero_size_fails() {
        let (_dir, file) = data_file(4096);
        let err = MmapRegion::establish(&file, 0, false, MapFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::Map(_)));
    }

    #[test]
    fn test_establish_write_on_read_only_file_fails() {
        let (dir, _file) = data_file(4096);
        let ro = OpenOptions::new().read(true).open(dir.path().join("data.db")).unwrap();
        let err = MmapRegion::establish(&ro, 4096, false, MapFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::Map(_)));
    }

    #[test]
    fn test_view_bounds() {
        let bytes = vec![7u8; 4096 * 3];
        let view = DataView::new(&bytes, 4096);

        assert_eq!(view.page_count(), 3);
        assert_eq!(view.page(2).unwrap().len(), 4096);
        assert!(matches!(view.page(3), Err(Error::OutOfBounds { .. })));
        assert!(matches!(view.page(u64::MAX), Err(Error::OutOfBounds { .. })));

        assert_eq!(view.slice(4090, 10).unwrap(), &[7u8; 10]);
        assert!(view.slice(4096 * 3 - 1, 2).is_err());
        assert!(view.slice(usize::MAX, 2).is_err());
        assert!(view.slice(4096 * 3, 0).unwrap().is_empty());
    }
}
