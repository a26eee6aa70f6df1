use log::debug;

use crate::env::FileState;
use crate::error::{Error, Result};
use crate::mmap::MappedRegionLike;

/// Round `size` up to the next multiple of `page_size`.
pub(crate) fn page_align(size: usize, page_size: usize) -> Option<usize> {
    size.checked_add(page_size - 1)
        .map(|s| s / page_size * page_size)
}

/// Positional writes into a writable mapping.
///
/// Only installed on read-write environments. Each write grows the file in
/// whole pages when needed, copies into the mapping and synchronously
/// flushes exactly the written range.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WritePath;

impl WritePath {
    /// Write `bytes` at `offset`, returning the number of bytes written.
    ///
    /// The mapping must already cover `offset + bytes.len()`; the file is
    /// grown here, the mapping is not.
    pub(crate) fn write_at(&self, state: &mut FileState, bytes: &[u8], offset: usize) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let len = bytes.len();
        let mapped = state.datasz;
        let end = match offset.checked_add(len) {
            Some(end) if end <= mapped => end,
            _ => return Err(Error::OutOfBounds { offset, len, size: mapped }),
        };
        let target = page_align(end, state.page_size)
            .ok_or(Error::OutOfBounds { offset, len, size: mapped })?;

        if target > state.filesz {
            state
                .file
                .set_len(target as u64)
                .map_err(|source| Error::Resize { size: target as u64, source })?;
            debug!("grew data file from {} to {} bytes", state.filesz, target);
            state.filesz = target;
        }

        let region = state.region.as_mut().ok_or(Error::NotMapped)?;
        let data = region.as_bytes_mut().ok_or(Error::ReadOnly)?;
        data[offset..end].copy_from_slice(bytes);
        region.flush_range(offset, len).map_err(Error::Sync)?;

        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MapFlags;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    fn mapped_state(map_size: usize) -> (TempDir, FileState) {
        let dir = TempDir::new().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("data.db"))
            .unwrap();
        let mut state = FileState::new(file, PAGE, false, MapFlags::empty()).unwrap();
        state.mmap(map_size).unwrap();
        (dir, state)
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0, PAGE), Some(0));
        assert_eq!(page_align(1, PAGE), Some(PAGE));
        assert_eq!(page_align(PAGE, PAGE), Some(PAGE));
        assert_eq!(page_align(8193, PAGE), Some(3 * PAGE));
        assert_eq!(page_align(usize::MAX, PAGE), None);
    }

    #[test]
    fn test_first_write_grows_empty_file_to_one_page() {
        let (_dir, mut state) = mapped_state(32 * 1024);
        assert_eq!(state.file_size(), 0);

        let n = WritePath.write_at(&mut state, b"0123456789", 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(state.file_size(), PAGE);
        assert_eq!(state.file.metadata().unwrap().len(), PAGE as u64);
        assert_eq!(state.data().unwrap().slice(0, 10).unwrap(), b"0123456789");
    }

    #[test]
    fn test_growth_rounds_to_next_page() {
        let (_dir, mut state) = mapped_state(32 * 1024);
        WritePath.write_at(&mut state, &[1u8; PAGE], 0).unwrap();
        assert_eq!(state.file_size(), PAGE);

        WritePath.write_at(&mut state, &[2u8], 8192).unwrap();
        assert_eq!(state.file_size(), 12288);
        assert_eq!(state.file.metadata().unwrap().len(), 12288);
    }

    #[test]
    fn test_file_size_is_monotonic() {
        let (_dir, mut state) = mapped_state(64 * 1024);
        let writes: &[(usize, usize)] = &[
            (5000, 10),
            (0, 1),
            (20000, 4096),
            (100, 3000),
            (24575, 1),
            (24576, 1),
            (8, 8),
        ];

        let mut prev = 0;
        let mut high = 0;
        for &(offset, len) in writes {
            let n = WritePath.write_at(&mut state, &vec![0xAB; len], offset).unwrap();
            assert_eq!(n, len);

            let size = state.file_size();
            high = high.max(offset + len);
            assert!(size >= prev);
            assert!(size >= high);
            assert_eq!(size % PAGE, 0);
            prev = size;
        }
        assert_eq!(prev, 7 * PAGE);
    }

    #[test]
    fn test_write_beyond_mapping_has_no_side_effect() {
        let (_dir, mut state) = mapped_state(32 * 1024);
        let err = WritePath.write_at(&mut state, b"xy", 32 * 1024 - 1).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert_eq!(state.file_size(), 0);
        assert_eq!(state.file.metadata().unwrap().len(), 0);

        let err = WritePath.write_at(&mut state, b"xy", usize::MAX).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }

    #[test]
    fn test_empty_write_is_noop() {
        let (_dir, mut state) = mapped_state(32 * 1024);
        assert_eq!(WritePath.write_at(&mut state, &[], 8192).unwrap(), 0);
        assert_eq!(state.file_size(), 0);
    }

    #[test]
    fn test_write_without_mapping_fails() {
        let (_dir, mut state) = mapped_state(32 * 1024);
        state.munmap();
        let err = WritePath.write_at(&mut state, b"x", 0).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { size: 0, .. }));
    }
}
