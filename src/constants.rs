use std::time::Duration;

use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Open the data file read-only under a shared lock
        const RDONLY = 0x20000;
    }
}

// Mapping flags, passed through to the mapping call
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Pre-fault the mapping (MAP_POPULATE)
        const POPULATE = 0x8000;
    }
}

/// Interval between non-blocking lock attempts
pub const FLOCK_RETRY_TIMEOUT: Duration = Duration::from_millis(50);

/// Fallback page size when the OS cannot report one
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Smallest accepted page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest mapping the environment will request
#[cfg(target_pointer_width = "64")]
pub const MAX_MAP_SIZE: usize = 0xFFFF_FFFF_FFFF; // 256TB
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_MAP_SIZE: usize = 0x7FFF_FFFF; // 2GB

/// Mapping sizes double up to this step, then grow by whole steps
pub const MAX_MMAP_STEP: usize = 1 << 30; // 1GB

/// Smallest mapping size tried by the doubling policy
pub const MIN_MMAP_SHIFT: u32 = 15; // 32KB
