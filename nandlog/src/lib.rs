#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod error;
mod flash_dev;
mod page_cache;
mod layout;
mod allocator;
mod inode;
mod fs;
mod file;

pub use error::{FsError, FsResult};
pub use flash_dev::{FlashDevice, FlashError, FlashResult};
pub use fs::{LogFs, Ls};
pub use file::{ReadFile, WriteFile};

/// Geometry of the attached flash part, fixed per build.
pub const NUM_BLOCKS: u16 = 64;
pub const PAGES_PER_BLOCK: u16 = 16;
pub const SECTORS_PER_PAGE: u16 = 4;
pub const SECTORS_PER_BLOCK: u16 = PAGES_PER_BLOCK * SECTORS_PER_PAGE;
pub const SECTOR_SIZE: usize = 256;
pub const SECTOR_SPARE_SIZE: usize = 4;

/// Depth of the young-block preallocation list.
pub const PREALLOC_SIZE: usize = 8;
/// Stored filenames are zero-padded to this length, so the last byte stays 0.
pub const MAX_FNAME_LEN: usize = 32;

/// Payload bytes a fully written block carries: every sector except the
/// invalidation sector, minus the sector-0 and tail headers.
pub const BLOCK_CAPACITY: usize = (SECTOR_SIZE - layout::FileSector0Header::SIZE)
  + (SECTORS_PER_BLOCK as usize - 3) * SECTOR_SIZE
  + (SECTOR_SIZE - layout::FileTailHeader::SIZE);
