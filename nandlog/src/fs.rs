use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::allocator::AllocState;
use crate::error::{FsError, FsResult};
use crate::file::WriteState;
use crate::flash_dev::FlashDevice;
use crate::inode::InodeIter;
use crate::layout::{
  name_bytes, BlockType, FileSector0Header, FileSectorSpare, FileTailHeader, InodeAllocation,
  InodeInvalidation, InodeSector0Header, InodeSector0Spare, InvalidationHeader,
  BLOCK_AGE_INVALID, BLOCK_IDX_INVALID, FILE_ID_INVALID, INVALIDATION_SECTOR, TAIL_SECTOR,
  TIMESTAMP_INVALID,
};
use crate::page_cache::PageCache;
use crate::{NUM_BLOCKS, SECTOR_SPARE_SIZE};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountState {
  Reset,
  Mounted,
}

/// Directory-level state, guarded by the fs lock.
pub(crate) struct FsState {
  pub state: MountState,
  /// Most recent timestamp; pre-increment when stamping a new operation.
  pub t: u32,
  pub max_file_id: u32,
  pub inode0: u16,
  pub num_files: u32,
  pub mean_block_age: u32,
  /// File ids with an open read handle.
  pub read_files: Vec<u32>,
  /// Open write handles; shared so the dirty-block flush can reach them.
  pub write_files: Vec<Arc<Mutex<WriteState>>>,
}

impl FsState {
  fn new() -> Self {
    Self {
      state: MountState::Reset,
      t: 0,
      max_file_id: 0,
      inode0: BLOCK_IDX_INVALID,
      num_files: 0,
      mean_block_age: 0,
      read_files: Vec::new(),
      write_files: Vec::new(),
    }
  }

  pub fn ensure_mounted(&self) -> FsResult<()> {
    if self.state == MountState::Mounted {
      Ok(())
    } else {
      Err(FsError::NotMounted)
    }
  }
}

/// A log-structured filesystem over one raw NAND device.
///
/// Lock order is `fs`, then any write-handle state, then `cache` (which
/// serializes all driver access), then `alloc`. Public operations take `fs`
/// first, so the inner locks never contend; internal helpers receive the
/// guards they need instead of re-locking.
pub struct LogFs {
  pub(crate) fs: Mutex<FsState>,
  pub(crate) cache: Mutex<PageCache>,
  pub(crate) alloc: Mutex<AllocState>,
}

struct LastAllocation {
  block: u16,
  age: u32,
  file_id: u32,
  timestamp: u32,
}

struct LastDeletion {
  first_block: u16,
  last_block: u16,
  file_id: u32,
  timestamp: u32,
}

impl LogFs {
  /// Bring up the driver and return an unmounted filesystem.
  pub fn init(dev: Arc<dyn FlashDevice>) -> FsResult<LogFs> {
    dev.init()?;
    Ok(LogFs {
      fs: Mutex::new(FsState::new()),
      cache: Mutex::new(PageCache::new(dev)),
      alloc: Mutex::new(AllocState::new()),
    })
  }

  /// Erase every good block and install inode block zero on the first one.
  pub fn format(&self) -> FsResult<()> {
    let mut fs = self.fs.lock();
    let mut cache = self.cache.lock();

    let mut first_valid = BLOCK_IDX_INVALID;
    for block in 0..NUM_BLOCKS {
      if cache.block_bad(block) {
        continue;
      }
      cache.erase_block(block)?;
      if first_valid == BLOCK_IDX_INVALID {
        first_valid = block;
      }
    }
    if first_valid == BLOCK_IDX_INVALID {
      log::error!("no usable block on the device");
      return Err(FsError::Corrupt);
    }

    let hdr = InodeSector0Header { age: 0, timestamp: 0 };
    cache.write_sector(first_valid, 0, 0, &hdr.encode())?;
    let spare = InodeSector0Spare { inode_index: 0 };
    cache.write_spare(first_valid, 0, &spare.encode())?;
    cache.commit()?;

    *fs = FsState::new();
    *self.alloc.lock() = AllocState::new();
    Ok(())
  }

  /// Rebuild in-RAM state from flash alone and repair any half-finished
  /// allocation or deletion. Mounting twice is a no-op.
  pub fn mount(&self) -> FsResult<()> {
    let mut fs = self.fs.lock();
    if fs.state == MountState::Mounted {
      return Ok(());
    }
    let mut cache = self.cache.lock();
    let mut alloc = self.alloc.lock();
    *alloc = AllocState::new();

    let mut last_alloc = LastAllocation {
      block: BLOCK_IDX_INVALID,
      age: 0,
      file_id: FILE_ID_INVALID,
      timestamp: 0,
    };
    let mut last_del = LastDeletion {
      first_block: BLOCK_IDX_INVALID,
      last_block: BLOCK_IDX_INVALID,
      file_id: FILE_ID_INVALID,
      timestamp: 0,
    };
    let mut inode0 = BLOCK_IDX_INVALID;
    let mut free_blocks: u16 = 0;
    let mut max_t: u32 = 0;
    let mut age_sum: u64 = 0;
    let mut aged_blocks: u32 = 0;

    // Pass 1: census of every block from its fixed metadata sectors.
    for block in 0..NUM_BLOCKS {
      if cache.block_bad(block) {
        log::warn!("skipping bad block {}", block);
        continue;
      }
      let mut spare = [0u8; SECTOR_SPARE_SIZE];
      cache.read_spare(block, 0, &mut spare)?;

      let mut inv_buf = [0u8; InvalidationHeader::SIZE];
      match BlockType::from_tag(spare[0]) {
        Some(BlockType::Inode) => {
          let mut buf = [0u8; InodeSector0Header::SIZE];
          cache.read_sector(block, 0, 0, &mut buf)?;
          let hdr = InodeSector0Header::decode(&buf);
          cache.read_sector(block, INVALIDATION_SECTOR, 0, &mut inv_buf)?;
          let inv = InvalidationHeader::decode(&inv_buf);

          if inv.timestamp == TIMESTAMP_INVALID {
            if InodeSector0Spare::decode(&spare).inode_index == 0 {
              inode0 = block;
            }
          } else {
            free_blocks += 1;
            max_t = max_t.max(inv.timestamp);
          }
          if hdr.timestamp != TIMESTAMP_INVALID {
            max_t = max_t.max(hdr.timestamp);
          }
          if hdr.age != BLOCK_AGE_INVALID {
            age_sum += hdr.age as u64;
            aged_blocks += 1;
          }
        }
        Some(BlockType::File) => {
          let mut buf = [0u8; FileSector0Header::SIZE];
          cache.read_sector(block, 0, 0, &mut buf)?;
          let hdr = FileSector0Header::decode(&buf);
          let mut tail_buf = [0u8; FileTailHeader::SIZE];
          cache.read_sector(block, TAIL_SECTOR, 0, &mut tail_buf)?;
          let tail = FileTailHeader::decode(&tail_buf);
          cache.read_sector(block, INVALIDATION_SECTOR, 0, &mut inv_buf)?;
          let inv = InvalidationHeader::decode(&inv_buf);

          if tail.timestamp != TIMESTAMP_INVALID {
            max_t = max_t.max(tail.timestamp);
            if tail.timestamp > last_alloc.timestamp {
              last_alloc = LastAllocation {
                block: tail.next_block,
                age: tail.next_age,
                file_id: hdr.file_id,
                timestamp: tail.timestamp,
              };
            }
          }
          if inv.timestamp != TIMESTAMP_INVALID {
            free_blocks += 1;
            max_t = max_t.max(inv.timestamp);
          }
          if hdr.age != BLOCK_AGE_INVALID {
            age_sum += hdr.age as u64;
            aged_blocks += 1;
          }
        }
        Some(BlockType::Unallocated) => {
          free_blocks += 1;
        }
        None => {
          log::error!("block {} has unrecognized type tag {:#04x}", block, spare[0]);
          return Err(FsError::Corrupt);
        }
      }
    }

    if inode0 == BLOCK_IDX_INVALID {
      log::error!("no inode block zero found");
      return Err(FsError::Corrupt);
    }

    // Pass 2: replay the inode chain for files, ids and the most recent
    // create and delete.
    let mut num_files: u32 = 0;
    let mut max_file_id: u32 = 0;
    let mut iter = InodeIter::init(&mut cache, inode0)?;
    loop {
      let mut buf = [0u8; InodeAllocation::SIZE];
      cache.read_sector(iter.block, iter.sector, 0, &mut buf)?;
      let entry = InodeAllocation::decode(&buf);
      if entry.file_id == FILE_ID_INVALID {
        break;
      }
      max_file_id = entry.file_id;
      max_t = max_t.max(entry.timestamp);

      let mut inv_buf = [0u8; InodeInvalidation::SIZE];
      cache.read_sector(iter.block, iter.sector + 1, 0, &mut inv_buf)?;
      let inv = InodeInvalidation::decode(&inv_buf);
      if inv.timestamp == TIMESTAMP_INVALID {
        num_files += 1;
        if entry.timestamp > last_alloc.timestamp {
          last_alloc = LastAllocation {
            block: entry.first_block,
            age: entry.first_block_age,
            file_id: entry.file_id,
            timestamp: entry.timestamp,
          };
        }
      } else {
        max_t = max_t.max(inv.timestamp);
        if inv.timestamp > last_del.timestamp {
          last_del = LastDeletion {
            first_block: entry.first_block,
            last_block: inv.last_block,
            file_id: entry.file_id,
            timestamp: inv.timestamp,
          };
        }
      }

      let at = (iter.block, iter.sector);
      iter.next(&mut cache)?;
      if (iter.block, iter.sector) == at {
        break;
      }
    }

    fs.t = max_t;
    fs.inode0 = inode0;
    fs.max_file_id = max_file_id;
    fs.num_files = num_files;
    fs.mean_block_age = if aged_blocks > 0 { (age_sum / aged_blocks as u64) as u32 } else { 0 };
    alloc.free_blocks = free_blocks;

    // A block can be named by a tail or inode entry and yet never have
    // been headed; finish that allocation now.
    if last_alloc.timestamp > 0 {
      let mut buf = [0u8; FileSector0Header::SIZE];
      cache.read_sector(last_alloc.block, 0, 0, &mut buf)?;
      if FileSector0Header::decode(&buf).file_id != last_alloc.file_id {
        log::warn!(
          "finishing interrupted allocation of block {} for file {}",
          last_alloc.block,
          last_alloc.file_id
        );
        cache.erase_block(last_alloc.block)?;
        let hdr = FileSector0Header { age: last_alloc.age, file_id: last_alloc.file_id };
        cache.write_sector(last_alloc.block, 0, 0, &hdr.encode())?;
        let spare = FileSectorSpare { nbytes: 0 };
        cache.write_spare(last_alloc.block, 0, &spare.encode())?;
        cache.commit()?;
        alloc.free_blocks -= 1;
      }
    }

    // A deletion commits its inode invalidation first; if the chain walk
    // behind it was cut short, redo it.
    if last_del.timestamp > 0 {
      let mut buf = [0u8; FileSector0Header::SIZE];
      cache.read_sector(last_del.last_block, 0, 0, &mut buf)?;
      if FileSector0Header::decode(&buf).file_id == last_del.file_id {
        let mut inv_buf = [0u8; InvalidationHeader::SIZE];
        cache.read_sector(last_del.last_block, INVALIDATION_SECTOR, 0, &mut inv_buf)?;
        if InvalidationHeader::decode(&inv_buf).timestamp == TIMESTAMP_INVALID {
          log::warn!("finishing interrupted deletion of file {}", last_del.file_id);
          invalidate_chain(&mut fs, &mut cache, &mut alloc, last_del.first_block)?;
        }
      }
    }

    fs.state = MountState::Mounted;
    Ok(())
  }

  /// Remove a file by name. Removing an absent name succeeds.
  pub fn rm(&self, name: &str) -> FsResult<()> {
    let name = name_bytes(name)?;
    let mut fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();

    let (iter, found) = crate::inode::find_file(&mut cache, fs.inode0, &name)?;
    let found = match found {
      Some(f) => f,
      None => return Ok(()),
    };

    let mut last_block = found.first_block;
    loop {
      let next = cache.next_block_of(last_block)?;
      if next == BLOCK_IDX_INVALID {
        break;
      }
      last_block = next;
    }

    fs.t += 1;
    let inv = InodeInvalidation { timestamp: fs.t, last_block };
    cache.write_sector(iter.block, iter.sector + 1, 0, &inv.encode())?;
    cache.commit()?;

    // From here a power cut is repaired during mount.
    let mut alloc = self.alloc.lock();
    invalidate_chain(&mut fs, &mut cache, &mut alloc, found.first_block)?;
    fs.num_files -= 1;
    Ok(())
  }

  /// Begin a directory listing.
  pub fn start_ls(&self) -> FsResult<Ls<'_>> {
    let fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();
    let iter = InodeIter::init(&mut cache, fs.inode0)?;
    Ok(Ls { fs: self, iter, done: false })
  }

  /// All live filenames, in directory order.
  pub fn ls(&self) -> FsResult<Vec<String>> {
    let fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();

    let mut names = Vec::new();
    let mut iter = InodeIter::init(&mut cache, fs.inode0)?;
    let mut done = false;
    while !done {
      if let Some(name) = next_live_entry(&mut cache, &mut iter, &mut done)? {
        names.push(name);
      }
    }
    Ok(names)
  }

  /// One step of the background preallocator: scan a block and remember it
  /// if it could be claimed. Cheap enough to call whenever idle.
  pub fn preallocate(&self) -> FsResult<()> {
    let fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();
    let mut alloc = self.alloc.lock();
    alloc.prealloc_iterate(&mut cache)
  }

  pub fn is_mounted(&self) -> bool {
    self.fs.lock().state == MountState::Mounted
  }

  pub fn free_blocks(&self) -> u16 {
    self.alloc.lock().free_blocks
  }

  pub fn num_files(&self) -> u32 {
    self.fs.lock().num_files
  }

  /// Advisory average header age seen at mount time.
  pub fn mean_block_age(&self) -> u32 {
    self.fs.lock().mean_block_age
  }
}

/// Walk a block chain from `base`, writing an invalidation header into
/// every block that does not have one yet. Already-invalidated blocks are
/// skipped; a stored successor age of all-1s marks the end of the chain.
pub(crate) fn invalidate_chain(
  fs: &mut FsState,
  cache: &mut PageCache,
  alloc: &mut AllocState,
  base: u16,
) -> FsResult<()> {
  let mut block = base;
  loop {
    let mut tail_buf = [0u8; FileTailHeader::SIZE];
    cache.read_sector(block, TAIL_SECTOR, 0, &mut tail_buf)?;
    let tail = FileTailHeader::decode(&tail_buf);

    let mut inv_buf = [0u8; InvalidationHeader::SIZE];
    cache.read_sector(block, INVALIDATION_SECTOR, 0, &mut inv_buf)?;
    let inv = InvalidationHeader::decode(&inv_buf);

    if inv.timestamp != TIMESTAMP_INVALID {
      if inv.next_age == BLOCK_AGE_INVALID || tail.next_block == BLOCK_IDX_INVALID {
        return Ok(());
      }
      block = tail.next_block;
      continue;
    }

    fs.t += 1;
    let inv = InvalidationHeader { timestamp: fs.t, next_age: tail.next_age };
    cache.write_sector(block, INVALIDATION_SECTOR, 0, &inv.encode())?;
    cache.commit()?;
    alloc.free_blocks += 1;

    if tail.next_block == BLOCK_IDX_INVALID {
      return Ok(());
    }
    block = tail.next_block;
  }
}

/// Advance `iter` to the next live entry and return its name. Sets `done`
/// once the directory is exhausted. Shared by `ls` and `Ls`.
fn next_live_entry(
  cache: &mut PageCache,
  iter: &mut InodeIter,
  done: &mut bool,
) -> FsResult<Option<String>> {
  loop {
    let mut buf = [0u8; InodeAllocation::SIZE];
    cache.read_sector(iter.block, iter.sector, 0, &mut buf)?;
    let entry = InodeAllocation::decode(&buf);
    if entry.file_id == FILE_ID_INVALID {
      *done = true;
      return Ok(None);
    }

    let mut inv_buf = [0u8; InodeInvalidation::SIZE];
    cache.read_sector(iter.block, iter.sector + 1, 0, &mut inv_buf)?;
    let live = InodeInvalidation::decode(&inv_buf).timestamp == TIMESTAMP_INVALID;

    let at = (iter.block, iter.sector);
    iter.next(cache)?;
    if (iter.block, iter.sector) == at {
      *done = true;
    }

    if live {
      return Ok(Some(String::from(entry.name_str()?)));
    }
    if *done {
      return Ok(None);
    }
  }
}

/// An in-progress directory listing.
pub struct Ls<'a> {
  fs: &'a LogFs,
  iter: InodeIter,
  done: bool,
}

impl Ls<'_> {
  /// Next live filename, or `None` once the directory is exhausted.
  pub fn next_name(&mut self) -> FsResult<Option<String>> {
    if self.done {
      return Ok(None);
    }
    let _fs = self.fs.fs.lock();
    let mut cache = self.fs.cache.lock();
    next_live_entry(&mut cache, &mut self.iter, &mut self.done)
  }
}
