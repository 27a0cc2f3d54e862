//! The inode chain: a linked list of inode blocks rooted at block
//! `inode0`, holding one (allocation, invalidation) sector pair per file.

use crate::allocator::AllocState;
use crate::error::{FsError, FsResult};
use crate::file::flush_dirty;
use crate::fs::FsState;
use crate::layout::{
  InodeAllocation, InodeInvalidation, InodeSector0Header, InodeSector0Spare, InodeTailHeader,
  BLOCK_IDX_INVALID, FILE_ID_INVALID, INODE_FIRST_ENTRY_SECTOR, INODE_LAST_ENTRY_SECTOR,
  TAIL_SECTOR, TIMESTAMP_INVALID,
};
use crate::page_cache::PageCache;
use crate::MAX_FNAME_LEN;

/// Cursor over inode entry slots, in chain order.
pub struct InodeIter {
  pub block: u16,
  pub next_block: u16,
  /// Allocation sector of the current slot; the invalidation sector is
  /// the one after it.
  pub sector: u16,
  pub inode_block_idx: u16,
}

impl InodeIter {
  pub fn init(cache: &mut PageCache, inode0: u16) -> FsResult<Self> {
    let next_block = cache.next_block_of(inode0)?;
    let mut spare = [0u8; crate::SECTOR_SPARE_SIZE];
    cache.read_spare(inode0, 0, &mut spare)?;
    Ok(Self {
      block: inode0,
      next_block,
      sector: INODE_FIRST_ENTRY_SECTOR,
      inode_block_idx: InodeSector0Spare::decode(&spare).inode_index,
    })
  }

  /// Advance to the next slot, following the chain across block
  /// boundaries. Without a successor the iterator stays parked on the
  /// last slot; `prepare_new` must run before that slot is written.
  pub fn next(&mut self, cache: &mut PageCache) -> FsResult<()> {
    self.sector += 2;
    if self.sector > INODE_LAST_ENTRY_SECTOR {
      if self.next_block != BLOCK_IDX_INVALID {
        self.block = self.next_block;
        self.next_block = cache.next_block_of(self.block)?;
        self.sector = INODE_FIRST_ENTRY_SECTOR;
      } else {
        log::warn!("inode iterator ran past the last slot of block {}", self.block);
        self.sector -= 2;
      }
    }
    Ok(())
  }

  /// Make the slot under the cursor writable. Writing the final slot of a
  /// block is the moment its successor is allocated and linked, so a full
  /// block always names the next one before its last entry exists.
  pub fn prepare_new(
    &mut self,
    fs: &mut FsState,
    cache: &mut PageCache,
    alloc: &mut AllocState,
  ) -> FsResult<()> {
    if self.sector != INODE_LAST_ENTRY_SECTOR {
      return Ok(());
    }
    if self.next_block != BLOCK_IDX_INVALID {
      log::warn!("inode block {} already has a successor", self.block);
      return Ok(());
    }

    flush_dirty(fs, cache, alloc, None)?;
    let new = alloc.allocate_block(cache)?.ok_or(FsError::NoSpace)?;

    fs.t += 1;
    let tail = InodeTailHeader { next_block: new.block, next_age: new.age + 1, timestamp: fs.t };
    cache.write_sector(self.block, TAIL_SECTOR, 0, &tail.encode())?;
    cache.commit()?;

    cache.erase_block(new.block)?;
    let hdr = InodeSector0Header { age: new.age + 1, timestamp: fs.t };
    cache.write_sector(new.block, 0, 0, &hdr.encode())?;
    self.inode_block_idx += 1;
    let spare = InodeSector0Spare { inode_index: self.inode_block_idx };
    cache.write_spare(new.block, 0, &spare.encode())?;
    cache.commit()?;

    self.next_block = new.block;
    Ok(())
  }
}

/// A live directory entry.
pub struct FileFind {
  pub file_id: u32,
  pub first_block: u16,
}

/// Walk the inode chain for a live entry with this name. On a miss the
/// returned iterator points at the first free slot, ready for the writer.
pub fn find_file(
  cache: &mut PageCache,
  inode0: u16,
  name: &[u8; MAX_FNAME_LEN],
) -> FsResult<(InodeIter, Option<FileFind>)> {
  let mut iter = InodeIter::init(cache, inode0)?;
  loop {
    let mut buf = [0u8; InodeAllocation::SIZE];
    cache.read_sector(iter.block, iter.sector, 0, &mut buf)?;
    let entry = InodeAllocation::decode(&buf);
    if entry.file_id == FILE_ID_INVALID {
      return Ok((iter, None));
    }
    if entry.name_matches(name) {
      let mut buf = [0u8; InodeInvalidation::SIZE];
      cache.read_sector(iter.block, iter.sector + 1, 0, &mut buf)?;
      if InodeInvalidation::decode(&buf).timestamp == TIMESTAMP_INVALID {
        let found = FileFind { file_id: entry.file_id, first_block: entry.first_block };
        return Ok((iter, Some(found)));
      }
    }
    let at = (iter.block, iter.sector);
    iter.next(cache)?;
    if (iter.block, iter.sector) == at {
      // parked on a full chain with no free slot and no terminator
      return Ok((iter, None));
    }
  }
}
