use alloc::sync::Arc;
use spin::Mutex;

use crate::error::FsResult;
use crate::file::WriteState;
use crate::layout::{
  InvalidationHeader, BLOCK_AGE_INVALID, INVALIDATION_SECTOR, TIMESTAMP_INVALID,
};
use crate::page_cache::PageCache;
use crate::{NUM_BLOCKS, PREALLOC_SIZE};

/// A claimable block and the age its header carried (0 for virgin blocks).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockAlloc {
  pub block: u16,
  pub age: u32,
}

/// Bounded list of erasable blocks kept sorted by ascending age, so pops
/// hand out the youngest block first.
pub struct Prealloc {
  blocks: [BlockAlloc; PREALLOC_SIZE],
  n: usize,
  age_sum: u32,
}

impl Prealloc {
  pub fn new() -> Self {
    Self {
      blocks: [BlockAlloc { block: crate::layout::BLOCK_IDX_INVALID, age: 0 }; PREALLOC_SIZE],
      n: 0,
      age_sum: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.n
  }

  pub fn age_sum(&self) -> u32 {
    self.age_sum
  }

  /// Insert a candidate, keeping ascending age order. A candidate older
  /// than everything in a full list is dropped, and a full list evicts its
  /// oldest entry to make room. Re-offering a listed block is a no-op.
  pub fn push(&mut self, block: u16, age: u32) {
    if self.blocks[..self.n].iter().any(|b| b.block == block) {
      return;
    }
    if self.n == PREALLOC_SIZE && self.blocks[self.n - 1].age <= age {
      return;
    }
    if self.n == PREALLOC_SIZE {
      self.age_sum -= self.blocks[self.n - 1].age;
      self.n -= 1;
    }
    let pos = self.blocks[..self.n].iter().position(|b| age < b.age).unwrap_or(self.n);
    let mut i = self.n;
    while i > pos {
      self.blocks[i] = self.blocks[i - 1];
      i -= 1;
    }
    self.blocks[pos] = BlockAlloc { block, age };
    self.n += 1;
    self.age_sum += age;
  }

  /// Remove and return the youngest entry.
  pub fn pop(&mut self) -> Option<BlockAlloc> {
    if self.n == 0 {
      return None;
    }
    let out = self.blocks[0];
    self.n -= 1;
    for i in 0..self.n {
      self.blocks[i] = self.blocks[i + 1];
    }
    self.age_sum -= out.age;
    Some(out)
  }
}

/// The one allocation that has happened in RAM but is not yet reflected by
/// a block header on flash. Holding the write handle lets the allocator
/// flush it before the next allocation.
pub struct DirtyBlock {
  pub block: u16,
  /// Successors claimed at a tail commit are erased only when their first
  /// sector is committed.
  pub erased: bool,
  pub file: Arc<Mutex<WriteState>>,
}

/// Allocator state, guarded by the allocate lock.
pub struct AllocState {
  pub head: u16,
  pub free_blocks: u16,
  pub prealloc: Prealloc,
  pub dirty: Option<DirtyBlock>,
}

impl AllocState {
  pub fn new() -> Self {
    Self { head: 0, free_blocks: 0, prealloc: Prealloc::new(), dirty: None }
  }

  /// Examine the block under the scan cursor and advance the cursor.
  ///
  /// A block is a candidate when its sector-0 age was never written
  /// (virgin, age 0) or when its invalidation sector carries a timestamp
  /// (reclaimable at its stored age).
  pub fn allocate_iterate(&mut self, cache: &mut PageCache) -> FsResult<Option<BlockAlloc>> {
    let block = self.head;
    self.head = (self.head + 1) % NUM_BLOCKS;

    if cache.block_bad(block) {
      return Ok(None);
    }
    let mut buf = [0u8; 4];
    cache.read_sector(block, 0, 0, &mut buf)?;
    let age = u32::from_le_bytes(buf);
    if age == BLOCK_AGE_INVALID {
      return Ok(Some(BlockAlloc { block, age: 0 }));
    }

    let mut buf = [0u8; InvalidationHeader::SIZE];
    cache.read_sector(block, INVALIDATION_SECTOR, 0, &mut buf)?;
    if InvalidationHeader::decode(&buf).timestamp != TIMESTAMP_INVALID {
      return Ok(Some(BlockAlloc { block, age }));
    }
    Ok(None)
  }

  /// Claim a free block, preferring the preallocation list. The caller
  /// erases the block before use.
  pub fn allocate_block(&mut self, cache: &mut PageCache) -> FsResult<Option<BlockAlloc>> {
    if self.free_blocks == 0 {
      return Ok(None);
    }
    if let Some(b) = self.prealloc.pop() {
      self.free_blocks -= 1;
      return Ok(Some(b));
    }
    for _ in 0..NUM_BLOCKS {
      if let Some(b) = self.allocate_iterate(cache)? {
        self.free_blocks -= 1;
        return Ok(Some(b));
      }
    }
    Ok(None)
  }

  /// One idle-time step of the preallocator: scan a block and, if it is
  /// claimable, remember it for later.
  pub fn prealloc_iterate(&mut self, cache: &mut PageCache) -> FsResult<()> {
    if let Some(b) = self.allocate_iterate(cache)? {
      if self.dirty.as_ref().map_or(true, |d| d.block != b.block) {
        self.prealloc.push(b.block, b.age);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn push_keeps_ascending_age_order() {
    let mut p = Prealloc::new();
    p.push(10, 5);
    p.push(11, 2);
    p.push(12, 9);
    p.push(13, 2);
    assert_eq!(p.len(), 4);
    let mut last = 0;
    while let Some(b) = p.pop() {
      assert!(b.age >= last);
      last = b.age;
    }
  }

  #[test]
  fn full_list_rejects_older_candidates() {
    let mut p = Prealloc::new();
    for i in 0..PREALLOC_SIZE as u16 {
      p.push(i, 1);
    }
    assert_eq!(p.len(), PREALLOC_SIZE);
    p.push(100, 50);
    assert_eq!(p.len(), PREALLOC_SIZE);
    let mut seen_old = false;
    while let Some(b) = p.pop() {
      seen_old |= b.block == 100;
    }
    assert!(!seen_old);
  }

  #[test]
  fn full_list_evicts_oldest_for_a_young_candidate() {
    let mut p = Prealloc::new();
    for i in 0..PREALLOC_SIZE as u16 {
      p.push(i, 10 + i as u32);
    }
    p.push(100, 1);
    assert_eq!(p.len(), PREALLOC_SIZE);
    assert_eq!(p.pop(), Some(BlockAlloc { block: 100, age: 1 }));
  }

  #[test]
  fn age_sum_tracks_contents() {
    let mut p = Prealloc::new();
    p.push(1, 4);
    p.push(2, 6);
    assert_eq!(p.age_sum(), 10);
    p.pop();
    assert_eq!(p.age_sum(), 6);
    p.pop();
    assert_eq!(p.age_sum(), 0);
  }

  #[test]
  fn duplicate_blocks_are_not_listed_twice() {
    let mut p = Prealloc::new();
    p.push(7, 3);
    p.push(7, 3);
    assert_eq!(p.len(), 1);
  }
}
