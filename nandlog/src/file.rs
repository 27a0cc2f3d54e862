use alloc::sync::Arc;
use spin::Mutex;

use crate::allocator::{AllocState, DirtyBlock};
use crate::error::{FsError, FsResult};
use crate::fs::{FsState, LogFs};
use crate::inode::find_file;
use crate::layout::{
  increment_sector, name_bytes, FileSector0Header, FileSectorSpare, FileTailHeader,
  InodeAllocation, BLOCK_IDX_INVALID, SECTOR_NBYTES_INVALID, TAIL_SECTOR, TIMESTAMP_INVALID,
};
use crate::page_cache::PageCache;
use crate::{SECTOR_SIZE, SECTOR_SPARE_SIZE};

/// Position and buffer of one open writer. Kept behind `Arc<Mutex<_>>`
/// so the allocator can flush the dirty block's owner.
pub(crate) struct WriteState {
  pub id: u32,
  pub block: u16,
  pub block_age: u32,
  pub sector: u16,
  /// Next byte to fill within the sector, header included.
  pub offset: usize,
  pub sector_remaining: usize,
  pub bytes_in_block: u32,
  pub write_head: u32,
  pub buffer: [u8; SECTOR_SIZE],
}

/// Append-only write handle. Dropping it closes with a best-effort flush;
/// call `close` to observe flush errors.
pub struct WriteFile<'a> {
  fs: &'a LogFs,
  state: Arc<Mutex<WriteState>>,
  closed: bool,
}

/// Sequential read handle.
pub struct ReadFile<'a> {
  fs: &'a LogFs,
  id: u32,
  block: u16,
  sector: u16,
  offset: usize,
  sector_remaining: usize,
  read_head: u32,
  closed: bool,
}

impl LogFs {
  /// Open an existing file for sequential reading.
  pub fn open_read(&self, name: &str) -> FsResult<ReadFile<'_>> {
    let name = name_bytes(name)?;
    let mut fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();

    let (_, found) = find_file(&mut cache, fs.inode0, &name)?;
    let found = found.ok_or(FsError::NotFound)?;

    // Data begins in sector 0 unless that sector was committed empty.
    let mut spare = [0u8; SECTOR_SPARE_SIZE];
    cache.read_spare(found.first_block, 0, &mut spare)?;
    let nbytes0 = FileSectorSpare::decode(&spare).nbytes;
    let (sector, offset, remaining) = if nbytes0 == 0 {
      cache.read_spare(found.first_block, 1, &mut spare)?;
      let nbytes1 = FileSectorSpare::decode(&spare).nbytes;
      let remaining = if nbytes1 == SECTOR_NBYTES_INVALID { 0 } else { nbytes1 as usize };
      (1, 0, remaining)
    } else if nbytes0 == SECTOR_NBYTES_INVALID {
      // headed but never committed; everything is still in a write buffer
      (0, FileSector0Header::SIZE, 0)
    } else {
      (0, FileSector0Header::SIZE, nbytes0 as usize)
    };

    fs.read_files.push(found.file_id);
    Ok(ReadFile {
      fs: self,
      id: found.file_id,
      block: found.first_block,
      sector,
      offset,
      sector_remaining: remaining,
      read_head: 0,
      closed: false,
    })
  }

  /// Open a file for appending, creating it if it does not exist.
  pub fn open_write(&self, name: &str) -> FsResult<WriteFile<'_>> {
    let name = name_bytes(name)?;
    let mut fs = self.fs.lock();
    fs.ensure_mounted()?;
    let mut cache = self.cache.lock();

    let (mut iter, found) = find_file(&mut cache, fs.inode0, &name)?;

    let state = if let Some(found) = found {
      // Walk sealed blocks, then scan the unsealed one for the first
      // untouched sector.
      let mut block = found.first_block;
      let mut write_head: u32 = 0;
      loop {
        let mut buf = [0u8; FileTailHeader::SIZE];
        cache.read_sector(block, TAIL_SECTOR, 0, &mut buf)?;
        let tail = FileTailHeader::decode(&buf);
        if tail.timestamp == TIMESTAMP_INVALID {
          break;
        }
        if tail.next_block == BLOCK_IDX_INVALID {
          return Err(FsError::Corrupt);
        }
        write_head += tail.bytes_in_block;
        block = tail.next_block;
      }

      let mut buf = [0u8; FileSector0Header::SIZE];
      cache.read_sector(block, 0, 0, &mut buf)?;
      let block_age = FileSector0Header::decode(&buf).age;

      let mut sector = 0u16;
      let mut bytes_in_block: u32 = 0;
      let offset;
      loop {
        let mut spare = [0u8; SECTOR_SPARE_SIZE];
        cache.read_spare(block, sector, &mut spare)?;
        let nbytes = FileSectorSpare::decode(&spare).nbytes;
        if nbytes == SECTOR_NBYTES_INVALID {
          offset = match sector {
            0 => FileSector0Header::SIZE,
            TAIL_SECTOR => FileTailHeader::SIZE,
            _ => 0,
          };
          break;
        }
        if sector == TAIL_SECTOR {
          // a written tail spare under an unwritten tail header
          return Err(FsError::Corrupt);
        }
        write_head += nbytes as u32;
        bytes_in_block += nbytes as u32;
        sector = increment_sector(sector);
      }

      Arc::new(Mutex::new(WriteState {
        id: found.file_id,
        block,
        block_age,
        sector,
        offset,
        sector_remaining: SECTOR_SIZE - offset,
        bytes_in_block,
        write_head,
        buffer: [0xFF; SECTOR_SIZE],
      }))
    } else {
      // the slot under the iterator must really be free
      let mut id_buf = [0u8; 4];
      cache.read_sector(iter.block, iter.sector, 0, &mut id_buf)?;
      if u32::from_le_bytes(id_buf) != crate::layout::FILE_ID_INVALID {
        return Err(FsError::Corrupt);
      }

      let mut alloc = self.alloc.lock();
      iter.prepare_new(&mut fs, &mut cache, &mut alloc)?;

      flush_dirty(&mut fs, &mut cache, &mut alloc, None)?;
      let new = alloc.allocate_block(&mut cache)?.ok_or(FsError::NoSpace)?;

      fs.max_file_id += 1;
      fs.t += 1;
      let state = Arc::new(Mutex::new(WriteState {
        id: fs.max_file_id,
        block: new.block,
        block_age: new.age + 1,
        sector: 0,
        offset: FileSector0Header::SIZE,
        sector_remaining: SECTOR_SIZE - FileSector0Header::SIZE,
        bytes_in_block: 0,
        write_head: 0,
        buffer: [0xFF; SECTOR_SIZE],
      }));
      // The block only becomes real once its header is committed; until
      // then it is the one dirty block.
      alloc.dirty = Some(DirtyBlock { block: new.block, erased: false, file: state.clone() });
      drop(alloc);

      let entry = InodeAllocation {
        file_id: fs.max_file_id,
        first_block: new.block,
        first_block_age: new.age + 1,
        timestamp: fs.t,
        filename: name,
      };
      cache.write_sector(iter.block, iter.sector, 0, &entry.encode())?;
      cache.commit()?;
      cache.erase_block(new.block)?;
      if let Some(d) = self.alloc.lock().dirty.as_mut() {
        d.erased = true;
      }

      fs.num_files += 1;
      state
    };

    fs.write_files.push(state.clone());
    Ok(WriteFile { fs: self, state, closed: false })
  }
}

impl WriteFile<'_> {
  /// Append bytes. Returns how many were accepted; fewer than requested
  /// means the device ran out of blocks or failed.
  pub fn write(&mut self, mut src: &[u8]) -> FsResult<usize> {
    let mut fs = self.fs.fs.lock();
    let mut state = self.state.lock();
    let mut cache = self.fs.cache.lock();

    let mut count = 0;
    while !src.is_empty() {
      if src.len() >= state.sector_remaining {
        let n = state.sector_remaining;
        let mut alloc = self.fs.alloc.lock();
        let r = commit_file_sector(
          &mut fs,
          &mut cache,
          &mut alloc,
          &self.state,
          &mut state,
          &src[..n],
        );
        if r.is_err() {
          break;
        }
        src = &src[n..];
        count += n;
      } else {
        let off = state.offset;
        state.buffer[off..off + src.len()].copy_from_slice(src);
        state.offset += src.len();
        state.sector_remaining -= src.len();
        state.bytes_in_block += src.len() as u32;
        state.write_head += src.len() as u32;
        count += src.len();
        src = &[];
      }
    }
    Ok(count)
  }

  /// Commit the partially filled sector so everything written so far is
  /// on flash.
  pub fn flush(&mut self) -> FsResult<()> {
    let mut fs = self.fs.fs.lock();
    let mut state = self.state.lock();
    let mut cache = self.fs.cache.lock();
    let mut alloc = self.fs.alloc.lock();
    commit_file_sector(&mut fs, &mut cache, &mut alloc, &self.state, &mut state, &[])
  }

  /// Bytes accepted since open.
  pub fn position(&self) -> u32 {
    self.state.lock().write_head
  }

  /// Flush and release the handle.
  pub fn close(mut self) -> FsResult<()> {
    self.close_inner()
  }

  fn close_inner(&mut self) -> FsResult<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    let mut fs = self.fs.fs.lock();
    let mut state = self.state.lock();
    let mut cache = self.fs.cache.lock();
    let mut alloc = self.fs.alloc.lock();
    let r = commit_file_sector(&mut fs, &mut cache, &mut alloc, &self.state, &mut state, &[]);
    drop(state);

    if let Some(at) = fs.write_files.iter().position(|w| Arc::ptr_eq(w, &self.state)) {
      fs.write_files.remove(at);
    }
    r
  }
}

impl Drop for WriteFile<'_> {
  fn drop(&mut self) {
    let _ = self.close_inner();
  }
}

impl ReadFile<'_> {
  /// Read up to `dst.len()` bytes; a short count is end of file.
  pub fn read(&mut self, dst: &mut [u8]) -> FsResult<usize> {
    let _fs = self.fs.fs.lock();
    let mut cache = self.fs.cache.lock();

    let mut count = 0;
    while count < dst.len() {
      if self.sector_remaining == 0 {
        if !self.advance(&mut cache)? {
          break;
        }
        continue;
      }
      let n = (dst.len() - count).min(self.sector_remaining);
      cache.read_sector(self.block, self.sector, self.offset, &mut dst[count..count + n])?;
      count += n;
      self.offset += n;
      self.sector_remaining -= n;
      self.read_head += n as u32;
    }
    Ok(count)
  }

  /// Step to the next sector with data, crossing into the successor block
  /// from the tail. Returns false at end of file.
  fn advance(&mut self, cache: &mut PageCache) -> FsResult<bool> {
    if self.sector == TAIL_SECTOR {
      let mut buf = [0u8; FileTailHeader::SIZE];
      cache.read_sector(self.block, TAIL_SECTOR, 0, &mut buf)?;
      let next = FileTailHeader::decode(&buf).next_block;
      if next == BLOCK_IDX_INVALID {
        return Ok(false);
      }
      let mut buf = [0u8; FileSector0Header::SIZE];
      cache.read_sector(next, 0, 0, &mut buf)?;
      if FileSector0Header::decode(&buf).file_id != self.id {
        // the successor was named but never written
        return Ok(false);
      }

      let mut spare = [0u8; SECTOR_SPARE_SIZE];
      cache.read_spare(next, 0, &mut spare)?;
      let nbytes0 = FileSectorSpare::decode(&spare).nbytes;
      self.block = next;
      if nbytes0 == 0 {
        cache.read_spare(next, 1, &mut spare)?;
        let nbytes1 = FileSectorSpare::decode(&spare).nbytes;
        if nbytes1 == SECTOR_NBYTES_INVALID {
          return Ok(false);
        }
        self.sector = 1;
        self.offset = 0;
        self.sector_remaining = nbytes1 as usize;
      } else if nbytes0 == SECTOR_NBYTES_INVALID {
        return Ok(false);
      } else {
        self.sector = 0;
        self.offset = FileSector0Header::SIZE;
        self.sector_remaining = nbytes0 as usize;
      }
      return Ok(true);
    }

    let next = increment_sector(self.sector);
    let mut spare = [0u8; SECTOR_SPARE_SIZE];
    cache.read_spare(self.block, next, &mut spare)?;
    let nbytes = FileSectorSpare::decode(&spare).nbytes;
    if nbytes == SECTOR_NBYTES_INVALID {
      return Ok(false);
    }
    self.sector = next;
    self.offset = if next == TAIL_SECTOR { FileTailHeader::SIZE } else { 0 };
    self.sector_remaining = nbytes as usize;
    Ok(true)
  }

  /// Random access is not part of the format.
  pub fn seek(&mut self, _pos: u32) -> FsResult<()> {
    Err(FsError::Unsupported)
  }

  /// Bytes returned since open.
  pub fn position(&self) -> u32 {
    self.read_head
  }

  /// Release the handle. Closing twice is a no-op.
  pub fn close(mut self) -> FsResult<()> {
    self.close_inner();
    Ok(())
  }

  fn close_inner(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    let mut fs = self.fs.fs.lock();
    if let Some(at) = fs.read_files.iter().position(|&id| id == self.id) {
      fs.read_files.remove(at);
    }
  }
}

impl Drop for ReadFile<'_> {
  fn drop(&mut self) {
    self.close_inner();
  }
}

/// Commit the handle's current sector, `data` being the bytes that top it
/// off (empty for a flush).
///
/// A non-tail commit programs the buffered prefix, the new bytes and the
/// spare, then steps to the next sector. Committing the tail first needs a
/// successor block: the tail header names it, which is also what makes the
/// block sealed. The successor becomes the new dirty block and the handle
/// restarts on its sector 0.
pub(crate) fn commit_file_sector(
  fs: &mut FsState,
  cache: &mut PageCache,
  alloc: &mut AllocState,
  file: &Arc<Mutex<WriteState>>,
  state: &mut WriteState,
  data: &[u8],
) -> FsResult<()> {
  let n = data.len();
  if state.sector == TAIL_SECTOR {
    flush_dirty(fs, cache, alloc, Some(file))?;
    let next = alloc.allocate_block(cache)?.ok_or(FsError::NoSpace)?;
    alloc.dirty = Some(DirtyBlock { block: next.block, erased: false, file: file.clone() });

    fs.t += 1;
    state.bytes_in_block += n as u32;
    let hdr = FileTailHeader {
      next_block: next.block,
      next_age: next.age + 1,
      timestamp: fs.t,
      bytes_in_block: state.bytes_in_block,
    };
    state.buffer[..FileTailHeader::SIZE].copy_from_slice(&hdr.encode());
    let spare = FileSectorSpare {
      nbytes: (state.offset - FileTailHeader::SIZE + n) as u16,
    };

    let off = state.offset;
    cache.write_sector(state.block, TAIL_SECTOR, 0, &state.buffer[..off])?;
    if n > 0 {
      cache.write_sector(state.block, TAIL_SECTOR, off, data)?;
    }
    cache.write_spare(state.block, TAIL_SECTOR, &spare.encode())?;
    cache.commit()?;

    state.block = next.block;
    state.block_age = next.age + 1;
    state.sector = 0;
    state.offset = FileSector0Header::SIZE;
    state.sector_remaining = SECTOR_SIZE - FileSector0Header::SIZE;
    state.bytes_in_block = 0;
    state.write_head += n as u32;
    state.buffer.fill(0xFF);
  } else {
    // This commit is what turns the dirty block into a real file block,
    // erasing it first if the tail-commit allocation left that pending.
    if alloc.dirty.as_ref().map_or(false, |d| Arc::ptr_eq(&d.file, file)) {
      if let Some(d) = alloc.dirty.take() {
        if !d.erased {
          cache.erase_block(state.block)?;
        }
      }
    }

    let payload = if state.sector == 0 {
      let hdr = FileSector0Header { age: state.block_age, file_id: state.id };
      state.buffer[..FileSector0Header::SIZE].copy_from_slice(&hdr.encode());
      state.offset - FileSector0Header::SIZE + n
    } else {
      state.offset + n
    };
    let spare = FileSectorSpare { nbytes: payload as u16 };

    let off = state.offset;
    if off > 0 {
      cache.write_sector(state.block, state.sector, 0, &state.buffer[..off])?;
    }
    if n > 0 {
      cache.write_sector(state.block, state.sector, off, data)?;
    }
    cache.write_spare(state.block, state.sector, &spare.encode())?;
    cache.commit()?;

    state.sector = increment_sector(state.sector);
    state.offset = if state.sector == TAIL_SECTOR { FileTailHeader::SIZE } else { 0 };
    state.sector_remaining = SECTOR_SIZE - state.offset;
    state.bytes_in_block += n as u32;
    state.write_head += n as u32;
    state.buffer.fill(0xFF);
  }
  Ok(())
}

/// Commit the outstanding dirty block's buffered sector so its block is
/// headed on flash before another allocation happens. The dirty entry is
/// left in place for `commit_file_sector`, which erases the block if that
/// is still pending and clears the slot. `skip` names a handle that is
/// mid-commit and must not be flushed recursively.
pub(crate) fn flush_dirty(
  fs: &mut FsState,
  cache: &mut PageCache,
  alloc: &mut AllocState,
  skip: Option<&Arc<Mutex<WriteState>>>,
) -> FsResult<()> {
  let file = match alloc.dirty.as_ref() {
    None => return Ok(()),
    Some(d) => {
      if skip.map_or(false, |s| Arc::ptr_eq(&d.file, s)) {
        log::warn!("dirty block {} owned by the committing handle", d.block);
        None
      } else {
        Some(d.file.clone())
      }
    }
  };
  let file = match file {
    None => {
      alloc.dirty = None;
      return Ok(());
    }
    Some(f) => f,
  };
  let mut state = file.lock();
  commit_file_sector(fs, cache, alloc, &file, &mut state, &[])
}
