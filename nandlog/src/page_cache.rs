use alloc::sync::Arc;

use crate::error::FsResult;
use crate::flash_dev::FlashDevice;
use crate::layout::TAIL_SECTOR;
use crate::{FsError, SECTORS_PER_PAGE};

/// Single-slot cache over the device's page register.
///
/// At most one page is resident at a time. Re-opening the resident page is
/// free and returns the memoized driver result, which is what makes the
/// clustered reads of a block's header sectors cheap. There is no
/// write-back; writes go straight through and are programmed by `commit`.
pub struct PageCache {
  dev: Arc<dyn FlashDevice>,
  block: u16,
  page: u16,
  open: bool,
  open_ok: bool,
}

impl PageCache {
  pub fn new(dev: Arc<dyn FlashDevice>) -> Self {
    Self { dev, block: 0, page: 0, open: false, open_ok: false }
  }

  pub fn open_page(&mut self, block: u16, page: u16) -> FsResult<()> {
    if self.open && self.block == block && self.page == page {
      return if self.open_ok { Ok(()) } else { Err(FsError::Io) };
    }
    let r = self.dev.open_page(block, page);
    self.open = true;
    self.open_ok = r.is_ok();
    self.block = block;
    self.page = page;
    r.map_err(FsError::from)
  }

  pub fn open_sector(&mut self, block: u16, sector: u16) -> FsResult<()> {
    self.open_page(block, sector / SECTORS_PER_PAGE)
  }

  /// Drop the resident page; the next open reloads from the array.
  pub fn close(&mut self) {
    self.open = false;
  }

  /// A block that cannot even open page 0 is treated as bad.
  pub fn block_bad(&mut self, block: u16) -> bool {
    if self.open_page(block, 0).is_err() {
      return true;
    }
    self.dev.block_is_bad()
  }

  pub fn erase_block(&mut self, block: u16) -> FsResult<()> {
    if self.open && self.block == block {
      self.close();
    }
    self.dev.erase_block(block)?;
    Ok(())
  }

  pub fn read_sector(&mut self, block: u16, sector: u16, offset: usize, dst: &mut [u8]) -> FsResult<()> {
    self.open_sector(block, sector)?;
    self.dev.read_sector(dst, sector, offset)?;
    Ok(())
  }

  pub fn write_sector(&mut self, block: u16, sector: u16, offset: usize, src: &[u8]) -> FsResult<()> {
    self.open_sector(block, sector)?;
    self.dev.write_sector(src, sector, offset)?;
    Ok(())
  }

  pub fn read_spare(&mut self, block: u16, sector: u16, dst: &mut [u8]) -> FsResult<()> {
    self.open_sector(block, sector)?;
    self.dev.read_spare(dst, sector)?;
    Ok(())
  }

  pub fn write_spare(&mut self, block: u16, sector: u16, src: &[u8]) -> FsResult<()> {
    self.open_sector(block, sector)?;
    self.dev.write_spare(src, sector)?;
    Ok(())
  }

  pub fn commit(&mut self) -> FsResult<()> {
    self.dev.commit()?;
    Ok(())
  }

  /// Next-block pointer stored in a block's tail sector.
  pub fn next_block_of(&mut self, block: u16) -> FsResult<u16> {
    if block == crate::layout::BLOCK_IDX_INVALID {
      return Ok(block);
    }
    let mut b = [0u8; 2];
    self.read_sector(block, TAIL_SECTOR, 0, &mut b)?;
    Ok(u16::from_le_bytes(b))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flash_dev::{FlashError, FlashResult};
  use core::sync::atomic::{AtomicUsize, Ordering};

  struct CountingDev {
    opens: AtomicUsize,
  }

  impl FlashDevice for CountingDev {
    fn init(&self) -> FlashResult<()> {
      Ok(())
    }
    fn open_page(&self, _block: u16, _page: u16) -> FlashResult<()> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    fn block_is_bad(&self) -> bool {
      false
    }
    fn erase_block(&self, _block: u16) -> FlashResult<()> {
      Ok(())
    }
    fn read_sector(&self, dst: &mut [u8], _sector: u16, _offset: usize) -> FlashResult<()> {
      dst.fill(0xFF);
      Ok(())
    }
    fn write_sector(&self, _src: &[u8], _sector: u16, _offset: usize) -> FlashResult<()> {
      Ok(())
    }
    fn read_spare(&self, dst: &mut [u8], _sector: u16) -> FlashResult<()> {
      dst.fill(0xFF);
      Ok(())
    }
    fn write_spare(&self, _src: &[u8], _sector: u16) -> FlashResult<()> {
      Ok(())
    }
    fn commit(&self) -> FlashResult<()> {
      Err(FlashError)
    }
  }

  #[test]
  fn repeated_opens_hit_the_slot() {
    let dev = Arc::new(CountingDev { opens: AtomicUsize::new(0) });
    let mut cache = PageCache::new(dev.clone());
    // sectors 0..SECTORS_PER_PAGE live on the same page
    cache.open_sector(3, 0).unwrap();
    cache.open_sector(3, 1).unwrap();
    cache.open_sector(3, SECTORS_PER_PAGE - 1).unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 1);
    cache.open_sector(3, SECTORS_PER_PAGE).unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 2);
    // back to the first page reloads
    cache.open_sector(3, 0).unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn erase_drops_the_resident_page() {
    let dev = Arc::new(CountingDev { opens: AtomicUsize::new(0) });
    let mut cache = PageCache::new(dev.clone());
    cache.open_page(5, 0).unwrap();
    cache.erase_block(5).unwrap();
    cache.open_page(5, 0).unwrap();
    assert_eq!(dev.opens.load(Ordering::SeqCst), 2);
  }
}
