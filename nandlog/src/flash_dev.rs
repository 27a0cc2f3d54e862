/// Error reported by the flash driver. Carries no detail; the caller
/// either retries or surfaces the failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FlashError;

pub type FlashResult<T> = Result<T, FlashError>;

/// Contract for the raw NAND driver consumed by the filesystem.
///
/// The device exposes a single page register: `open_page` loads one page,
/// after which sector and spare accesses address that page. `sector`
/// arguments are block-relative; implementations reduce them modulo
/// `SECTORS_PER_PAGE`. Writes accumulate in the register until `commit`
/// programs them, and programming can only clear bits. `erase_block`
/// returns a whole block to all-1s.
///
/// Methods take `&self`; implementations guard their register with
/// interior mutability.
pub trait FlashDevice: Send + Sync {
  fn init(&self) -> FlashResult<()>;

  fn open_page(&self, block: u16, page: u16) -> FlashResult<()>;

  /// Bad-block mark of the block whose page is currently open.
  fn block_is_bad(&self) -> bool;

  fn erase_block(&self, block: u16) -> FlashResult<()>;

  fn read_sector(&self, dst: &mut [u8], sector: u16, offset: usize) -> FlashResult<()>;

  fn write_sector(&self, src: &[u8], sector: u16, offset: usize) -> FlashResult<()>;

  /// Read the out-of-band bytes of one sector of the open page.
  fn read_spare(&self, dst: &mut [u8], sector: u16) -> FlashResult<()>;

  fn write_spare(&self, src: &[u8], sector: u16) -> FlashResult<()>;

  /// Program pending register writes into the array.
  fn commit(&self) -> FlashResult<()>;
}
