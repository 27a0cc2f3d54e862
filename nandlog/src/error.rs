use core::fmt;

use crate::flash_dev::FlashError;

/// Result type alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Failure modes surfaced by the public API.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FsError {
  /// The flash driver reported a failure.
  Io,
  /// No free block could be allocated.
  NoSpace,
  /// No live file with that name.
  NotFound,
  /// The operation needs a mounted filesystem.
  NotMounted,
  /// On-flash state that no valid history can produce.
  Corrupt,
  /// The filename does not fit in an inode entry.
  NameTooLong,
  /// Declared but unimplemented operation.
  Unsupported,
}

impl FsError {
  pub const fn message(self) -> &'static str {
    match self {
      FsError::Io => "flash driver failure",
      FsError::NoSpace => "no free blocks",
      FsError::NotFound => "no such file",
      FsError::NotMounted => "filesystem not mounted",
      FsError::Corrupt => "corrupt on-flash state",
      FsError::NameTooLong => "filename too long",
      FsError::Unsupported => "operation not supported",
    }
  }
}

impl fmt::Display for FsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.message())
  }
}

impl From<FlashError> for FsError {
  fn from(_: FlashError) -> Self {
    FsError::Io
  }
}
