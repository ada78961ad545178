use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use crate::Result;

/// Sector-addressed positioned I/O over a boot device.
///
/// `write_exact_at` optionally pre-erases the target region: when `erase`
/// is non-empty, that many zero bytes are written at `offset` and flushed
/// to the device before the payload is written at the same offset. The
/// erase region is always anchored at the target offset and must be at
/// least as large as the payload. Flushing after the payload write is the
/// caller's responsibility.
pub trait BlockIo {
  fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;
  fn write_exact_at(&mut self, buf: &[u8], offset: u64, erase: &[u8]) -> Result<()>;
  fn flush(&mut self) -> Result<()>;
  /// Total size of the device in bytes.
  fn len(&mut self) -> Result<u64>;
}

impl BlockIo for File {
  fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
    FileExt::read_exact_at(self, buf, offset)?;
    Ok(())
  }

  fn write_exact_at(&mut self, buf: &[u8], offset: u64, erase: &[u8]) -> Result<()> {
    if !erase.is_empty() {
      self.write_all_at(erase, offset)?;
      self.sync_data()?;
    }
    self.write_all_at(buf, offset)?;
    Ok(())
  }

  fn flush(&mut self) -> Result<()> {
    self.sync_all()?;
    Ok(())
  }

  fn len(&mut self) -> Result<u64> {
    // block device files report a zero-length metadata size; seeking to
    // the end is the reliable way to measure them
    let end = self.seek(SeekFrom::End(0))?;
    self.seek(SeekFrom::Start(0))?;
    Ok(end)
  }
}
