use std::fmt;

use crate::{Error, Result};

/// A BSP version packed as `major << 16 | minor << 8 | maint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BspVersion(pub u32);

impl BspVersion {
  pub fn new(major: u32, minor: u32, maint: u32) -> Self {
    BspVersion((major << 16) | ((minor & 0xff) << 8) | (maint & 0xff))
  }

  pub fn major(self) -> u32 {
    self.0 >> 16
  }

  pub fn minor(self) -> u32 {
    (self.0 >> 8) & 0xff
  }

  pub fn maint(self) -> u32 {
    self.0 & 0xff
  }
}

impl fmt::Display for BspVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", self.major(), self.minor(), self.maint())
  }
}

/// Contents of a VER partition (or the VER entry of an update package):
/// the installed BSP version and a checksum over the boot chain images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerInfo {
  pub bsp_version: BspVersion,
  pub crc: u32,
}

const VER_MAGIC: &str = "VER2";

fn parse_field(field: Option<&str>) -> Result<u32> {
  field
    .and_then(|s| s.trim().parse().ok())
    .ok_or_else(|| Error::MalformedPackage("bad version info version field".into()))
}

impl VerInfo {
  /// Parse version info out of raw partition or payload bytes.
  ///
  /// The format is a small NUL-padded text record:
  ///
  /// ```text
  /// VER2
  /// version 35.4.1
  /// crc32 89abcdef
  /// ```
  pub fn extract(bytes: &[u8]) -> Result<VerInfo> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = std::str::from_utf8(&bytes[..end])
      .map_err(|_| Error::MalformedPackage("version info is not text".into()))?;

    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some(VER_MAGIC) {
      return Err(Error::MalformedPackage("bad version info magic".into()));
    }

    let mut info = VerInfo::default();
    let mut have_version = false;
    let mut have_crc = false;
    for line in lines {
      if let Some(rest) = line.strip_prefix("version ") {
        let mut fields = rest.trim().split('.');
        let major = parse_field(fields.next())?;
        let minor = parse_field(fields.next())?;
        let maint = parse_field(fields.next())?;
        info.bsp_version = BspVersion::new(major, minor, maint);
        have_version = true;
      } else if let Some(rest) = line.strip_prefix("crc32 ") {
        info.crc =
          u32::from_str_radix(rest.trim(), 16).map_err(|_| Error::MalformedPackage("bad version info crc".into()))?;
        have_crc = true;
      }
    }
    if !have_version || !have_crc {
      return Err(Error::MalformedPackage("incomplete version info".into()));
    }
    Ok(info)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_version_packing() {
    let v = BspVersion::new(35, 4, 1);
    assert_eq!(v.major(), 35);
    assert_eq!(v.minor(), 4);
    assert_eq!(v.maint(), 1);
    assert_eq!(v.to_string(), "35.4.1");
    assert!(BspVersion::new(35, 4, 1) > BspVersion::new(35, 3, 0));
    assert!(BspVersion::new(36, 0, 0) > BspVersion::new(35, 255, 255));
  }

  #[test]
  fn test_extract() {
    let mut bytes = b"VER2\nversion 35.4.1\ncrc32 89abcdef\n".to_vec();
    bytes.resize(512, 0);
    let info = VerInfo::extract(&bytes).unwrap();
    assert_eq!(info.bsp_version, BspVersion::new(35, 4, 1));
    assert_eq!(info.crc, 0x89abcdef);
  }

  #[test]
  fn test_extract_rejects_garbage() {
    assert!(VerInfo::extract(&[0u8; 512]).is_err());
    assert!(VerInfo::extract(b"VER2\nversion 35.4\ncrc32 0\n").is_err());
    assert!(VerInfo::extract(b"VER2\nversion 35.4.1\n").is_err());
    assert!(VerInfo::extract(&[0xffu8; 64]).is_err());
  }
}
