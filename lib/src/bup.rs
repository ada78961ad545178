use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::{Error, Result};

pub(crate) const BUP_MAGIC: &[u8; 16] = b"BUPFLASH_BLOB_V1";
pub(crate) const BUP_HEADER_SIZE: usize = 224;
pub(crate) const BUP_ENTRY_SIZE: usize = 104;
const BUP_FORMAT_VERSION: u32 = 1;

/// Anything a package can be read out of: a file on disk or an
/// in-memory buffer.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// One named entry of an update package: where its payload bytes live
/// within the container and which hardware spec it was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BupEntry {
  pub name: String,
  pub spec: String,
  pub offset: u64,
  pub length: u64,
  pub version: u32,
}

/// A Bootloader Update Package: a flat container with a fixed header, an
/// entry table, and raw payload bytes. Entries carry a spec string; an
/// entry applies to this device when its spec is empty or matches the
/// package TNSPEC or compat spec.
pub struct Bup {
  reader: Box<dyn ReadSeek>,
  tnspec: String,
  compat_spec: Option<String>,
  boot_device: String,
  gpt_device: String,
  entries: Vec<BupEntry>,
}

impl Bup {
  pub fn open(path: &Path) -> Result<Self> {
    tracing::debug!("opening update package at {}", path.display());
    let reader = BufReader::new(File::open(path)?);
    Self::from_reader(Box::new(reader))
  }

  pub fn from_reader(mut reader: Box<dyn ReadSeek>) -> Result<Self> {
    let mut header = [0u8; BUP_HEADER_SIZE];
    reader.seek(SeekFrom::Start(0))?;
    reader
      .read_exact(&mut header)
      .map_err(|_| Error::MalformedPackage("package shorter than its header".into()))?;

    if &header[..16] != BUP_MAGIC {
      return Err(Error::MalformedPackage("bad package magic".into()));
    }
    let format_version = le32(&header[16..20]);
    if format_version != BUP_FORMAT_VERSION {
      return Err(Error::MalformedPackage(format!(
        "unsupported package format version {format_version}"
      )));
    }
    let header_size = le32(&header[20..24]) as usize;
    let entry_count = le32(&header[24..28]) as usize;
    let entry_size = le32(&header[28..32]) as usize;
    if header_size != BUP_HEADER_SIZE || entry_size != BUP_ENTRY_SIZE {
      return Err(Error::MalformedPackage("unsupported package geometry".into()));
    }

    let tnspec = fixed_str(&header[32..96]);
    let compat_spec = fixed_str(&header[96..160]);
    let boot_device = fixed_str(&header[160..192]);
    let gpt_device = fixed_str(&header[192..224]);
    if tnspec.is_empty() || boot_device.is_empty() {
      return Err(Error::MalformedPackage("package lacks TNSPEC or boot device".into()));
    }

    let mut table = vec![0u8; entry_count * BUP_ENTRY_SIZE];
    reader
      .read_exact(&mut table)
      .map_err(|_| Error::MalformedPackage("package shorter than its entry table".into()))?;
    let entries = table
      .chunks(BUP_ENTRY_SIZE)
      .map(|rec| BupEntry {
        name: fixed_str(&rec[..40]),
        spec: fixed_str(&rec[40..80]),
        offset: le64(&rec[80..88]),
        length: le64(&rec[88..96]),
        version: le32(&rec[96..100]),
      })
      .collect::<Vec<_>>();

    tracing::debug!("package declares {} entries for TNSPEC {}", entries.len(), tnspec);
    Ok(Self {
      reader,
      tnspec,
      compat_spec: if compat_spec.is_empty() { None } else { Some(compat_spec) },
      boot_device,
      gpt_device,
      entries,
    })
  }

  pub fn tnspec(&self) -> &str {
    &self.tnspec
  }

  pub fn compat_spec(&self) -> Option<&str> {
    self.compat_spec.as_deref()
  }

  pub fn boot_device(&self) -> &str {
    &self.boot_device
  }

  pub fn gpt_device(&self) -> &str {
    &self.gpt_device
  }

  fn spec_matches(&self, spec: &str) -> bool {
    spec.is_empty() || spec == self.tnspec || Some(spec) == self.compat_spec.as_deref()
  }

  /// The entries that apply to this device, in container order.
  pub fn entries(&self) -> impl Iterator<Item = &BupEntry> {
    self.entries.iter().filter(|e| self.spec_matches(&e.spec))
  }

  /// Partition names that appear in the package only under specs that do
  /// not apply to this device. A non-empty result means the package
  /// cannot service this TNSPEC.
  pub fn missing_entries(&self) -> Vec<String> {
    let mut missing = Vec::new();
    for entry in &self.entries {
      if self.spec_matches(&entry.spec) {
        continue;
      }
      let covered = self.entries.iter().any(|e| e.name == entry.name && self.spec_matches(&e.spec));
      if !covered && !missing.contains(&entry.name) {
        missing.push(entry.name.clone());
      }
    }
    missing
  }

  /// Read exactly `buf.len()` payload bytes starting at container offset
  /// `offset`, looping over short reads.
  pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
    self.reader.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
      let n = self.reader.read(&mut buf[total..])?;
      if n == 0 {
        return Err(Error::MalformedPackage("package truncated mid-entry".into()));
      }
      total += n;
    }
    Ok(())
  }
}

fn fixed_str(bytes: &[u8]) -> String {
  let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
  String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn le32(b: &[u8]) -> u32 {
  u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le64(b: &[u8]) -> u64 {
  u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::bup_bytes;
  use std::io::Cursor;

  fn open(blob: Vec<u8>) -> Bup {
    Bup::from_reader(Box::new(Cursor::new(blob))).unwrap()
  }

  #[test]
  fn test_parse_and_enumerate() {
    let blob = bup_bytes(
      "board-rev1",
      "board-rev0",
      "/dev/mmcblk0boot0",
      "/dev/mmcblk0boot1",
      &[
        ("BCT", "", 1, b"bct-bytes"),
        ("mb1", "board-rev1", 2, b"mb1-bytes"),
        ("mb2", "other-board", 3, b"mb2-bytes"),
        ("mb2", "board-rev0", 3, b"mb2-compat"),
      ],
    );
    let bup = open(blob);
    assert_eq!(bup.tnspec(), "board-rev1");
    assert_eq!(bup.compat_spec(), Some("board-rev0"));
    assert_eq!(bup.boot_device(), "/dev/mmcblk0boot0");
    assert_eq!(bup.gpt_device(), "/dev/mmcblk0boot1");

    let names: Vec<_> = bup.entries().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["BCT", "mb1", "mb2"]);
    assert!(bup.missing_entries().is_empty());
  }

  #[test]
  fn test_payload_read() {
    let blob = bup_bytes("t", "", "/dev/mtdblock0", "", &[("NVC", "", 1, b"nvc-payload")]);
    let mut bup = open(blob);
    let entry = bup.entries().next().unwrap().clone();
    let mut buf = vec![0u8; entry.length as usize];
    bup.read_exact_at(entry.offset, &mut buf).unwrap();
    assert_eq!(&buf, b"nvc-payload");
  }

  #[test]
  fn test_missing_entries_for_tnspec() {
    let blob = bup_bytes(
      "board-rev1",
      "",
      "/dev/mmcblk0boot0",
      "/dev/mmcblk0boot1",
      &[("BCT", "", 1, b"x"), ("mb1", "other-board", 1, b"y")],
    );
    let bup = open(blob);
    assert_eq!(bup.missing_entries(), vec!["mb1".to_string()]);
  }

  #[test]
  fn test_rejects_bad_magic_and_truncation() {
    assert!(Bup::from_reader(Box::new(Cursor::new(vec![0u8; 16]))).is_err());

    let mut blob = bup_bytes("t", "", "/dev/mtdblock0", "", &[("BCT", "", 1, b"abcdef")]);
    blob[0] = b'X';
    assert!(Bup::from_reader(Box::new(Cursor::new(blob.clone()))).is_err());

    let blob = bup_bytes("t", "", "/dev/mtdblock0", "", &[("BCT", "", 1, b"abcdef")]);
    let truncated = blob[..blob.len() - 3].to_vec();
    let mut bup = Bup::from_reader(Box::new(Cursor::new(truncated))).unwrap();
    let entry = bup.entries().next().unwrap().clone();
    let mut buf = vec![0u8; entry.length as usize];
    assert!(bup.read_exact_at(entry.offset, &mut buf).is_err());
  }
}
