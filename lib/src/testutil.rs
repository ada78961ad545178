//! In-memory doubles for the device and package inputs, shared by the
//! per-module test suites.

use crate::blockio::BlockIo;
use crate::soc::{Platform, SocGen};
use crate::Result;

/// Platform double with a fixed SoC generation and the usual
/// optional-EKS policy.
pub struct TestPlatform {
  pub soc: SocGen,
}

impl TestPlatform {
  pub fn new(soc: SocGen) -> Self {
    Self { soc }
  }
}

impl Platform for TestPlatform {
  fn soc_gen(&self) -> Result<SocGen> {
    Ok(self.soc)
  }

  fn set_bootdev_writeable(&self, _device: &str, writeable: bool) -> Result<bool> {
    Ok(writeable)
  }

  fn partition_should_be_present(&self, name: &str) -> bool {
    !name.starts_with("EKS")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
  Read { offset: u64, len: usize },
  Zero { offset: u64, len: usize },
  Write { offset: u64, len: usize },
  Flush,
}

/// A RAM-backed block device that records every operation so tests can
/// assert on write ordering and erase windows.
pub struct MemBlockDev {
  pub data: Vec<u8>,
  pub ops: Vec<Op>,
}

impl MemBlockDev {
  pub fn new(size: usize) -> Self {
    Self {
      data: vec![0u8; size],
      ops: Vec::new(),
    }
  }

  pub fn with_data(data: Vec<u8>) -> Self {
    Self { data, ops: Vec::new() }
  }

  fn check_range(&self, offset: u64, len: usize) -> Result<()> {
    let end = offset as usize + len;
    if end > self.data.len() {
      return Err(
        std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          format!("access at {offset}+{len} past device end {}", self.data.len()),
        )
        .into(),
      );
    }
    Ok(())
  }

  /// Offsets of every `Write` op, in order.
  pub fn write_offsets(&self) -> Vec<u64> {
    self
      .ops
      .iter()
      .filter_map(|op| match op {
        Op::Write { offset, .. } => Some(*offset),
        _ => None,
      })
      .collect()
  }
}

impl BlockIo for MemBlockDev {
  fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
    self.check_range(offset, buf.len())?;
    buf.copy_from_slice(&self.data[offset as usize..offset as usize + buf.len()]);
    self.ops.push(Op::Read {
      offset,
      len: buf.len(),
    });
    Ok(())
  }

  fn write_exact_at(&mut self, buf: &[u8], offset: u64, erase: &[u8]) -> Result<()> {
    if !erase.is_empty() {
      self.check_range(offset, erase.len())?;
      self.data[offset as usize..offset as usize + erase.len()].fill(0);
      self.ops.push(Op::Zero {
        offset,
        len: erase.len(),
      });
      self.ops.push(Op::Flush);
    }
    self.check_range(offset, buf.len())?;
    self.data[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
    self.ops.push(Op::Write {
      offset,
      len: buf.len(),
    });
    Ok(())
  }

  fn flush(&mut self) -> Result<()> {
    self.ops.push(Op::Flush);
    Ok(())
  }

  fn len(&mut self) -> Result<u64> {
    Ok(self.data.len() as u64)
  }
}

/// Serialize an update package container for tests. Entries are
/// `(name, spec, version, payload)`.
pub fn bup_bytes(
  tnspec: &str,
  compat_spec: &str,
  boot_device: &str,
  gpt_device: &str,
  entries: &[(&str, &str, u32, &[u8])],
) -> Vec<u8> {
  use crate::bup::{BUP_ENTRY_SIZE, BUP_HEADER_SIZE, BUP_MAGIC};

  fn put(buf: &mut [u8], s: &str) {
    buf[..s.len()].copy_from_slice(s.as_bytes());
  }

  let mut blob = vec![0u8; BUP_HEADER_SIZE + entries.len() * BUP_ENTRY_SIZE];
  blob[..16].copy_from_slice(BUP_MAGIC);
  blob[16..20].copy_from_slice(&1u32.to_le_bytes());
  blob[20..24].copy_from_slice(&(BUP_HEADER_SIZE as u32).to_le_bytes());
  blob[24..28].copy_from_slice(&(entries.len() as u32).to_le_bytes());
  blob[28..32].copy_from_slice(&(BUP_ENTRY_SIZE as u32).to_le_bytes());
  put(&mut blob[32..96], tnspec);
  put(&mut blob[96..160], compat_spec);
  put(&mut blob[160..192], boot_device);
  put(&mut blob[192..224], gpt_device);

  let mut payload_offset = blob.len() as u64;
  for (i, (name, spec, version, payload)) in entries.iter().enumerate() {
    let rec = BUP_HEADER_SIZE + i * BUP_ENTRY_SIZE;
    let e = &mut blob[rec..rec + BUP_ENTRY_SIZE];
    put(&mut e[..40], name);
    put(&mut e[40..80], spec);
    e[80..88].copy_from_slice(&payload_offset.to_le_bytes());
    e[88..96].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    e[96..100].copy_from_slice(&version.to_le_bytes());
    payload_offset += payload.len() as u64;
  }
  for (_, _, _, payload) in entries {
    blob.extend_from_slice(payload);
  }
  blob
}
