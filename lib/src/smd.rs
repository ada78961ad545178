use crate::blockio::BlockIo;
use crate::gpt::Gpt;
use crate::resolve;
use crate::{Error, Result, SECTOR_SIZE};

const SMD_MAGIC: u32 = 0x3144_4d53; // "SMD1"
const SMD_FORMAT_VERSION: u16 = 1;
const SMD_RECORD_SIZE: usize = 16;
const SMD_PARTITION: &str = "SMD";
const SMD_PARTITION_B: &str = "SMD_b";

/// Redundancy level recorded in slot metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Redundancy {
  Disabled = 0,
  BootloaderOnly = 1,
  Full = 2,
}

impl Redundancy {
  fn from_raw(value: u8) -> Result<Self> {
    match value {
      0 => Ok(Redundancy::Disabled),
      1 => Ok(Redundancy::BootloaderOnly),
      2 => Ok(Redundancy::Full),
      other => Err(Error::CorruptSlotMetadata(format!("bad redundancy level {other}"))),
    }
  }
}

/// On-device slot metadata: which of the two redundant boot slots is
/// active and at what redundancy level. The record is a fixed-size,
/// CRC-protected block stored in the `SMD` partition and mirrored to
/// `SMD_b` when that partition exists.
pub struct Smd {
  active_slot: u32,
  redundancy: Redundancy,
}

impl Smd {
  /// Fresh metadata for first-time initialization: slot 0 active.
  pub fn new(redundancy: Redundancy) -> Self {
    Self {
      active_slot: 0,
      redundancy,
    }
  }

  /// Load metadata from the `SMD` partition, falling back to `SMD_b` if
  /// the primary record is corrupt.
  pub fn load<'a>(
    gpt: &Gpt,
    boot: &'a mut dyn BlockIo,
    gptdev: Option<&'a mut dyn BlockIo>,
    bootdev_size: u64,
  ) -> Result<Self> {
    let mut gptdev = gptdev;
    let mut last_err = Error::PartitionMissing(SMD_PARTITION.into());
    for name in [SMD_PARTITION, SMD_PARTITION_B] {
      let Some(part) = gpt.find_by_name(name) else {
        continue;
      };
      let mut sector = [0u8; SECTOR_SIZE];
      let (dev, offset) = resolve::device_at(part, &mut *boot, gptdev.as_mut().map(|d| &mut **d), bootdev_size)?;
      dev.read_exact_at(&mut sector, offset)?;
      match Self::parse(&sector) {
        Ok(smd) => {
          tracing::debug!("loaded slot metadata from {} (active slot {})", name, smd.active_slot);
          return Ok(smd);
        }
        Err(err) => {
          tracing::warn!("slot metadata in {} unusable: {}", name, err);
          last_err = err;
        }
      }
    }
    Err(last_err)
  }

  fn parse(sector: &[u8]) -> Result<Self> {
    let rec = &sector[..SMD_RECORD_SIZE];
    if u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]) != SMD_MAGIC {
      return Err(Error::CorruptSlotMetadata("bad magic".into()));
    }
    if u16::from_le_bytes([rec[4], rec[5]]) != SMD_FORMAT_VERSION {
      return Err(Error::CorruptSlotMetadata("unsupported format version".into()));
    }
    let stored_crc = u32::from_le_bytes([rec[12], rec[13], rec[14], rec[15]]);
    if crc32fast::hash(&rec[..SMD_RECORD_SIZE - 4]) != stored_crc {
      return Err(Error::CorruptSlotMetadata("checksum mismatch".into()));
    }
    let active_slot = rec[6] as u32;
    if active_slot > 1 {
      return Err(Error::CorruptSlotMetadata(format!("bad active slot {active_slot}")));
    }
    Ok(Self {
      active_slot,
      redundancy: Redundancy::from_raw(rec[7])?,
    })
  }

  fn serialize(&self) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    sector[0..4].copy_from_slice(&SMD_MAGIC.to_le_bytes());
    sector[4..6].copy_from_slice(&SMD_FORMAT_VERSION.to_le_bytes());
    sector[6] = self.active_slot as u8;
    sector[7] = self.redundancy as u8;
    let crc = crc32fast::hash(&sector[..SMD_RECORD_SIZE - 4]);
    sector[12..16].copy_from_slice(&crc.to_le_bytes());
    sector
  }

  pub fn current_slot(&self) -> u32 {
    self.active_slot
  }

  pub fn redundancy_level(&self) -> Redundancy {
    self.redundancy
  }

  pub fn set_redundancy_level(&mut self, level: Redundancy) {
    self.redundancy = level;
  }

  pub fn mark_slot_active(&mut self, slot: u32) {
    self.active_slot = slot;
  }

  /// Persist the record to the `SMD` partition and its mirror. The
  /// primary must exist; the mirror is written only when present.
  pub fn persist<'a>(
    &self,
    gpt: &Gpt,
    boot: &'a mut dyn BlockIo,
    gptdev: Option<&'a mut dyn BlockIo>,
    bootdev_size: u64,
  ) -> Result<()> {
    let mut gptdev = gptdev;
    let sector = self.serialize();
    let mut wrote_primary = false;
    for name in [SMD_PARTITION, SMD_PARTITION_B] {
      let Some(part) = gpt.find_by_name(name) else {
        continue;
      };
      let (dev, offset) = resolve::device_at(part, &mut *boot, gptdev.as_mut().map(|d| &mut **d), bootdev_size)?;
      dev.write_exact_at(&sector, offset, &[])?;
      dev.flush()?;
      if name == SMD_PARTITION {
        wrote_primary = true;
      }
    }
    if !wrote_primary {
      return Err(Error::PartitionMissing(SMD_PARTITION.into()));
    }
    Ok(())
  }
}
