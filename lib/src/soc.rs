use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// The three supported generations of the SoC family. The generation
/// governs the BCT layout, whether slot metadata exists, whether
/// redundancy is A/B, and the redundant partition naming scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocGen {
  /// Oldest generation: up to 64 BCT copies, no slot metadata, never A/B.
  Gen1,
  /// Middle generation: three-slot BCT scheme, A/B slot metadata.
  Gen2,
  /// Newest generation: same update scheme as Gen2.
  Gen3,
}

impl SocGen {
  /// True for the generations that keep A/B slot metadata on the device.
  pub fn has_slot_metadata(self) -> bool {
    !matches!(self, SocGen::Gen1)
  }
}

/// Boot medium of the target platform, derived from the update package's
/// declared boot device path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMedium {
  SpiFlash,
  Emmc,
}

impl BootMedium {
  /// Classify the boot device by its path prefix. `/dev/mtd*` devices are
  /// SPI flash, `/dev/mmc*` devices are eMMC/SD; anything else is not a
  /// boot device we know how to update.
  pub fn from_boot_device(path: &str) -> Result<Self> {
    if path.starts_with("/dev/mtd") {
      Ok(BootMedium::SpiFlash)
    } else if path.starts_with("/dev/mmc") {
      Ok(BootMedium::Emmc)
    } else {
      Err(Error::UnknownBootDevice(path.to_string()))
    }
  }

  /// Page size of the boot device in bytes.
  pub fn page_size(self) -> usize {
    match self {
      BootMedium::SpiFlash => 2048,
      BootMedium::Emmc => 512,
    }
  }

  /// BCT block size of the boot device in bytes.
  pub fn block_size(self) -> usize {
    match self {
      BootMedium::SpiFlash => 32768,
      BootMedium::Emmc => 16384,
    }
  }

  /// Number of BCT copies written into block 0 on Gen1 platforms.
  pub fn gen1_bct_copies(self) -> usize {
    match self {
      BootMedium::SpiFlash => 2,
      BootMedium::Emmc => 1,
    }
  }

  /// eMMC platforms present a second hardware boot area (the "GPT
  /// device") holding whatever does not fit on the primary boot device.
  pub fn has_gpt_device(self) -> bool {
    matches!(self, BootMedium::Emmc)
  }
}

/// Host-side facts and knobs the updater needs but does not own: the SoC
/// probe, the boot-device write-protect toggle, and the policy for
/// optional partitions.
pub trait Platform {
  /// Determine the SoC generation of the machine we are running on.
  fn soc_gen(&self) -> Result<SocGen>;

  /// Make a boot device writeable (or restore write protection).
  /// Returns the previous writeable state so callers can restore it.
  fn set_bootdev_writeable(&self, device: &str, writeable: bool) -> Result<bool>;

  /// Whether a partition named in the update package must exist on this
  /// platform. Entries for absent optional partitions are skipped.
  fn partition_should_be_present(&self, name: &str) -> bool;
}

/// Platform implementation for a live Linux target.
pub struct LinuxPlatform;

impl LinuxPlatform {
  fn force_ro_path(device: &str) -> Option<String> {
    // only eMMC hardware boot areas carry the force_ro knob
    let base = device.strip_prefix("/dev/")?;
    if !base.starts_with("mmcblk") {
      return None;
    }
    Some(format!("/sys/block/{base}/force_ro"))
  }
}

impl Platform for LinuxPlatform {
  fn soc_gen(&self) -> Result<SocGen> {
    let compat = fs::read("/proc/device-tree/compatible").map_err(|_| Error::UnknownSoc)?;
    for entry in compat.split(|b| *b == 0) {
      let entry = String::from_utf8_lossy(entry);
      if entry.contains("-gen3") {
        return Ok(SocGen::Gen3);
      }
      if entry.contains("-gen2") {
        return Ok(SocGen::Gen2);
      }
      if entry.contains("-gen1") {
        return Ok(SocGen::Gen1);
      }
    }
    Err(Error::UnknownSoc)
  }

  fn set_bootdev_writeable(&self, device: &str, writeable: bool) -> Result<bool> {
    let Some(knob) = Self::force_ro_path(device) else {
      // SPI flash devices have no write-protect toggle to manage
      return Ok(writeable);
    };
    if !Path::new(&knob).exists() {
      return Ok(writeable);
    }
    let prior = fs::read_to_string(&knob)?.trim() == "0";
    if prior != writeable {
      tracing::debug!("setting {} to {}", knob, if writeable { "0" } else { "1" });
      fs::write(&knob, if writeable { "0" } else { "1" })?;
    }
    Ok(prior)
  }

  fn partition_should_be_present(&self, name: &str) -> bool {
    // encrypted keystore partitions are optional on every platform
    !name.starts_with("EKS")
  }
}
