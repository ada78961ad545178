use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::gpt::GptPartition;
use crate::{Error, Result};

/// Which open device a boot partition lives on, and the byte offset of
/// its first sector within that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
  Boot(u64),
  Gpt(u64),
}

/// Place a boot partition on one of the two boot devices. Partitions
/// whose byte offset lies past the end of the primary boot device live
/// on the secondary "GPT device", rebased to its start; if no GPT device
/// exists on this platform that is fatal.
pub fn locate(part: &GptPartition, bootdev_size: u64, have_gpt_device: bool) -> Result<Location> {
  let offset = part.byte_offset();
  if offset < bootdev_size {
    Ok(Location::Boot(offset))
  } else if have_gpt_device {
    Ok(Location::Gpt(offset - bootdev_size))
  } else {
    Err(Error::PastEndOfBootDevice(part.name.clone()))
  }
}

/// Resolve a boot partition to the open device handle it lives on plus
/// its byte offset within that device.
pub fn device_at<'a, 'b: 'a, 'c: 'a, B: crate::blockio::BlockIo + ?Sized>(
  part: &GptPartition,
  boot: &'b mut B,
  gptdev: Option<&'c mut B>,
  bootdev_size: u64,
) -> Result<(&'a mut B, u64)> {
  match locate(part, bootdev_size, gptdev.is_some())? {
    Location::Boot(offset) => Ok((boot, offset)),
    Location::Gpt(offset) => Ok((gptdev.unwrap(), offset)),
  }
}

/// Resolve a partition that is not in the boot device GPT to its
/// by-label block device path, if one exists and is writeable.
pub fn external_device(partlabel_root: &Path, name: &str) -> Option<PathBuf> {
  let path = partlabel_root.join(name);
  let meta = fs::metadata(&path).ok()?;
  if meta.permissions().mode() & 0o200 == 0 {
    return None;
  }
  Some(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn part(name: &str, first: u64, last: u64) -> GptPartition {
    GptPartition {
      name: name.to_string(),
      first_sector: first,
      last_sector: last,
    }
  }

  #[test]
  fn test_partition_on_primary_device() {
    let p = part("mb1", 8, 15);
    assert_eq!(locate(&p, 1 << 20, true).unwrap(), Location::Boot(8 * 512));
  }

  #[test]
  fn test_partition_rebased_to_gpt_device() {
    // first sector at exactly the primary device boundary
    let p = part("LNX", 2048, 4095);
    assert_eq!(locate(&p, 2048 * 512, true).unwrap(), Location::Gpt(0));
    let p = part("TOS", 3000, 4095);
    assert_eq!(locate(&p, 2048 * 512, true).unwrap(), Location::Gpt(952 * 512));
  }

  #[test]
  fn test_past_end_without_gpt_device_is_fatal() {
    let p = part("LNX", 2048, 4095);
    assert!(matches!(
      locate(&p, 2048 * 512, false),
      Err(Error::PastEndOfBootDevice(name)) if name == "LNX"
    ));
  }

  #[test]
  fn test_external_device_requires_writable_label() {
    let dir = std::env::temp_dir().join(format!("resolve-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let dev = dir.join("APP");
    std::fs::write(&dev, b"x").unwrap();

    assert_eq!(external_device(&dir, "APP"), Some(dev.clone()));
    assert_eq!(external_device(&dir, "missing"), None);

    let mut perms = std::fs::metadata(&dev).unwrap().permissions();
    perms.set_mode(0o444);
    std::fs::set_permissions(&dev, perms).unwrap();
    assert_eq!(external_device(&dir, "APP"), None);

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
