use crate::blockio::BlockIo;
use crate::bup::Bup;
use crate::executor::Buffers;
use crate::planner::{redundant_name, Target, UpdateEntry};
use crate::resolve;
use crate::soc::{BootMedium, SocGen};
use crate::ver::VerInfo;
use crate::{Error, Result};

/// Version/rollback gate: decide whether the update may be applied at
/// all, before anything is written.
///
/// The on-device VER partitions record the installed BSP version and a
/// checksum; the package's VER entry records what it was built from.
/// A payload older than the installed version is refused (downgrading
/// can brick the device), and an inconsistent device state left behind
/// by an interrupted update is refused until reflashed. Packages that
/// do not touch the boot chain carry no VER entry and pass the gate.
#[allow(clippy::too_many_arguments)]
pub fn check<B: BlockIo + ?Sized>(
  bup: &mut Bup,
  boot: &mut B,
  gptdev: Option<&mut B>,
  bootdev_size: u64,
  entries: &[UpdateEntry],
  soc: SocGen,
  medium: BootMedium,
  force_initialize: bool,
  bufs: &mut Buffers,
) -> Result<()> {
  let mut gptdev = gptdev;
  let ver_b_name = redundant_name("VER", soc, medium);
  let nvc_b_name = redundant_name("NVC", soc, medium);
  let find = |name: &str| entries.iter().find(|e| e.partname == name);
  let ver = [find("VER"), find(&ver_b_name)];
  let nvc = [find("NVC"), find(&nvc_b_name)];

  let Some(payload_ver) = ver[0] else {
    // no VER entry means the package does not touch the boot chain
    return Ok(());
  };

  bup
    .read_exact_at(payload_ver.bup_offset, &mut bufs.content[..payload_ver.length])
    .map_err(|_| Error::PayloadVersionUnreadable)?;
  let payload_info =
    VerInfo::extract(&bufs.content[..payload_ver.length]).map_err(|_| Error::PayloadVersionUnreadable)?;

  let mut device_info = [VerInfo::default(); 2];
  for (i, ent) in ver.iter().enumerate() {
    let Some(ent) = ent else {
      continue;
    };
    let Target::Partition(part) = &ent.target else {
      return Err(Error::PartitionMissing(ent.partname.clone()));
    };
    let partsize = part.byte_len();
    let (dev, offset) = resolve::device_at(part, &mut *boot, gptdev.as_mut().map(|d| &mut **d), bootdev_size)?;
    dev.read_exact_at(&mut bufs.slot[..partsize], offset)?;
    // a single valid copy can be enough, so a parse failure here just
    // leaves the zero version in place
    device_info[i] = VerInfo::extract(&bufs.slot[..partsize]).unwrap_or_default();
  }

  // Both version partitions valid and in agreement: refuse rollbacks,
  // and verify the last update completed by comparing the NVC partition
  // with its redundant copy.
  if device_info[0].bsp_version == device_info[1].bsp_version && device_info[0].bsp_version.0 != 0 {
    if device_info[0].bsp_version > payload_info.bsp_version {
      return Err(Error::Rollback {
        current: device_info[0].bsp_version,
        payload: payload_info.bsp_version,
      });
    }
    if device_info[0].crc == device_info[1].crc
      && !nvc_parts_match(&mut *boot, gptdev.as_mut().map(|d| &mut **d), bootdev_size, &nvc, bufs)
    {
      return Err(Error::NvcMismatch);
    }
    return Ok(());
  }

  if device_info[1].bsp_version.0 == 0
    && device_info[0].bsp_version.0 != 0
    && device_info[0].bsp_version > payload_info.bsp_version
  {
    if force_initialize {
      tracing::warn!(
        "downgrading bootloader from {} to {}",
        device_info[0].bsp_version,
        payload_info.bsp_version
      );
      return Ok(());
    }
    Err(Error::Rollback {
      current: device_info[0].bsp_version,
      payload: payload_info.bsp_version,
    })
  } else if device_info[1].bsp_version.0 != 0 && device_info[1].bsp_version != payload_info.bsp_version {
    Err(Error::IncompleteUpdate {
      expected: device_info[1].bsp_version,
    })
  } else if force_initialize {
    tracing::warn!("bootloader version partitions were corrupted");
    Ok(())
  } else {
    Err(Error::CorruptVersionInfo)
  }
}

/// Check (via CRC-32) that the NVC partition and its redundant copy are
/// byte-identical. Any missing descriptor or read failure counts as a
/// mismatch.
fn nvc_parts_match<'a>(
  boot: &'a mut dyn BlockIo,
  gptdev: Option<&'a mut dyn BlockIo>,
  bootdev_size: u64,
  nvc: &[Option<&UpdateEntry>; 2],
  bufs: &mut Buffers,
) -> bool {
  let mut gptdev = gptdev;
  let mut crc = [0u32; 2];
  for i in 0..2 {
    let Some(ent) = nvc[i] else {
      return false;
    };
    let Target::Partition(part) = &ent.target else {
      return false;
    };
    let partsize = part.byte_len();
    let Ok((dev, offset)) = resolve::device_at(part, &mut *boot, gptdev.as_mut().map(|d| &mut **d), bootdev_size)
    else {
      return false;
    };
    if dev.read_exact_at(&mut bufs.slot[..partsize], offset).is_err() {
      return false;
    }
    crc[i] = crc32fast::hash(&bufs.slot[..partsize]);
  }
  crc[0] == crc[1]
}
