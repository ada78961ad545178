use std::fs::OpenOptions;
use std::path::Path;

use crate::bct::{self, BctPass, BctValidator};
use crate::blockio::BlockIo;
use crate::bup::Bup;
use crate::planner::{Target, UpdateEntry};
use crate::resolve;
use crate::soc::{BootMedium, SocGen};
use crate::{Error, Result};

/// The three buffers shared across the whole run, allocated once after
/// planning: `content` holds the payload currently being considered
/// (sized to the largest package entry), `slot` holds the current
/// destination bytes and `zero` feeds erase windows (both sized to the
/// largest destination).
pub struct Buffers {
  pub content: Vec<u8>,
  pub slot: Vec<u8>,
  pub zero: Vec<u8>,
}

impl Buffers {
  pub fn new(largest_payload: usize, largest_partition: usize) -> Self {
    Self {
      content: vec![0u8; largest_payload],
      slot: vec![0u8; largest_partition],
      zero: vec![0u8; largest_partition],
    }
  }
}

/// Consumes the planner's ordered worklist entry by entry: streams the
/// payload out of the package, compares it with what the destination
/// already holds, and writes only on mismatch. BCT entries take their
/// own multi-pass path.
pub struct Executor<'a> {
  soc: SocGen,
  medium: BootMedium,
  dry_run: bool,
  initialize: bool,
  bootdev_size: u64,
  validator: &'a dyn BctValidator,
  bct_pass: BctPass,
  /// Set once any BCT content has gone through its update path.
  pub bct_updated: bool,
}

impl<'a> Executor<'a> {
  pub fn new(
    soc: SocGen,
    medium: BootMedium,
    dry_run: bool,
    initialize: bool,
    bootdev_size: u64,
    validator: &'a dyn BctValidator,
  ) -> Self {
    Self {
      soc,
      medium,
      dry_run,
      initialize,
      bootdev_size,
      validator,
      bct_pass: BctPass::Last,
      bct_updated: false,
    }
  }

  pub fn process<B: BlockIo + ?Sized>(
    &mut self,
    bup: &mut Bup,
    boot: &mut B,
    gptdev: Option<&mut B>,
    ent: &UpdateEntry,
    bufs: &mut Buffers,
  ) -> Result<()> {
    tracing::info!("processing {}", ent.partname);
    bup.read_exact_at(ent.bup_offset, &mut bufs.content[..ent.length])?;

    if self.dry_run {
      tracing::info!("{}: [OK] (dry run)", ent.partname);
      return Ok(());
    }

    match &ent.target {
      Target::Partition(part) => self.update_bootpart(boot, gptdev, part.clone(), ent, bufs),
      Target::Device(path) => self.update_external(path, ent, bufs),
    }
  }

  fn update_bootpart<B: BlockIo + ?Sized>(
    &mut self,
    boot: &mut B,
    gptdev: Option<&mut B>,
    part: crate::gpt::GptPartition,
    ent: &UpdateEntry,
    bufs: &mut Buffers,
  ) -> Result<()> {
    let partsize = part.byte_len();
    if ent.length > partsize {
      return Err(Error::PayloadTooLarge(ent.partname.clone()));
    }
    let (dev, offset) = resolve::device_at(&part, boot, gptdev, self.bootdev_size)?;
    dev.read_exact_at(&mut bufs.slot[..partsize], offset)?;

    if ent.partname == "BCT" {
      let current = if self.initialize { None } else { Some(&bufs.slot[..partsize]) };
      match self.soc {
        SocGen::Gen1 => bct::update_gen1(
          dev,
          self.validator,
          self.soc,
          self.medium,
          current,
          &bufs.content[..ent.length],
          partsize,
          offset,
          &mut self.bct_pass,
          &bufs.zero,
        )?,
        _ => bct::update_gen23(
          dev,
          self.validator,
          self.soc,
          self.medium,
          current,
          &bufs.content[..ent.length],
          offset,
          &bufs.zero,
        )?,
      }
      self.bct_updated = true;
      return Ok(());
    }

    if bufs.content[..ent.length] == bufs.slot[..ent.length] {
      tracing::info!("{}: [no update needed]", ent.partname);
      return Ok(());
    }

    dev.write_exact_at(&bufs.content[..ent.length], offset, &bufs.zero[..partsize])?;
    dev.flush()?;
    tracing::info!("{}: [OK]", ent.partname);
    Ok(())
  }

  fn update_external(&self, path: &Path, ent: &UpdateEntry, bufs: &mut Buffers) -> Result<()> {
    let mut dev = OpenOptions::new().read(true).write(true).open(path)?;
    let devsize = BlockIo::len(&mut dev)? as usize;
    let erase = &bufs.zero[..devsize.min(bufs.zero.len())];
    dev.write_exact_at(&bufs.content[..ent.length], 0, erase)?;
    BlockIo::flush(&mut dev)?;
    tracing::info!("{}: [OK]", ent.partname);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bct::BasicBctValidator;
  use crate::gpt::GptPartition;
  use crate::testutil::{bup_bytes, MemBlockDev, Op};
  use std::io::Cursor;

  const PART_SECTORS: u64 = 4;
  const PART_BYTES: usize = PART_SECTORS as usize * 512;

  fn bup_single(name: &str, payload: &[u8]) -> (Bup, UpdateEntry) {
    let blob = bup_bytes("machine", "", "/dev/mmcblk0boot0", "", &[(name, "", 1, payload)]);
    let bup = Bup::from_reader(Box::new(Cursor::new(blob))).unwrap();
    let bent = bup.entries().next().unwrap().clone();
    let ent = UpdateEntry {
      partname: name.to_string(),
      target: Target::Partition(GptPartition {
        name: name.to_string(),
        first_sector: 0,
        last_sector: PART_SECTORS - 1,
      }),
      bup_offset: bent.offset,
      length: bent.length as usize,
      redundant: false,
    };
    (bup, ent)
  }

  fn executor(validator: &BasicBctValidator, dry_run: bool, initialize: bool, bootdev_size: u64) -> Executor<'_> {
    Executor::new(SocGen::Gen2, BootMedium::Emmc, dry_run, initialize, bootdev_size, validator)
  }

  #[test]
  fn test_write_only_on_mismatch() {
    let validator = BasicBctValidator;
    let (mut bup, ent) = bup_single("bootloader", b"new-content");
    let mut dev = MemBlockDev::new(PART_BYTES);
    let mut bufs = Buffers::new(64, PART_BYTES);
    let mut exec = executor(&validator, false, false, PART_BYTES as u64);

    exec.process(&mut bup, &mut dev, None, &ent, &mut bufs).unwrap();
    assert_eq!(&dev.data[..11], b"new-content");
    assert!(dev.ops.contains(&Op::Zero {
      offset: 0,
      len: PART_BYTES
    }));

    // run again: content now matches, nothing is written
    dev.ops.clear();
    exec.process(&mut bup, &mut dev, None, &ent, &mut bufs).unwrap();
    assert_eq!(
      dev.ops,
      vec![Op::Read {
        offset: 0,
        len: PART_BYTES
      }]
    );
  }

  #[test]
  fn test_oversized_payload_is_fatal_before_writing() {
    let validator = BasicBctValidator;
    let payload = vec![0xaau8; PART_BYTES + 1];
    let (mut bup, ent) = bup_single("bootloader", &payload);
    let mut dev = MemBlockDev::new(PART_BYTES * 2);
    let mut bufs = Buffers::new(PART_BYTES + 1, PART_BYTES * 2);
    let mut exec = executor(&validator, false, false, (PART_BYTES * 2) as u64);

    assert!(matches!(
      exec.process(&mut bup, &mut dev, None, &ent, &mut bufs),
      Err(Error::PayloadTooLarge(name)) if name == "bootloader"
    ));
    assert!(dev.ops.is_empty());
  }

  #[test]
  fn test_dry_run_touches_no_device() {
    let validator = BasicBctValidator;
    let (mut bup, ent) = bup_single("bootloader", b"new-content");
    let mut dev = MemBlockDev::new(PART_BYTES);
    let mut bufs = Buffers::new(64, PART_BYTES);
    let mut exec = executor(&validator, true, false, PART_BYTES as u64);

    exec.process(&mut bup, &mut dev, None, &ent, &mut bufs).unwrap();
    assert!(dev.ops.is_empty());
    assert_eq!(dev.data, vec![0u8; PART_BYTES]);
  }

  #[test]
  fn test_entry_past_primary_goes_to_gpt_device() {
    let validator = BasicBctValidator;
    let (mut bup, mut ent) = bup_single("kernel", b"kernel-image");
    // partition starts at sector 8; primary device is 8 sectors long
    let bootdev_size = 8 * 512u64;
    ent.target = Target::Partition(GptPartition {
      name: "kernel".into(),
      first_sector: 8,
      last_sector: 8 + PART_SECTORS - 1,
    });
    let mut boot = MemBlockDev::new(bootdev_size as usize);
    let mut gptdev = MemBlockDev::new(PART_BYTES);
    let mut bufs = Buffers::new(64, PART_BYTES);
    let mut exec = executor(&validator, false, false, bootdev_size);

    exec
      .process(&mut bup, &mut boot, Some(&mut gptdev), &ent, &mut bufs)
      .unwrap();
    assert!(boot.ops.is_empty());
    // rebased to offset 0 on the secondary device
    assert_eq!(&gptdev.data[..12], b"kernel-image");
  }

  #[test]
  fn test_bct_entry_dispatches_and_sets_flag() {
    let validator = BasicBctValidator;
    let payload = vec![0xbcu8; 1024];
    let (mut bup, mut ent) = bup_single("BCT", &payload);
    // BCT partition: two blocks worth of space
    let part_sectors = (2 * 16384 / 512) as u64;
    ent.target = Target::Partition(GptPartition {
      name: "BCT".into(),
      first_sector: 0,
      last_sector: part_sectors - 1,
    });
    let partsize = part_sectors as usize * 512;
    let mut dev = MemBlockDev::new(partsize);
    let mut bufs = Buffers::new(2048, partsize);
    let mut exec = executor(&validator, false, true, partsize as u64);

    assert!(!exec.bct_updated);
    exec.process(&mut bup, &mut dev, None, &ent, &mut bufs).unwrap();
    assert!(exec.bct_updated);
    // initialize mode: all three slots written
    assert_eq!(dev.write_offsets(), vec![1024, 16384, 0]);
  }

  #[test]
  fn test_external_device_rewritten_whole() {
    let validator = BasicBctValidator;
    let dir = std::env::temp_dir().join(format!("executor-ext-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("APP");
    std::fs::write(&path, vec![0xffu8; 2048]).unwrap();

    let (mut bup, mut ent) = bup_single("APP", b"rootfs");
    ent.target = Target::Device(path.clone());
    let mut dev = MemBlockDev::new(PART_BYTES);
    let mut bufs = Buffers::new(64, 2048);
    let mut exec = executor(&validator, false, false, PART_BYTES as u64);

    exec.process(&mut bup, &mut dev, None, &ent, &mut bufs).unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(&written[..6], b"rootfs");
    // the rest of the device was erased to zero before the write
    assert!(written[6..].iter().all(|b| *b == 0));

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
