use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::bct::BctValidator;
use crate::blockio::BlockIo;
use crate::bup::Bup;
use crate::executor::{Buffers, Executor};
use crate::gate;
use crate::gpt::{Gpt, DEFAULT_LAYOUT_CONFIG};
use crate::planner::Planner;
use crate::smd::{Redundancy, Smd};
use crate::soc::{Platform, SocGen};
use crate::{Error, Result, PARTLABEL_DIR};

/// What a run is asked to do, as resolved from the command line.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
  /// Path of the bootloader update package.
  pub package: PathBuf,
  /// First-time initialization of the entire set of boot partitions.
  pub initialize: bool,
  /// Update only the redundant partitions with this suffix (normalized:
  /// empty string for slot 0, `_b` for slot 1); no slot metadata update.
  pub slot_suffix: Option<String>,
  /// Log intended actions without writing.
  pub dry_run: bool,
  /// Repartition-check mode (read-only, implies dry run).
  pub check_only: bool,
  /// Partition layout configuration path.
  pub layout_config: PathBuf,
}

impl UpdateOptions {
  pub fn new(package: PathBuf) -> Self {
    Self {
      package,
      initialize: false,
      slot_suffix: None,
      dry_run: false,
      check_only: false,
      layout_config: PathBuf::from(DEFAULT_LAYOUT_CONFIG),
    }
  }
}

/// Result of a successful run, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Update applied (or fully simulated).
  Completed,
  /// Check mode: on-device layout differs from the configuration.
  RepartitionNeeded,
  /// Check mode: layout already matches (always the case on Gen1).
  NoRepartitionNeeded,
  /// Check mode: the comparison itself failed.
  CompareFailed,
}

impl Outcome {
  pub fn exit_code(self) -> i32 {
    match self {
      Outcome::Completed | Outcome::RepartitionNeeded => 0,
      Outcome::NoRepartitionNeeded => 1,
      Outcome::CompareFailed => 2,
    }
  }
}

/// Restores a boot device's write protection when dropped, so every exit
/// path undoes the toggle.
struct WriteableGuard<'a> {
  platform: &'a dyn Platform,
  device: String,
  restore: bool,
}

impl<'a> WriteableGuard<'a> {
  fn engage(platform: &'a dyn Platform, device: &str) -> Result<Self> {
    let prior = platform.set_bootdev_writeable(device, true)?;
    Ok(Self {
      platform,
      device: device.to_string(),
      restore: !prior,
    })
  }
}

impl Drop for WriteableGuard<'_> {
  fn drop(&mut self) {
    if self.restore {
      if let Err(err) = self.platform.set_bootdev_writeable(&self.device, false) {
        tracing::warn!("could not restore write protection on {}: {}", self.device, err);
      }
    }
  }
}

/// Slot that becomes active after a successful run.
fn target_slot(initialize: bool, current_slot: u32) -> u32 {
  if initialize {
    0
  } else {
    1 - current_slot
  }
}

/// The one orchestration object for a program run: owns the package, the
/// device handles, the partition table, the slot metadata and the
/// buffers, and drives plan, gate, execute, activate in order.
pub struct Updater<'a> {
  opts: &'a UpdateOptions,
  platform: &'a dyn Platform,
  validator: &'a dyn BctValidator,
}

impl<'a> Updater<'a> {
  pub fn new(opts: &'a UpdateOptions, platform: &'a dyn Platform, validator: &'a dyn BctValidator) -> Self {
    Self {
      opts,
      platform,
      validator,
    }
  }

  pub fn run(&self) -> Result<Outcome> {
    let opts = self.opts;
    let soc = self.platform.soc_gen()?;
    let slot_specified = opts.slot_suffix.is_some();
    if soc == SocGen::Gen1 && slot_specified {
      return Err(Error::UnsupportedOperation("slot selection".into()));
    }
    // Gen1 platforms are not A/B: every run re-initializes, and an
    // explicit request additionally forces the version gate.
    let initialize = opts.initialize || soc == SocGen::Gen1;
    let force_initialize = opts.initialize;

    let mut bup = Bup::open(&opts.package)?;
    tracing::info!("native TNSPEC:   {}", bup.tnspec());
    if let Some(compat) = bup.compat_spec() {
      tracing::info!("compatible with: {}", compat);
    }
    let medium = crate::soc::BootMedium::from_boot_device(bup.boot_device())?;

    // The guards are declared before the handles so write protection is
    // restored after the files close, on every exit path.
    let mut _gpt_guard = None;
    let mut _boot_guard = None;

    let mut gptdev: Option<Box<dyn BlockIo>> = if medium.has_gpt_device() {
      let path = bup.gpt_device().to_string();
      let file = if opts.dry_run {
        OpenOptions::new().read(true).open(&path)?
      } else {
        _gpt_guard = Some(WriteableGuard::engage(self.platform, &path)?);
        OpenOptions::new().read(true).write(true).open(&path)?
      };
      Some(Box::new(file))
    } else {
      None
    };

    let boot_path = bup.boot_device().to_string();
    let mut bootdev: Box<dyn BlockIo> = {
      let file = if opts.dry_run {
        OpenOptions::new().read(true).open(&boot_path)?
      } else {
        _boot_guard = Some(WriteableGuard::engage(self.platform, &boot_path)?);
        OpenOptions::new().read(true).write(true).open(&boot_path)?
      };
      Box::new(file)
    };

    let mut gpt = Gpt::new(opts.layout_config.clone());

    if opts.check_only {
      return self.check_repartition(soc, &mut gpt, &mut bootdev, &mut gptdev);
    }

    if initialize {
      gpt.load_from_config()?;
    } else {
      let io = gpt_io(&mut bootdev, &mut gptdev);
      gpt.load(io)?;
    }
    if initialize && !opts.dry_run && soc != SocGen::Gen1 {
      let io = gpt_io(&mut bootdev, &mut gptdev);
      gpt.save(io)?;
    }

    let bootdev_size = bootdev.len()?;

    let mut smd = if soc == SocGen::Gen1 {
      None
    } else if initialize {
      Some(Smd::new(Redundancy::Full))
    } else {
      Some(Smd::load(
        &gpt,
        &mut *bootdev,
        gptdev.as_mut().map(|d| &mut **d),
        bootdev_size,
      )?)
    };

    let mut current_slot = 0;
    let suffix = match &opts.slot_suffix {
      Some(suffix) => suffix.clone(),
      None if !initialize && soc != SocGen::Gen1 => {
        current_slot = smd.as_ref().unwrap().current_slot();
        if current_slot == 0 { "_b".to_string() } else { String::new() }
      }
      None => String::new(),
    };

    if let Some(smd) = &mut smd {
      if !slot_specified && smd.redundancy_level() != Redundancy::Full {
        if opts.dry_run {
          tracing::info!("[skip] enable redundancy in slot metadata");
        } else {
          smd.set_redundancy_level(Redundancy::Full);
        }
      }
    }

    let missing = bup.missing_entries();
    if !missing.is_empty() {
      return Err(Error::MissingPackageEntries(missing.join(", "), bup.tnspec().to_string()));
    }

    let planner = Planner {
      soc,
      medium,
      initialize,
      suffix,
      platform: self.platform,
      partlabel_root: PathBuf::from(PARTLABEL_DIR),
    };
    let plan = planner.plan(&bup, &gpt)?;
    let mut bufs = Buffers::new(plan.largest_payload, plan.largest_partition()?);

    gate::check(
      &mut bup,
      &mut *bootdev,
      gptdev.as_mut().map(|d| &mut **d),
      bootdev_size,
      &plan.entries,
      soc,
      medium,
      force_initialize,
      &mut bufs,
    )?;

    let mut exec = Executor::new(soc, medium, opts.dry_run, initialize, bootdev_size, self.validator);
    for ent in &plan.entries {
      exec.process(
        &mut bup,
        &mut *bootdev,
        gptdev.as_mut().map(|d| &mut **d),
        ent,
        &mut bufs,
      )?;
    }

    // A BCT change makes the bootrom re-read mb1, so both copies have to
    // match the new table.
    if soc != SocGen::Gen1 && !initialize && exec.bct_updated {
      match &plan.mb1_other {
        Some(ent) => exec.process(
          &mut bup,
          &mut *bootdev,
          gptdev.as_mut().map(|d| &mut **d),
          ent,
          &mut bufs,
        )?,
        None => return Err(Error::AlternateMb1Missing),
      }
    }

    if soc != SocGen::Gen1 && !slot_specified {
      let new_slot = target_slot(initialize, current_slot);
      if opts.dry_run {
        tracing::info!("[skip] mark slot {} as active", new_slot);
      } else {
        let smd = smd.as_mut().unwrap();
        smd.mark_slot_active(new_slot);
        tracing::info!("slot {} marked as active for next boot", new_slot);
        if let Err(err) = smd.persist(&gpt, &mut *bootdev, gptdev.as_mut().map(|d| &mut **d), bootdev_size) {
          tracing::error!("updating slot metadata: {}", err);
        }
      }
    }

    if !opts.dry_run {
      bootdev.flush()?;
      if let Some(dev) = &mut gptdev {
        dev.flush()?;
      }
    }
    Ok(Outcome::Completed)
  }

  fn check_repartition(
    &self,
    soc: SocGen,
    gpt: &mut Gpt,
    bootdev: &mut Box<dyn BlockIo>,
    gptdev: &mut Option<Box<dyn BlockIo>>,
  ) -> Result<Outcome> {
    // Gen1 boot devices carry no GPT; initialization rewrites everything
    // anyway, so a repartition is never called for.
    if soc == SocGen::Gen1 {
      return Ok(Outcome::NoRepartitionNeeded);
    }
    let io = gpt_io(bootdev, gptdev);
    if let Err(err) = gpt.load(io) {
      tracing::info!("no usable partition table on device: {}", err);
      return Ok(Outcome::RepartitionNeeded);
    }
    match gpt.layout_config_match() {
      Err(err) => {
        tracing::error!("could not compare existing boot partition layout with configuration: {}", err);
        Ok(Outcome::CompareFailed)
      }
      Ok(true) => Ok(Outcome::NoRepartitionNeeded),
      Ok(false) => Ok(Outcome::RepartitionNeeded),
    }
  }
}

/// The partition table lives on the GPT device when the platform has
/// one, otherwise on the boot device itself.
fn gpt_io<'b>(bootdev: &'b mut Box<dyn BlockIo>, gptdev: &'b mut Option<Box<dyn BlockIo>>) -> &'b mut dyn BlockIo {
  match gptdev {
    Some(dev) => &mut **dev,
    None => &mut **bootdev,
  }
}
