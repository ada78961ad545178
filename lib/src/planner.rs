use std::path::PathBuf;

use crate::bup::Bup;
use crate::gpt::{Gpt, GptPartition};
use crate::resolve;
use crate::soc::{BootMedium, Platform, SocGen};
use crate::{Error, Result, MAX_ENTRIES};

/// Fixed processing order for Gen1 platforms. `BCT` appears three times
/// to drive the three-pass BCT schedule. Only the eMMC variants carry
/// redundant copies of most boot partitions, and the redundant NVC name
/// differs between the two media.
const GEN1_EMMC_ORDER: &[&str] = &[
  "VER_b", "BCT", "NVC-1", "PT-1", "TBC-1", "RP1-1", "EBT-1", "WB0-1", "BPF-1", "DTB-1", "TOS-1", "EKS-1", "LNX-1",
  "BCT", "BCT", "PT", "TBC", "RP1", "EBT", "WB0", "BPF", "DTB", "TOS", "EKS", "LNX", "NVC", "VER",
];
const GEN1_SPI_ORDER: &[&str] = &[
  "VER_b", "BCT", "NVC_R", "BCT", "BCT", "PT", "TBC", "RP1", "EBT", "WB0", "BPF", "DTB", "TOS", "EKS", "LNX", "NVC",
  "VER",
];

/// Name of the redundant copy of a partition. Gen2/Gen3 platforms use
/// `_b` suffixes throughout; Gen1 uses `-1` except for NVC (`NVC_R` on
/// SPI flash, `NVC-1` on eMMC/SD) and VER (always `VER_b`).
pub fn redundant_name(base: &str, soc: SocGen, medium: BootMedium) -> String {
  if soc != SocGen::Gen1 {
    return format!("{base}_b");
  }
  match base {
    "NVC" if medium == BootMedium::SpiFlash => "NVC_R".to_string(),
    "NVC" => "NVC-1".to_string(),
    "VER" => "VER_b".to_string(),
    _ => format!("{base}-1"),
  }
}

/// Where an update entry's bytes are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
  /// A partition inside one of the two boot devices.
  Partition(GptPartition),
  /// An external block device resolved by partition label.
  Device(PathBuf),
}

/// One unit of work: a payload from the update package bound to its
/// destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
  pub partname: String,
  pub target: Target,
  pub bup_offset: u64,
  pub length: usize,
  pub redundant: bool,
}

impl UpdateEntry {
  /// Byte size of the destination. External devices are measured by
  /// opening them.
  pub fn target_size(&self) -> Result<usize> {
    match &self.target {
      Target::Partition(part) => Ok(part.byte_len()),
      Target::Device(path) => {
        use crate::blockio::BlockIo;
        let mut f = std::fs::File::open(path)?;
        Ok(BlockIo::len(&mut f)? as usize)
      }
    }
  }
}

/// The ordered worklist plus everything the executor needs to size its
/// buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
  pub entries: Vec<UpdateEntry>,
  /// In update mode, the descriptor for the mb1 copy that is *not* in
  /// the worklist, to be rewritten when the BCT changes.
  pub mb1_other: Option<UpdateEntry>,
  /// Largest payload length seen in the package.
  pub largest_payload: usize,
}

impl Plan {
  /// Byte size of the largest destination, rounded up to a whole
  /// sector, for sizing the slot and zero buffers.
  pub fn largest_partition(&self) -> Result<usize> {
    let mut largest = 0;
    for ent in &self.entries {
      largest = largest.max(ent.target_size()?);
    }
    if let Some(ent) = &self.mb1_other {
      largest = largest.max(ent.target_size()?);
    }
    Ok(crate::SECTOR_SIZE * largest.div_ceil(crate::SECTOR_SIZE))
  }
}

/// Builds the ordered worklist from the package entries, the partition
/// table, and the by-label directory.
pub struct Planner<'a> {
  pub soc: SocGen,
  pub medium: BootMedium,
  pub initialize: bool,
  /// Target slot suffix in update mode: empty for slot 0, `_b` for
  /// slot 1.
  pub suffix: String,
  pub platform: &'a dyn Platform,
  pub partlabel_root: PathBuf,
}

impl Planner<'_> {
  pub fn plan(&self, bup: &Bup, gpt: &Gpt) -> Result<Plan> {
    let cap_kind: &'static str = if self.initialize { "initialize" } else { "update" };
    let mut redundant: Vec<UpdateEntry> = Vec::new();
    let mut nonredundant: Vec<UpdateEntry> = Vec::new();
    let mut mb1_other: Option<UpdateEntry> = None;
    let mut largest_payload = 0usize;

    for bent in bup.entries() {
      let name = bent.name.as_str();
      let name_b = redundant_name(name, self.soc, self.medium);
      largest_payload = largest_payload.max(bent.length as usize);
      let make = |partname: &str, target: Target, is_redundant: bool| UpdateEntry {
        partname: partname.to_string(),
        target,
        bup_offset: bent.offset,
        length: bent.length as usize,
        redundant: is_redundant,
      };

      if let Some(part) = gpt.find_by_name(name) {
        // partition is located in the boot device
        let part_b = gpt.find_by_name(&name_b);
        if self.initialize {
          if part_b.is_some() || name == "BCT" {
            push_capped(&mut redundant, make(name, Target::Partition(part.clone()), true), cap_kind)?;
            if let Some(part_b) = part_b {
              push_capped(&mut redundant, make(&name_b, Target::Partition(part_b.clone()), true), cap_kind)?;
            }
          } else {
            push_capped(&mut nonredundant, make(name, Target::Partition(part.clone()), false), cap_kind)?;
          }
        } else if part_b.is_some() || name == "BCT" {
          let (chosen_name, chosen_part) = match part_b {
            Some(part_b) if !self.suffix.is_empty() => (name_b.as_str(), part_b),
            _ => (name, part),
          };
          push_capped(
            &mut redundant,
            make(chosen_name, Target::Partition(chosen_part.clone()), true),
            cap_kind,
          )?;
          if name == "mb1" {
            // remember the other copy in case the BCT update forces a
            // rewrite of both
            mb1_other = match (self.suffix.is_empty(), part_b) {
              (true, Some(part_b)) => Some(make(&name_b, Target::Partition(part_b.clone()), true)),
              (true, None) => None,
              (false, _) => Some(make(name, Target::Partition(part.clone()), true)),
            };
          }
        }
      } else {
        // normal partition, not in the boot device
        let Some(path) = resolve::external_device(&self.partlabel_root, name) else {
          if self.platform.partition_should_be_present(name) {
            return Err(Error::PartitionMissing(name.to_string()));
          }
          continue;
        };
        let path_b = resolve::external_device(&self.partlabel_root, &name_b);
        if self.initialize {
          if let Some(path_b) = path_b {
            push_capped(&mut redundant, make(name, Target::Device(path), true), cap_kind)?;
            push_capped(&mut redundant, make(&name_b, Target::Device(path_b), true), cap_kind)?;
          } else {
            push_capped(&mut nonredundant, make(name, Target::Device(path), false), cap_kind)?;
          }
        } else if let Some(path_b) = path_b {
          let (chosen_name, chosen_path) = if self.suffix.is_empty() {
            (name, path)
          } else {
            (name_b.as_str(), path_b)
          };
          push_capped(&mut redundant, make(chosen_name, Target::Device(chosen_path), true), cap_kind)?;
        }
      }
    }

    // Gen1 is never A/B: everything is processed as one group
    if self.soc == SocGen::Gen1 {
      if redundant.len() + nonredundant.len() > MAX_ENTRIES {
        return Err(Error::TooManyEntries(cap_kind));
      }
      redundant.append(&mut nonredundant);
    }

    let entries = match self.soc {
      SocGen::Gen1 => order_gen1(redundant, self.medium)?,
      _ => {
        let mut ordered = order_gen23(redundant);
        ordered.append(&mut nonredundant);
        ordered
      }
    };

    Ok(Plan {
      entries,
      mb1_other,
      largest_payload,
    })
  }
}

fn push_capped(list: &mut Vec<UpdateEntry>, entry: UpdateEntry, kind: &'static str) -> Result<()> {
  if list.len() >= MAX_ENTRIES {
    return Err(Error::TooManyEntries(kind));
  }
  list.push(entry);
  Ok(())
}

/// Gen2/Gen3 precedence: everything else first in original order, then
/// mb2/mb2_b, then the BCT entries, then mb1/mb1_b. The bootrom chains
/// BCT to mb1, and the BCT describes mb2, so mb2 must land before the
/// BCT and the BCT before mb1.
fn order_gen23(entries: Vec<UpdateEntry>) -> Vec<UpdateEntry> {
  let input_len = entries.len();
  let mut ordered = Vec::with_capacity(input_len);
  let (mut mb1, mut mb1_b, mut mb2, mut mb2_b) = (None, None, None, None);
  let mut bcts: Vec<UpdateEntry> = Vec::new();

  for ent in entries {
    if ent.partname == "mb1" {
      mb1 = Some(ent);
    } else if ent.partname == "mb1_b" {
      mb1_b = Some(ent);
    } else if ent.partname == "mb2" {
      mb2 = Some(ent);
    } else if ent.partname == "mb2_b" {
      mb2_b = Some(ent);
    } else if ent.partname == "BCT" {
      if bcts.len() < 3 {
        bcts.push(ent);
      }
    } else {
      ordered.push(ent);
    }
  }
  ordered.extend(mb2);
  ordered.extend(mb2_b);
  ordered.append(&mut bcts);
  ordered.extend(mb1);
  ordered.extend(mb1_b);

  if ordered.len() != input_len {
    tracing::warn!("ordered entry list mismatch");
  }
  ordered
}

/// Gen1 fixed-sequence ordering. Entries named by the platform's order
/// table are emitted in table order (`BCT` three times); a missing EKS
/// is silently skipped, any other missing name is fatal; entries not in
/// the table are appended at the end.
fn order_gen1(entries: Vec<UpdateEntry>, medium: BootMedium) -> Result<Vec<UpdateEntry>> {
  let order = match medium {
    BootMedium::SpiFlash => GEN1_SPI_ORDER,
    BootMedium::Emmc => GEN1_EMMC_ORDER,
  };
  let mut used = vec![false; entries.len()];
  let mut ordered = Vec::new();
  for name in order {
    match entries.iter().position(|e| e.partname == *name) {
      Some(idx) => {
        ordered.push(entries[idx].clone());
        used[idx] = true;
      }
      None if name.starts_with("EKS") => continue,
      None => return Err(Error::EntryNotFound(name.to_string())),
    }
  }
  for (idx, ent) in entries.iter().enumerate() {
    if !used[idx] {
      ordered.push(ent.clone());
    }
  }
  Ok(ordered)
}
