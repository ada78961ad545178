use crate::blockio::BlockIo;
use crate::soc::{BootMedium, SocGen};
use crate::{Error, Result};

/// Validation hook consulted before a BCT is rewritten. Implementations
/// decide whether `candidate` is an acceptable replacement for the BCT
/// currently on the device.
pub trait BctValidator {
  /// Gen2/Gen3 check.
  fn update_valid(&self, soc: SocGen, current: &[u8], candidate: &[u8]) -> bool;

  /// Gen1 check. Implementations may correct `block_size`/`page_size`
  /// when the current BCT declares a different boot device geometry.
  fn update_valid_multi(&self, current: &[u8], candidate: &[u8], block_size: &mut usize, page_size: &mut usize)
    -> bool;
}

/// Structural validation only: the candidate must be non-empty and fit
/// within the current copy region. Signature-level checks belong to the
/// vendor tooling behind this trait.
pub struct BasicBctValidator;

impl BctValidator for BasicBctValidator {
  fn update_valid(&self, _soc: SocGen, current: &[u8], candidate: &[u8]) -> bool {
    !candidate.is_empty() && candidate.len() <= current.len()
  }

  fn update_valid_multi(
    &self,
    current: &[u8],
    candidate: &[u8],
    _block_size: &mut usize,
    _page_size: &mut usize,
  ) -> bool {
    !candidate.is_empty() && candidate.len() <= current.len()
  }
}

/// Which Gen1 BCT copies the next call will write. The schedule is
/// last copy alone, then the middle copies in descending order, then the
/// first copy, so that at least one valid BCT is reachable at every
/// intermediate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BctPass {
  Last,
  Middle,
  First,
}

impl BctPass {
  fn next(self) -> Self {
    match self {
      BctPass::Last => BctPass::Middle,
      BctPass::Middle => BctPass::First,
      BctPass::First => BctPass::Last,
    }
  }
}

fn matches_at(current: Option<&[u8]>, offset: usize, candidate: &[u8]) -> bool {
  match current {
    Some(cur) if offset + candidate.len() <= cur.len() => &cur[offset..offset + candidate.len()] == candidate,
    _ => false,
  }
}

/// Write a Gen2/Gen3 BCT update. The partition holds two blocks of
/// page-aligned slots; the write order block0/slot1, block1/slot0,
/// block0/slot0 keeps a bootable copy present even if power is cut
/// between passes.
#[allow(clippy::too_many_arguments)]
pub fn update_gen23<B: BlockIo + ?Sized>(
  dev: &mut B,
  validator: &dyn BctValidator,
  soc: SocGen,
  medium: BootMedium,
  current: Option<&[u8]>,
  candidate: &[u8],
  part_offset: u64,
  zero: &[u8],
) -> Result<()> {
  if soc == SocGen::Gen1 {
    return Err(Error::WrongBctVariant);
  }
  if let Some(cur) = current {
    if !validator.update_valid(soc, cur, candidate) {
      return Err(Error::BctValidation);
    }
  }

  let page_size = medium.page_size();
  let block_size = medium.block_size();
  let slot_size = page_size * candidate.len().div_ceil(page_size);

  for offset in [slot_size, block_size, 0] {
    if matches_at(current, offset, candidate) {
      tracing::info!("BCT: [offset={}, no update needed]", offset);
      continue;
    }
    tracing::info!("BCT: [offset={}]", offset);
    dev.write_exact_at(candidate, part_offset + offset as u64, &zero[..slot_size])?;
  }

  dev.flush()?;
  Ok(())
}

/// Write a Gen1 BCT update pass. Gen1 partitions hold up to 64 copies of
/// the BCT, one per block (SPI flash platforms put a second copy in
/// block 0). One call writes the copies selected by `pass` and advances
/// it; the executor triggers three calls per update.
#[allow(clippy::too_many_arguments)]
pub fn update_gen1<B: BlockIo + ?Sized>(
  dev: &mut B,
  validator: &dyn BctValidator,
  soc: SocGen,
  medium: BootMedium,
  current: Option<&[u8]>,
  candidate: &[u8],
  part_size: usize,
  part_offset: u64,
  pass: &mut BctPass,
  zero: &[u8],
) -> Result<()> {
  if soc != SocGen::Gen1 {
    return Err(Error::WrongBctVariant);
  }
  let mut block_size = medium.block_size();
  let mut page_size = medium.page_size();
  let bct_copies = medium.gen1_bct_copies();
  if let Some(cur) = current {
    if !validator.update_valid_multi(cur, candidate, &mut block_size, &mut page_size) {
      return Err(Error::BctValidation);
    }
  }
  if candidate.len() % page_size != 0 {
    return Err(Error::BctPayloadAlignment);
  }
  if candidate.len() * bct_copies > block_size {
    return Err(Error::BctPayloadTooLarge(bct_copies));
  }
  let bct_count = (part_size / block_size).min(64);
  if bct_count == 0 {
    return Err(Error::BctPayloadTooLarge(bct_copies));
  }

  let indices: Vec<usize> = match *pass {
    BctPass::Last => vec![bct_count - 1],
    BctPass::Middle => (1..bct_count.saturating_sub(1)).rev().collect(),
    BctPass::First => vec![0],
  };
  *pass = pass.next();

  for idx in indices {
    let offset = idx * block_size;
    let name = if idx == 0 {
      "BCT".to_string()
    } else {
      format!("BCT-{idx}")
    };
    if matches_at(current, offset, candidate) {
      tracing::info!("{}: [no update needed]", name);
      continue;
    }
    tracing::info!("{}: writing copy at offset {}", name, offset);
    dev.write_exact_at(candidate, part_offset + offset as u64, &zero[..candidate.len()])?;
    if idx == 0 && bct_copies == 2 {
      let offset = offset + candidate.len();
      dev.write_exact_at(candidate, part_offset + offset as u64, &zero[..candidate.len()])?;
    }
  }

  dev.flush()?;
  Ok(())
}
