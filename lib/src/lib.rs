mod bct;
mod blockio;
mod bup;
mod executor;
mod gate;
mod gpt;
mod planner;
mod resolve;
mod smd;
mod soc;
mod updater;
mod ver;

#[cfg(test)]
pub(crate) mod testutil;

pub use bct::{BasicBctValidator, BctPass, BctValidator};
pub use blockio::BlockIo;
pub use bup::{Bup, BupEntry, ReadSeek};
pub use executor::Buffers;
pub use gpt::{Gpt, GptPartition, LayoutConfig};
pub use planner::{Plan, Planner, Target, UpdateEntry};
pub use smd::{Redundancy, Smd};
pub use soc::{BootMedium, LinuxPlatform, Platform, SocGen};
pub use updater::{Outcome, UpdateOptions, Updater};
pub use ver::{BspVersion, VerInfo};

pub type Result<T> = std::result::Result<T, Error>;
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("unrecognized boot device: {0}")]
  UnknownBootDevice(String),
  #[error("could not determine SoC generation")]
  UnknownSoc,
  #[error("unsupported operation for this platform: {0}")]
  UnsupportedOperation(String),
  #[error("malformed update package: {0}")]
  MalformedPackage(String),
  #[error("missing entries for partition(s) {0} for TNSPEC {1}")]
  MissingPackageEntries(String, String),
  #[error("cannot locate partition: {0}")]
  PartitionMissing(String),
  #[error("partition {0} starts past end of boot device")]
  PastEndOfBootDevice(String),
  #[error("too many partitions to {0}")]
  TooManyEntries(&'static str),
  #[error("payload or partition not found for {0}")]
  EntryNotFound(String),
  #[error("update package contents too large for boot partition {0}")]
  PayloadTooLarge(String),
  #[error("validation check failed for BCT update")]
  BctValidation,
  #[error("BCT update payload not an even multiple of boot device page size")]
  BctPayloadAlignment,
  #[error("{0} BCT payload(s) too large for boot device block size")]
  BctPayloadTooLarge(usize),
  #[error("internal error: incorrect BCT update function for this SoC")]
  WrongBctVariant,
  #[error("cannot load boot sector partition table: {0}")]
  MalformedTable(String),
  #[error("could not read version info from update package")]
  PayloadVersionUnreadable,
  #[error("current bootloader version is {current}; cannot roll back to {payload}")]
  Rollback { current: BspVersion, payload: BspVersion },
  #[error("NVC partition mismatch - reflash required")]
  NvcMismatch,
  #[error("previous update was incomplete; please update with version {expected}")]
  IncompleteUpdate { expected: BspVersion },
  #[error("bootloader version partitions are corrupted; cannot apply update")]
  CorruptVersionInfo,
  #[error("slot metadata is corrupted: {0}")]
  CorruptSlotMetadata(String),
  #[error("could not update alternate mb1 partition")]
  AlternateMb1Missing,
}

/// Logical sector size used by the partition tables of every supported
/// boot device.
pub const SECTOR_SIZE: usize = 512;

/// Cap on the number of entries in each of the planner's two
/// classification groups.
pub const MAX_ENTRIES: usize = 64;

/// Directory where the OS exposes external partitions by label.
pub const PARTLABEL_DIR: &str = "/dev/disk/by-partlabel";
