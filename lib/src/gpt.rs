use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blockio::BlockIo;
use crate::{Error, Result, SECTOR_SIZE};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;
const GPT_ENTRY_SIZE: usize = 128;
const GPT_MAX_ENTRIES: usize = 128;
// entry array sectors preceding the backup header at the end of the device
const GPT_ENTRY_SECTORS: u64 = (GPT_ENTRY_SIZE * GPT_MAX_ENTRIES / SECTOR_SIZE) as u64;

/// Default location of the partition layout configuration.
pub const DEFAULT_LAYOUT_CONFIG: &str = "/etc/bupflash/layout.json";

// generic type GUID stamped on entries we create ourselves
const BOOTPART_TYPE_GUID: [u8; 16] = [
  0x16, 0x9a, 0x1f, 0x3b, 0x5c, 0x0d, 0x42, 0xd1, 0x8e, 0x2c, 0x64, 0x33, 0x41, 0x7e, 0x10, 0xa9,
];

/// One partition of the boot device GPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptPartition {
  pub name: String,
  pub first_sector: u64,
  pub last_sector: u64,
}

impl GptPartition {
  pub fn byte_offset(&self) -> u64 {
    self.first_sector * SECTOR_SIZE as u64
  }

  pub fn byte_len(&self) -> usize {
    ((self.last_sector - self.first_sector + 1) as usize) * SECTOR_SIZE
  }
}

/// Configured partition layout, used to build the table when
/// initializing and to answer the repartition check.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LayoutConfig {
  /// Hex disk GUID to stamp into a newly written table.
  pub disk_guid: Option<String>,
  pub partitions: Vec<LayoutPartition>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LayoutPartition {
  pub name: String,
  pub first_sector: u64,
  pub last_sector: u64,
}

impl LayoutConfig {
  pub fn load(path: &Path) -> Result<Self> {
    let json = std::fs::read_to_string(path)?;
    let this: LayoutConfig = serde_json::from_str(&json)?;
    for p in &this.partitions {
      if p.last_sector < p.first_sector {
        return Err(Error::MalformedTable(format!(
          "configured partition {} ends before it starts",
          p.name
        )));
      }
    }
    Ok(this)
  }

  fn disk_guid_bytes(&self) -> [u8; 16] {
    let mut guid = [0u8; 16];
    if let Some(text) = &self.disk_guid {
      let hex: String = text.chars().filter(char::is_ascii_hexdigit).collect();
      for (i, chunk) in hex.as_bytes().chunks(2).take(16).enumerate() {
        if let Ok(b) = u8::from_str_radix(std::str::from_utf8(chunk).unwrap_or(""), 16) {
          guid[i] = b;
        }
      }
    }
    guid
  }
}

/// Boot-device partition table access. The table of record is the
/// vendor-special backup GPT stored at the very end of the GPT device;
/// there is no primary copy at the start.
pub struct Gpt {
  config_path: PathBuf,
  partitions: Vec<GptPartition>,
  loaded: bool,
}

impl Gpt {
  pub fn new(config_path: PathBuf) -> Self {
    Self {
      config_path,
      partitions: Vec::new(),
      loaded: false,
    }
  }

  /// Load the backup table from the end of the device.
  pub fn load(&mut self, dev: &mut dyn BlockIo) -> Result<()> {
    let dev_size = dev.len()?;
    if dev_size < (GPT_ENTRY_SECTORS + 2) * SECTOR_SIZE as u64 {
      return Err(Error::MalformedTable("device too small for a partition table".into()));
    }
    let header_lba = dev_size / SECTOR_SIZE as u64 - 1;
    let mut header = [0u8; SECTOR_SIZE];
    dev.read_exact_at(&mut header, header_lba * SECTOR_SIZE as u64)?;

    if &header[0..8] != GPT_SIGNATURE {
      return Err(Error::MalformedTable("backup header signature not found".into()));
    }
    let header_size = le32(&header[12..16]) as usize;
    if !(92..=SECTOR_SIZE).contains(&header_size) {
      return Err(Error::MalformedTable("bad backup header size".into()));
    }
    let stored_crc = le32(&header[16..20]);
    let mut crc_input = header[..header_size].to_vec();
    crc_input[16..20].fill(0);
    if crc32fast::hash(&crc_input) != stored_crc {
      return Err(Error::MalformedTable("backup header checksum mismatch".into()));
    }

    let entries_lba = le64(&header[72..80]);
    let entry_count = le32(&header[80..84]) as usize;
    let entry_size = le32(&header[84..88]) as usize;
    let entries_crc = le32(&header[88..92]);
    if entry_size < 128 || entry_count > GPT_MAX_ENTRIES {
      return Err(Error::MalformedTable("unsupported entry geometry".into()));
    }

    let mut entries = vec![0u8; entry_count * entry_size];
    dev.read_exact_at(&mut entries, entries_lba * SECTOR_SIZE as u64)?;
    if crc32fast::hash(&entries) != entries_crc {
      return Err(Error::MalformedTable("entry array checksum mismatch".into()));
    }

    self.partitions.clear();
    for rec in entries.chunks(entry_size) {
      if rec[0..16].iter().all(|b| *b == 0) {
        continue;
      }
      let first_sector = le64(&rec[32..40]);
      let last_sector = le64(&rec[40..48]);
      let name: String = char::decode_utf16(
        rec[56..128]
          .chunks(2)
          .map(|c| u16::from_le_bytes([c[0], c[1]]))
          .take_while(|u| *u != 0),
      )
      .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
      .collect();
      self.partitions.push(GptPartition {
        name,
        first_sector,
        last_sector,
      });
    }
    tracing::debug!("loaded {} partitions from backup table", self.partitions.len());
    self.loaded = true;
    Ok(())
  }

  /// Populate the table from the layout configuration instead of the
  /// device, for first-time initialization.
  pub fn load_from_config(&mut self) -> Result<()> {
    let config = LayoutConfig::load(&self.config_path)?;
    self.partitions = config
      .partitions
      .iter()
      .map(|p| GptPartition {
        name: p.name.clone(),
        first_sector: p.first_sector,
        last_sector: p.last_sector,
      })
      .collect();
    tracing::debug!(
      "loaded {} partitions from layout config {}",
      self.partitions.len(),
      self.config_path.display()
    );
    self.loaded = true;
    Ok(())
  }

  /// Write the current table back as a backup GPT at the end of the
  /// device.
  pub fn save(&self, dev: &mut dyn BlockIo) -> Result<()> {
    if self.partitions.len() > GPT_MAX_ENTRIES {
      return Err(Error::MalformedTable("too many partitions to save".into()));
    }
    let dev_size = dev.len()?;
    let header_lba = dev_size / SECTOR_SIZE as u64 - 1;
    let entries_lba = header_lba - GPT_ENTRY_SECTORS;

    let mut entries = vec![0u8; GPT_ENTRY_SIZE * GPT_MAX_ENTRIES];
    for (i, part) in self.partitions.iter().enumerate() {
      let rec = &mut entries[i * GPT_ENTRY_SIZE..(i + 1) * GPT_ENTRY_SIZE];
      rec[0..16].copy_from_slice(&BOOTPART_TYPE_GUID);
      rec[16..32].copy_from_slice(&unique_guid(i as u32));
      rec[32..40].copy_from_slice(&part.first_sector.to_le_bytes());
      rec[40..48].copy_from_slice(&part.last_sector.to_le_bytes());
      for (j, unit) in part.name.encode_utf16().take(36).enumerate() {
        rec[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
      }
    }

    let config = LayoutConfig::load(&self.config_path).unwrap_or(LayoutConfig {
      disk_guid: None,
      partitions: Vec::new(),
    });
    let mut header = [0u8; SECTOR_SIZE];
    header[0..8].copy_from_slice(GPT_SIGNATURE);
    header[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
    header[12..16].copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    header[24..32].copy_from_slice(&header_lba.to_le_bytes());
    // alternate points at the conventional primary location even though
    // this device only carries the backup copy
    header[32..40].copy_from_slice(&1u64.to_le_bytes());
    header[40..48].copy_from_slice(&2u64.to_le_bytes());
    header[48..56].copy_from_slice(&(entries_lba - 1).to_le_bytes());
    header[56..72].copy_from_slice(&config.disk_guid_bytes());
    header[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    header[80..84].copy_from_slice(&(GPT_MAX_ENTRIES as u32).to_le_bytes());
    header[84..88].copy_from_slice(&(GPT_ENTRY_SIZE as u32).to_le_bytes());
    header[88..92].copy_from_slice(&crc32fast::hash(&entries).to_le_bytes());
    let header_crc = crc32fast::hash(&header[..GPT_HEADER_SIZE as usize]);
    header[16..20].copy_from_slice(&header_crc.to_le_bytes());

    dev.write_exact_at(&entries, entries_lba * SECTOR_SIZE as u64, &[])?;
    dev.write_exact_at(&header, header_lba * SECTOR_SIZE as u64, &[])?;
    dev.flush()?;
    tracing::info!("wrote boot sector partition table ({} partitions)", self.partitions.len());
    Ok(())
  }

  pub fn find_by_name(&self, name: &str) -> Option<&GptPartition> {
    self.partitions.iter().find(|p| p.name == name)
  }

  pub fn partitions(&self) -> &[GptPartition] {
    &self.partitions
  }

  /// Compare the loaded table against the configured layout. `Ok(true)`
  /// means every configured partition is present with the same extent
  /// and nothing extra exists.
  pub fn layout_config_match(&self) -> Result<bool> {
    if !self.loaded {
      return Err(Error::MalformedTable("no partition table loaded".into()));
    }
    let config = LayoutConfig::load(&self.config_path)?;
    if config.partitions.len() != self.partitions.len() {
      return Ok(false);
    }
    for want in &config.partitions {
      match self.find_by_name(&want.name) {
        Some(have) if have.first_sector == want.first_sector && have.last_sector == want.last_sector => {}
        _ => return Ok(false),
      }
    }
    Ok(true)
  }
}

fn le32(b: &[u8]) -> u32 {
  u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le64(b: &[u8]) -> u64 {
  u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn unique_guid(index: u32) -> [u8; 16] {
  let mut guid = BOOTPART_TYPE_GUID;
  guid[12..16].copy_from_slice(&(index + 1).to_le_bytes());
  guid
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::MemBlockDev;

  fn write_config(name: &str, partitions: &[(&str, u64, u64)]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gpt-test-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("layout.json");
    let config = LayoutConfig {
      disk_guid: Some("00112233445566778899aabbccddeeff".into()),
      partitions: partitions
        .iter()
        .map(|(n, f, l)| LayoutPartition {
          name: n.to_string(),
          first_sector: *f,
          last_sector: *l,
        })
        .collect(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
  }

  #[test]
  fn test_partition_extents() {
    let p = GptPartition {
      name: "BCT".into(),
      first_sector: 4,
      last_sector: 7,
    };
    assert_eq!(p.byte_offset(), 2048);
    assert_eq!(p.byte_len(), 2048);
  }

  #[test]
  fn test_save_and_reload_roundtrip() {
    let config = write_config("roundtrip", &[("BCT", 0, 63), ("mb1", 64, 127), ("mb1_b", 128, 191)]);
    let mut gpt = Gpt::new(config);
    gpt.load_from_config().unwrap();

    let mut dev = MemBlockDev::new(256 * 1024);
    gpt.save(&mut dev).unwrap();

    let mut reread = Gpt::new(PathBuf::from("/nonexistent/layout.json"));
    reread.load(&mut dev).unwrap();
    assert_eq!(reread.partitions(), gpt.partitions());
    assert_eq!(reread.find_by_name("mb1_b").unwrap().first_sector, 128);
    assert!(reread.find_by_name("mb2").is_none());
  }

  #[test]
  fn test_load_rejects_corrupt_header() {
    let mut dev = MemBlockDev::new(256 * 1024);
    let mut gpt = Gpt::new(PathBuf::from("/nonexistent/layout.json"));
    assert!(gpt.load(&mut dev).is_err());

    let config = write_config("corrupt", &[("BCT", 0, 63)]);
    let mut gpt = Gpt::new(config);
    gpt.load_from_config().unwrap();
    gpt.save(&mut dev).unwrap();
    // flip a bit in the entry array
    let entries_offset = dev.data.len() - (1 + GPT_ENTRY_SECTORS as usize) * SECTOR_SIZE;
    dev.data[entries_offset] ^= 1;
    let mut reread = Gpt::new(PathBuf::from("/nonexistent/layout.json"));
    assert!(reread.load(&mut dev).is_err());
  }

  #[test]
  fn test_layout_config_match() {
    let config = write_config("match", &[("BCT", 0, 63), ("mb1", 64, 127)]);
    let mut dev = MemBlockDev::new(256 * 1024);
    let mut gpt = Gpt::new(config.clone());
    gpt.load_from_config().unwrap();
    gpt.save(&mut dev).unwrap();

    let mut reread = Gpt::new(config);
    assert!(reread.layout_config_match().is_err());
    reread.load(&mut dev).unwrap();
    assert!(reread.layout_config_match().unwrap());

    // shrink a partition on disk and the layouts no longer agree
    let mismatched = write_config("mismatch", &[("BCT", 0, 63), ("mb1", 64, 100)]);
    let reread = Gpt {
      config_path: mismatched,
      partitions: reread.partitions.clone(),
      loaded: true,
    };
    assert!(!reread.layout_config_match().unwrap());
  }
}
