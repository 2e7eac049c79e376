//! Partition table parsing
//!
//! A device's first sector is offered to a list of parser strategies in
//! priority order; the first one that recognizes the layout yields the
//! partition entries. The default order is:
//!
//! 1. a filesystem written directly to the device (no table at all)
//! 2. GPT, behind its protective MBR
//! 3. classic MBR with four primary slots

use crate::drivers::block::{BlockError, ByteBlockDevice, SECTOR_SIZE};
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// GPT header signature "EFI PART"
const GPT_SIGNATURE: u64 = 0x5452415020494645;

/// MBR partition type of the GPT protective entry
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// MBR partition types that point at an extended partition chain
const MBR_EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

/// Offset of the four primary entries in an MBR
const MBR_TABLE_OFFSET: usize = 446;

/// Offset of the 0x55AA boot signature
const BOOT_SIGNATURE_OFFSET: usize = 510;

/// Never trust a header asking for more entries than this
const MAX_GPT_ENTRIES: u32 = 256;

/// Largest partition entry size accepted from a header
const MAX_GPT_ENTRY_SIZE: usize = 4096;

/// Error type for partition table operations
#[derive(Debug, Error)]
pub enum PartitionError {
    /// No registered strategy recognized the layout
    #[error("unsupported partition table")]
    Unsupported,
    /// Read error from storage device
    #[error("partition table read failed: {0}")]
    Io(#[from] BlockError),
}

/// What kind of table produced an entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionKind {
    /// The device holds a filesystem with no partition table
    Whole,
    /// MBR primary entry with its type code
    Mbr { type_code: u8 },
    /// GPT entry with its type GUID and name
    Gpt { type_guid: [u8; 16], name: String },
}

/// One partition, in blocks of the device it was read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub kind: PartitionKind,
    /// First LBA
    pub first_lba: u64,
    /// Length in blocks
    pub num_blocks: u64,
}

impl PartitionEntry {
    /// MBR-style type code (0xEE for GPT entries, 0 for whole-device)
    pub fn type_code(&self) -> u8 {
        match self.kind {
            PartitionKind::Whole => 0,
            PartitionKind::Mbr { type_code } => type_code,
            PartitionKind::Gpt { .. } => MBR_TYPE_GPT_PROTECTIVE,
        }
    }

    /// Block-scoped view of this partition
    pub fn open(&self, device: &ByteBlockDevice) -> Result<ByteBlockDevice, BlockError> {
        device.partition(self.first_lba, self.num_blocks)
    }
}

/// A partition table format
pub trait PartitionTableParser: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Parse the table
    ///
    /// Returns `Ok(None)` when the layout is not this parser's format, so
    /// the registry can try the next strategy.
    fn parse(
        &self,
        first_sector: &[u8],
        device: &ByteBlockDevice,
    ) -> Result<Option<Vec<PartitionEntry>>, PartitionError>;
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= SECTOR_SIZE
        && sector[BOOT_SIGNATURE_OFFSET] == 0x55
        && sector[BOOT_SIGNATURE_OFFSET + 1] == 0xAA
}

/// A volume boot record at LBA 0: the whole device is one partition
pub struct FsAsPartitionParser;

impl PartitionTableParser for FsAsPartitionParser {
    fn name(&self) -> &'static str {
        "whole-device"
    }

    fn parse(
        &self,
        first_sector: &[u8],
        device: &ByteBlockDevice,
    ) -> Result<Option<Vec<PartitionEntry>>, PartitionError> {
        if !has_boot_signature(first_sector) {
            return Ok(None);
        }
        // x86 jump over the BPB, then a sane bytes-per-sector field
        let jump = first_sector[0] == 0xEB || first_sector[0] == 0xE9;
        let bytes_per_sector = u16::from_le_bytes([first_sector[11], first_sector[12]]);
        if !jump || !(512..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two()
        {
            return Ok(None);
        }

        let num_blocks = device.size() / device.block_size() as u64;
        Ok(Some(vec![PartitionEntry {
            kind: PartitionKind::Whole,
            first_lba: 0,
            num_blocks,
        }]))
    }
}

/// MBR partition table entry
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
pub struct MbrPartitionEntry {
    /// 0x80 = active, 0x00 = inactive
    pub status: u8,
    pub chs_first: [u8; 3],
    pub partition_type: u8,
    pub chs_last: [u8; 3],
    pub first_lba: U32,
    pub num_sectors: U32,
}

fn mbr_slots(sector: &[u8]) -> heapless::Vec<MbrPartitionEntry, 4> {
    let mut slots = heapless::Vec::new();
    for i in 0..4 {
        let offset = MBR_TABLE_OFFSET + i * 16;
        if let Ok(entry) = MbrPartitionEntry::read_from_bytes(&sector[offset..offset + 16]) {
            let _ = slots.push(entry);
        }
    }
    slots
}

/// Classic MBR, primary partitions only
pub struct MbrParser;

impl PartitionTableParser for MbrParser {
    fn name(&self) -> &'static str {
        "MBR"
    }

    fn parse(
        &self,
        first_sector: &[u8],
        device: &ByteBlockDevice,
    ) -> Result<Option<Vec<PartitionEntry>>, PartitionError> {
        if !has_boot_signature(first_sector) {
            return Ok(None);
        }

        let slots = mbr_slots(first_sector);
        if slots.iter().any(|s| s.status != 0x00 && s.status != 0x80) {
            return Ok(None);
        }
        if slots
            .iter()
            .any(|s| s.partition_type == MBR_TYPE_GPT_PROTECTIVE)
        {
            // Belongs to the GPT parser; a damaged GPT is not an MBR
            return Ok(None);
        }

        let total = device.size() / device.block_size() as u64;
        let mut entries = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            let first = slot.first_lba.get() as u64;
            let count = slot.num_sectors.get() as u64;
            if slot.partition_type == 0 || count == 0 {
                continue;
            }
            if MBR_EXTENDED_TYPES.contains(&slot.partition_type) {
                log::debug!("MBR: skipping extended partition in slot {}", i);
                continue;
            }
            if first == 0 || first + count > total {
                log::warn!(
                    "MBR: partition {} (LBA {}+{}) lies outside the device ({} blocks)",
                    i,
                    first,
                    count,
                    total
                );
                continue;
            }

            log::debug!(
                "MBR: partition {}: type {:#04x} LBA {}+{}",
                i,
                slot.partition_type,
                first,
                count
            );
            entries.push(PartitionEntry {
                kind: PartitionKind::Mbr {
                    type_code: slot.partition_type,
                },
                first_lba: first,
                num_blocks: count,
            });
        }

        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(entries))
    }
}

/// GPT Header structure
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
pub struct GptHeader {
    /// Signature ("EFI PART")
    pub signature: U64,
    /// Revision (usually 0x00010000)
    pub revision: U32,
    /// Header size (usually 92 bytes)
    pub header_size: U32,
    /// CRC32 of header
    pub header_crc32: U32,
    pub reserved: U32,
    /// Current LBA (location of this header)
    pub current_lba: U64,
    /// Backup LBA (location of the backup header)
    pub backup_lba: U64,
    /// First usable LBA for partitions
    pub first_usable_lba: U64,
    /// Last usable LBA for partitions
    pub last_usable_lba: U64,
    /// Disk GUID
    pub disk_guid: [u8; 16],
    /// Starting LBA of partition entry array
    pub partition_entry_lba: U64,
    /// Number of partition entries
    pub num_partition_entries: U32,
    /// Size of each partition entry (usually 128 bytes)
    pub partition_entry_size: U32,
    /// CRC32 of partition entry array
    pub partition_entry_crc32: U32,
}

/// GPT Partition Entry
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
pub struct GptPartitionEntry {
    /// Partition type GUID
    pub type_guid: [u8; 16],
    /// Unique partition GUID
    pub partition_guid: [u8; 16],
    /// First LBA
    pub first_lba: U64,
    /// Last LBA (inclusive)
    pub last_lba: U64,
    /// Attribute flags
    pub attributes: U64,
    /// Partition name (UTF-16LE, 36 characters)
    pub name: [U16; 36],
}

impl GptPartitionEntry {
    /// Check if this is an empty entry
    pub fn is_empty(&self) -> bool {
        self.type_guid == [0u8; 16]
    }

    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .name
            .iter()
            .map(|c| c.get())
            .take_while(|&c| c != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }
}

/// GUID Partition Table
pub struct GptParser;

impl PartitionTableParser for GptParser {
    fn name(&self) -> &'static str {
        "GPT"
    }

    fn parse(
        &self,
        first_sector: &[u8],
        device: &ByteBlockDevice,
    ) -> Result<Option<Vec<PartitionEntry>>, PartitionError> {
        if !has_boot_signature(first_sector)
            || !mbr_slots(first_sector)
                .iter()
                .any(|s| s.partition_type == MBR_TYPE_GPT_PROTECTIVE)
        {
            return Ok(None);
        }

        let block_size = device.block_size() as u64;
        let mut buffer = vec![0u8; block_size as usize];
        device.read(block_size, &mut buffer)?;

        let header = match GptHeader::read_from_prefix(&buffer) {
            Ok((header, _)) if header.signature.get() == GPT_SIGNATURE => header,
            _ => {
                log::warn!("GPT: protective MBR present but header signature is invalid");
                return Ok(None);
            }
        };

        let entry_size = header.partition_entry_size.get() as usize;
        let count = header.num_partition_entries.get().min(MAX_GPT_ENTRIES) as usize;
        if entry_size < core::mem::size_of::<GptPartitionEntry>()
            || entry_size > MAX_GPT_ENTRY_SIZE
            || entry_size % 8 != 0
        {
            log::warn!("GPT: bogus partition entry size {}", entry_size);
            return Ok(None);
        }

        log::debug!(
            "GPT Header: revision={:#x}, entries={}, entry_size={}",
            header.revision.get(),
            count,
            entry_size
        );

        let total = device.size() / block_size;
        let table_len = (count * entry_size) as u64;
        let table_offset = header
            .partition_entry_lba
            .get()
            .checked_mul(block_size)
            .filter(|&start| {
                start
                    .checked_add(table_len)
                    .is_some_and(|end| end <= device.size())
            });
        let Some(table_offset) = table_offset else {
            log::warn!(
                "GPT: partition entry array at LBA {} lies outside the device",
                header.partition_entry_lba.get()
            );
            return Ok(None);
        };
        let mut table = vec![0u8; table_len as usize];
        device.read(table_offset, &mut table)?;

        let mut entries = Vec::new();
        for (i, raw) in table.chunks_exact(entry_size).enumerate() {
            let Ok((entry, _)) = GptPartitionEntry::read_from_prefix(raw) else {
                continue;
            };
            if entry.is_empty() {
                continue;
            }
            let first = entry.first_lba.get();
            let last = entry.last_lba.get();
            if last < first || last >= total {
                log::warn!(
                    "GPT: partition {} (LBA {}-{}) lies outside the device",
                    i,
                    first,
                    last
                );
                continue;
            }

            let name = entry.name();
            log::debug!("Partition {}: LBA {}-{} '{}'", i, first, last, name);
            entries.push(PartitionEntry {
                kind: PartitionKind::Gpt {
                    type_guid: entry.type_guid,
                    name,
                },
                first_lba: first,
                num_blocks: last - first + 1,
            });
        }

        Ok(Some(entries))
    }
}

/// Ordered list of partition table strategies
pub struct PartitionRegistry {
    parsers: Vec<Box<dyn PartitionTableParser>>,
}

impl PartitionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Whole-device filesystem, then GPT, then MBR
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FsAsPartitionParser));
        registry.register(Box::new(GptParser));
        registry.register(Box::new(MbrParser));
        registry
    }

    /// Append a strategy; it is tried after the ones already registered
    pub fn register(&mut self, parser: Box<dyn PartitionTableParser>) {
        self.parsers.push(parser);
    }

    /// Read the partition table of `device`
    pub fn read(&self, device: &ByteBlockDevice) -> Result<Vec<PartitionEntry>, PartitionError> {
        let len = (device.block_size() as usize).max(SECTOR_SIZE);
        let mut first_sector = vec![0u8; len];
        device.read(0, &mut first_sector)?;

        for parser in &self.parsers {
            if let Some(entries) = parser.parse(&first_sector, device)? {
                log::info!(
                    "Partitions: {} table with {} entries",
                    parser.name(),
                    entries.len()
                );
                return Ok(entries);
            }
        }

        log::warn!("Partitions: no parser recognized the first sector");
        Err(PartitionError::Unsupported)
    }
}

impl Default for PartitionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
