//! FAT32 boot sector (BPB + extended boot record)

use super::FatError;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Filesystem type string of a FAT32 volume
pub const FAT32_SIGNATURE: &[u8; 8] = b"FAT32   ";

/// Offset of the filesystem type string in the boot sector
pub const FS_TYPE_OFFSET: usize = 0x52;

/// Bytes of the boot sector covered by `RawBootSector`
pub const BOOT_SECTOR_LENGTH: usize = 90;

/// FAT32 BIOS Parameter Block and Extended Boot Record
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
pub struct RawBootSector {
    /// Jump instruction (3 bytes)
    pub jmp: [u8; 3],
    /// OEM name (8 bytes)
    pub oem_name: [u8; 8],
    /// Bytes per sector
    pub bytes_per_sector: U16,
    /// Sectors per cluster
    pub sectors_per_cluster: u8,
    /// Reserved sectors (before first FAT)
    pub reserved_sectors: U16,
    /// Number of FATs
    pub num_fats: u8,
    /// Root entry count (0 for FAT32)
    pub root_entry_count: U16,
    /// Total sectors (16-bit, 0 if over 65535)
    pub total_sectors_16: U16,
    /// Media type
    pub media_type: u8,
    /// Sectors per FAT (FAT12/16, 0 for FAT32)
    pub sectors_per_fat_16: U16,
    /// Sectors per track
    pub sectors_per_track: U16,
    /// Number of heads
    pub num_heads: U16,
    /// Hidden sectors
    pub hidden_sectors: U32,
    /// Total sectors (32-bit)
    pub total_sectors_32: U32,
    /// Sectors per FAT (32-bit)
    pub sectors_per_fat_32: U32,
    /// Extended flags
    pub ext_flags: U16,
    /// Filesystem version
    pub fs_version: U16,
    /// Root directory cluster
    pub root_cluster: U32,
    /// FSInfo sector
    pub fs_info: U16,
    /// Backup boot sector
    pub backup_boot_sector: U16,
    pub reserved: [u8; 12],
    /// Drive number
    pub drive_number: u8,
    pub reserved1: u8,
    /// Extended boot signature
    pub boot_sig: u8,
    /// Volume serial number
    pub volume_serial: U32,
    /// Volume label
    pub volume_label: [u8; 11],
    /// Filesystem type string
    pub fs_type: [u8; 8],
}

/// Parsed FAT32 geometry
#[derive(Clone, Debug)]
pub struct BootSector {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub total_sectors: u64,
    pub root_cluster: u32,
    pub fs_info_sector: u32,
    /// Every FAT copy is kept identical
    pub mirroring: bool,
    /// FAT used when mirroring is off
    pub active_fat: u32,
    pub volume_label: String,
}

impl BootSector {
    /// Whether `sector` carries the FAT32 type string
    pub fn is_fat32(sector: &[u8]) -> bool {
        sector.len() >= FS_TYPE_OFFSET + 8
            && &sector[FS_TYPE_OFFSET..FS_TYPE_OFFSET + 8] == FAT32_SIGNATURE
    }

    pub fn parse(sector: &[u8]) -> Result<Self, FatError> {
        if !Self::is_fat32(sector) {
            return Err(FatError::NotFat32);
        }
        let (raw, _) =
            RawBootSector::read_from_prefix(sector).map_err(|_| FatError::InvalidBootSector)?;

        let bytes_per_sector = raw.bytes_per_sector.get() as u32;
        if !(512..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
            log::debug!("FAT32: invalid bytes_per_sector {}", bytes_per_sector);
            return Err(FatError::InvalidBootSector);
        }

        let sectors_per_cluster = raw.sectors_per_cluster as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            log::debug!("FAT32: invalid sectors_per_cluster {}", sectors_per_cluster);
            return Err(FatError::InvalidBootSector);
        }

        let num_fats = raw.num_fats as u32;
        let reserved_sectors = raw.reserved_sectors.get() as u32;
        let sectors_per_fat = raw.sectors_per_fat_32.get();
        if num_fats == 0 || reserved_sectors == 0 || sectors_per_fat == 0 {
            log::debug!(
                "FAT32: invalid layout fats={} reserved={} spf={}",
                num_fats,
                reserved_sectors,
                sectors_per_fat
            );
            return Err(FatError::InvalidBootSector);
        }

        let total_sectors = match raw.total_sectors_16.get() {
            0 => raw.total_sectors_32.get() as u64,
            n => n as u64,
        };
        let data_start = reserved_sectors as u64 + num_fats as u64 * sectors_per_fat as u64;
        if total_sectors <= data_start {
            return Err(FatError::InvalidBootSector);
        }

        let root_cluster = raw.root_cluster.get();
        if root_cluster < 2 {
            return Err(FatError::InvalidBootSector);
        }

        let ext_flags = raw.ext_flags.get();
        let label = String::from_utf8_lossy(&raw.volume_label)
            .trim_end()
            .to_string();

        let boot = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            total_sectors,
            root_cluster,
            fs_info_sector: raw.fs_info.get() as u32,
            mirroring: ext_flags & 0x80 == 0,
            active_fat: (ext_flags & 0x0F) as u32,
            volume_label: if label == "NO NAME" { String::new() } else { label },
        };

        if boot.active_fat >= num_fats || boot.root_cluster > boot.max_cluster() {
            return Err(FatError::InvalidBootSector);
        }

        Ok(boot)
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Byte offset of FAT copy `n`
    pub fn fat_offset(&self, n: u32) -> u64 {
        (self.reserved_sectors as u64 + n as u64 * self.sectors_per_fat as u64)
            * self.bytes_per_sector as u64
    }

    /// Size of one FAT copy in bytes
    pub fn fat_size(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of the data region (cluster 2)
    pub fn data_offset(&self) -> u64 {
        self.fat_offset(self.num_fats)
    }

    /// Byte offset of cluster `cluster`
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.bytes_per_cluster() as u64
    }

    /// Number of data clusters, capped by what the FAT can describe
    pub fn total_clusters(&self) -> u32 {
        let data_sectors =
            self.total_sectors - self.data_offset() / self.bytes_per_sector as u64;
        let by_size = data_sectors / self.sectors_per_cluster as u64;
        let by_fat = self.fat_size() / 4 - 2;
        by_size.min(by_fat).min(0x0FFF_FFF5) as u32
    }

    /// Highest valid cluster number
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters() + 1
    }

    /// FAT copies that receive writes
    pub fn fats_to_write(&self) -> Vec<u32> {
        if self.mirroring {
            (0..self.num_fats).collect()
        } else {
            vec![self.active_fat]
        }
    }

    /// FAT copy that serves reads
    pub fn fat_to_read(&self) -> u32 {
        if self.mirroring {
            0
        } else {
            self.active_fat
        }
    }

    /// Volume size in bytes
    pub fn capacity(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }

    pub fn fs_info_offset(&self) -> Option<u64> {
        match self.fs_info_sector {
            0 | 0xFFFF => None,
            n if n >= self.reserved_sectors => None,
            n => Some(n as u64 * self.bytes_per_sector as u64),
        }
    }
}
