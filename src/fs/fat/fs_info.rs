//! FAT32 FSInfo sector
//!
//! Caches the free-cluster count and a next-free hint so mount does not
//! have to scan the whole FAT. Both values are advisory; a sector with bad
//! signatures is ignored and never written back.

use super::FatError;
use crate::drivers::block::ByteBlockDevice;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const LEAD_SIGNATURE: u32 = 0x41615252;
const STRUCT_SIGNATURE: u32 = 0x61417272;
const TRAIL_SIGNATURE: u32 = 0xAA550000;

/// Free count / next free value meaning "not known"
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

/// Offset of `free_count` within the sector
const FREE_COUNT_OFFSET: u64 = 488;

/// On-disk FSInfo sector
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
pub struct RawFsInfo {
    pub lead_signature: U32,
    pub reserved1: [u8; 480],
    pub struct_signature: U32,
    pub free_count: U32,
    pub next_free: U32,
    pub reserved2: [u8; 12],
    pub trail_signature: U32,
}

#[derive(Clone, Copy, Debug)]
pub struct FsInfo {
    /// Byte offset of the sector, if the volume has one
    offset: Option<u64>,
    pub free_count: u32,
    pub next_free: u32,
    valid: bool,
}

impl FsInfo {
    /// Read the FSInfo sector at `offset`
    pub fn read(device: &ByteBlockDevice, offset: Option<u64>) -> Result<Self, FatError> {
        let Some(at) = offset else {
            return Ok(Self::missing());
        };

        let mut buf = [0u8; 512];
        device.read(at, &mut buf)?;
        let raw = RawFsInfo::read_from_bytes(&buf).map_err(|_| FatError::InvalidBootSector)?;

        let valid = raw.lead_signature.get() == LEAD_SIGNATURE
            && raw.struct_signature.get() == STRUCT_SIGNATURE
            && raw.trail_signature.get() == TRAIL_SIGNATURE;
        if !valid {
            log::warn!("FAT32: FSInfo signatures invalid, ignoring sector");
            return Ok(Self {
                offset,
                ..Self::missing()
            });
        }

        Ok(Self {
            offset,
            free_count: raw.free_count.get(),
            next_free: raw.next_free.get(),
            valid: true,
        })
    }

    fn missing() -> Self {
        Self {
            offset: None,
            free_count: UNKNOWN,
            next_free: UNKNOWN,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Persist the free count and next-free hint
    pub fn write(&self, device: &ByteBlockDevice) -> Result<(), FatError> {
        let (Some(at), true) = (self.offset, self.valid) else {
            return Ok(());
        };
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.free_count.to_le_bytes());
        buf[4..].copy_from_slice(&self.next_free.to_le_bytes());
        device.write(at + FREE_COUNT_OFFSET, &buf)?;
        Ok(())
    }
}
