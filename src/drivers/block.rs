//! Block Device Abstraction
//!
//! Storage below the filesystem is addressed in whole blocks. This module
//! defines that interface and the byte-offset adapter that filesystems and
//! partition parsers read through.
//!
//! # Architecture
//!
//! - `BlockDevice` is implemented by `UsbMassStorage` (and by an in-memory
//!   disk in tests); every call moves whole blocks
//! - `ByteBlockDevice` wraps a shared `BlockDevice`, adds a logical block
//!   offset for partition placement, and merges partial leading/trailing
//!   blocks with read-modify-write

use crate::drivers::usb::mass_storage::MassStorageError;
use spin::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Standard sector size (512 bytes)
pub const SECTOR_SIZE: usize = 512;

/// Information about a block device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Total number of blocks on the device
    pub num_blocks: u64,
    /// Size of each block in bytes
    pub block_size: u32,
    /// True if the device is removable (USB sticks, card readers)
    pub removable: bool,
    /// True if the device is read-only
    pub read_only: bool,
}

/// Unified error type for block operations
#[derive(Debug, Error)]
pub enum BlockError {
    /// The transport failed to move the blocks
    #[error("transport error: {0}")]
    Transport(#[from] MassStorageError),
    /// Invalid parameter (buffer not a multiple of the block size, etc.)
    #[error("invalid parameter")]
    InvalidParameter,
    /// LBA out of range
    #[error("block address out of range")]
    OutOfRange,
    /// Write attempted on a read-only device
    #[error("device is read-only")]
    ReadOnly,
}

/// Trait for block-level storage devices
///
/// Buffers are always a whole number of blocks; the block count is implied
/// by the buffer length. Implementations serialize access internally, so a
/// device can be shared behind an `Arc`.
pub trait BlockDevice: Send + Sync {
    /// Get device information
    fn info(&self) -> BlockDeviceInfo;

    /// Read `buffer.len() / block_size` blocks starting at `lba`
    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError>;

    /// Write `buffer.len() / block_size` blocks starting at `lba`
    fn write_blocks(&self, lba: u64, buffer: &[u8]) -> Result<(), BlockError>;

    /// Read a single block (convenience method)
    fn read_block(&self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        let block_size = self.info().block_size as usize;
        if buffer.len() < block_size {
            return Err(BlockError::InvalidParameter);
        }
        self.read_blocks(lba, &mut buffer[..block_size])
    }
}

/// Byte-addressable view of a block device region
///
/// Cloning is cheap and clones share the read-modify-write lock.
#[derive(Clone)]
pub struct ByteBlockDevice {
    device: Arc<dyn BlockDevice>,
    /// First block of this view on the underlying device
    logical_offset: u64,
    /// Number of blocks visible through this view
    num_blocks: u64,
    block_size: u32,
    rmw: Arc<Mutex<()>>,
}

impl ByteBlockDevice {
    /// View the whole device
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let info = device.info();
        Self {
            device,
            logical_offset: 0,
            num_blocks: info.num_blocks,
            block_size: info.block_size,
            rmw: Arc::new(Mutex::new(())),
        }
    }

    /// View `num_blocks` blocks starting at `start_lba` of this view
    pub fn partition(&self, start_lba: u64, num_blocks: u64) -> Result<Self, BlockError> {
        match start_lba.checked_add(num_blocks) {
            Some(end) if end <= self.num_blocks => Ok(Self {
                device: self.device.clone(),
                logical_offset: self.logical_offset + start_lba,
                num_blocks,
                block_size: self.block_size,
                rmw: self.rmw.clone(),
            }),
            _ => Err(BlockError::OutOfRange),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Size of this view in bytes
    pub fn size(&self) -> u64 {
        self.num_blocks * self.block_size as u64
    }

    /// Offset of this view on the underlying device, in blocks
    pub fn logical_offset(&self) -> u64 {
        self.logical_offset
    }

    pub fn info(&self) -> BlockDeviceInfo {
        self.device.info()
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), BlockError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(BlockError::OutOfRange),
        }
    }

    /// Read `buffer.len()` bytes at byte `offset`
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.check(offset, buffer.len())?;
        if buffer.is_empty() {
            return Ok(());
        }

        let bs = self.block_size as usize;
        let mut lba = self.logical_offset + offset / bs as u64;
        let head = (offset % bs as u64) as usize;
        let mut pos = 0;

        if head != 0 || buffer.len() < bs {
            let mut block = vec![0u8; bs];
            self.device.read_blocks(lba, &mut block)?;
            let n = (bs - head).min(buffer.len());
            buffer[..n].copy_from_slice(&block[head..head + n]);
            pos = n;
            lba += 1;
        }

        let whole = (buffer.len() - pos) / bs * bs;
        if whole > 0 {
            self.device.read_blocks(lba, &mut buffer[pos..pos + whole])?;
            pos += whole;
            lba += (whole / bs) as u64;
        }

        if pos < buffer.len() {
            let mut block = vec![0u8; bs];
            self.device.read_blocks(lba, &mut block)?;
            let n = buffer.len() - pos;
            buffer[pos..].copy_from_slice(&block[..n]);
        }

        Ok(())
    }

    /// Write `buffer` at byte `offset`
    ///
    /// Partial blocks at either end are read, patched and written back.
    pub fn write(&self, offset: u64, buffer: &[u8]) -> Result<(), BlockError> {
        self.check(offset, buffer.len())?;
        if buffer.is_empty() {
            return Ok(());
        }

        let bs = self.block_size as usize;
        let mut lba = self.logical_offset + offset / bs as u64;
        let head = (offset % bs as u64) as usize;
        let mut pos = 0;

        if head != 0 || buffer.len() < bs {
            let n = (bs - head).min(buffer.len());
            self.patch_block(lba, head, &buffer[..n])?;
            pos = n;
            lba += 1;
        }

        let whole = (buffer.len() - pos) / bs * bs;
        if whole > 0 {
            self.device.write_blocks(lba, &buffer[pos..pos + whole])?;
            pos += whole;
            lba += (whole / bs) as u64;
        }

        if pos < buffer.len() {
            self.patch_block(lba, 0, &buffer[pos..])?;
        }

        Ok(())
    }

    fn patch_block(&self, lba: u64, at: usize, bytes: &[u8]) -> Result<(), BlockError> {
        let _guard = self.rmw.lock();
        let mut block = vec![0u8; self.block_size as usize];
        self.device.read_blocks(lba, &mut block)?;
        block[at..at + bytes.len()].copy_from_slice(bytes);
        self.device.write_blocks(lba, &block)
    }
}
