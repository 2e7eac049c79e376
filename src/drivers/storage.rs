//! Attached mass-storage devices
//!
//! Ties the stack together for one USB device: transport init, partition
//! table, and a mounted filesystem per recognized partition. Strategy
//! registries are passed in explicitly rather than living in globals.

use super::block::{BlockDevice, BlockDeviceInfo, BlockError, ByteBlockDevice};
use super::usb::{MassStorageError, TransportConfig, UsbCommunication, UsbMassStorage};
use crate::datasource::{ChunkedDataSource, DataSourceConfig, DataSourceError};
use crate::fs::fat::node::UsbFile;
use crate::fs::partition::{PartitionEntry, PartitionError, PartitionRegistry};
use crate::fs::{FileSystem, FileSystemRegistry, MountError, MountOptions};
use std::sync::Arc;
use thiserror::Error;

/// Everything tunable about an attached device
#[derive(Clone, Copy, Debug)]
pub struct StorageConfig {
    pub transport: TransportConfig,
    pub data_source: DataSourceConfig,
    /// FAT sectors cached per mounted volume
    pub fat_cache_blocks: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            data_source: DataSourceConfig::default(),
            fat_cache_blocks: MountOptions::default().fat_cache_blocks,
        }
    }
}

/// Strategy registries used while attaching
#[derive(Default)]
pub struct Registries {
    pub partitions: PartitionRegistry,
    pub file_systems: FileSystemRegistry,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transport: {0}")]
    Transport(#[from] MassStorageError),
    #[error("partition table: {0}")]
    Partition(#[from] PartitionError),
    #[error("block device: {0}")]
    Block(#[from] BlockError),
    #[error("mount: {0}")]
    Mount(#[from] MountError),
}

/// A mounted partition
#[derive(Clone)]
pub struct Partition {
    pub entry: PartitionEntry,
    pub file_system: Arc<dyn FileSystem>,
}

/// One attached device and its mounted filesystems
pub struct MassStorageDevice {
    device: Arc<dyn BlockDevice>,
    partitions: Vec<Partition>,
    config: StorageConfig,
}

impl MassStorageDevice {
    /// Initialize the transport on `comm` and mount what is on the medium
    pub fn attach(
        comm: Box<dyn UsbCommunication>,
        registries: &Registries,
        config: StorageConfig,
    ) -> Result<Self, DeviceError> {
        let usb = UsbMassStorage::new(comm, config.transport)?;
        log::info!(
            "Storage: attached {} {} ({} blocks x {} bytes)",
            usb.vendor(),
            usb.product(),
            usb.info().num_blocks,
            usb.info().block_size
        );
        Self::from_block_device(Arc::new(usb), registries, config)
    }

    /// Mount the partitions of an already initialized block device
    pub fn from_block_device(
        device: Arc<dyn BlockDevice>,
        registries: &Registries,
        config: StorageConfig,
    ) -> Result<Self, DeviceError> {
        let view = ByteBlockDevice::new(device.clone());
        let options = MountOptions {
            fat_cache_blocks: config.fat_cache_blocks,
        };

        let mut partitions = Vec::new();
        for entry in registries.partitions.read(&view)? {
            let part = entry.open(&view)?;
            match registries.file_systems.mount(&entry, &part, &options) {
                Ok(file_system) => partitions.push(Partition { entry, file_system }),
                Err(MountError::Unsupported) => log::info!(
                    "Storage: skipping partition at LBA {} (type {:#04x}), no filesystem recognized",
                    entry.first_lba,
                    entry.type_code()
                ),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            device,
            partitions,
            config,
        })
    }

    pub fn info(&self) -> BlockDeviceInfo {
        self.device.info()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Cached reader for `file` using this device's data source settings
    pub fn open(&self, file: UsbFile) -> Result<ChunkedDataSource, DataSourceError> {
        ChunkedDataSource::new(file, self.config.data_source)
    }

    /// Drop every interned node of every mounted filesystem
    pub fn detach(self) {
        for partition in &self.partitions {
            partition.file_system.invalidate();
        }
        log::info!("Storage: detached ({} partitions)", self.partitions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::UsbError;
    use crate::fs::fat::FatError;
    use crate::testing::{format_fat32, mbr_wrap, FakeUsbDrive, MemoryBlockDevice};

    fn quick_config() -> StorageConfig {
        StorageConfig {
            transport: TransportConfig {
                retry_delay_ms: 0,
                ..TransportConfig::default()
            },
            data_source: DataSourceConfig {
                chunk_size: 4096,
                max_chunks: 4,
            },
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_attach_mounts_and_streams() {
        let image = mbr_wrap(&format_fat32(4096, "STICK"), 2048, 0x0C);
        let drive = FakeUsbDrive::with_image(image, 512);
        let device =
            MassStorageDevice::attach(Box::new(drive.clone()), &Registries::default(), quick_config())
                .unwrap();

        assert_eq!(device.partitions().len(), 1);
        let fs = device.partitions()[0].file_system.clone();
        assert_eq!(fs.volume_label(), "STICK");

        fs.create_directory("/music").unwrap();
        let song = fs.create_file("/music/song.mp3").unwrap();
        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        song.write(0, &data).unwrap();
        song.flush().unwrap();

        let src = device.open(fs.search("/MUSIC/Song.mp3").unwrap().unwrap()).unwrap();
        let mut buf = vec![0u8; 1000];
        assert_eq!(src.read_at(9500, &mut buf, 0, 1000).unwrap(), 500);
        assert_eq!(&buf[..500], &data[9500..]);
        src.close().unwrap();

        device.detach();
        drive.disconnect();
        assert!(matches!(
            song.read(0, &mut buf),
            Err(FatError::Io(BlockError::Transport(MassStorageError::Usb(
                UsbError::Disconnected
            ))))
        ));
    }

    #[test]
    fn test_unrecognized_partitions_are_skipped() {
        let mut image = mbr_wrap(&format_fat32(4096, "STICK"), 2048, 0x0C);
        image.resize(image.len() + 1024 * 512, 0);
        // Second slot: a Linux partition with nothing on it
        let slot = 446 + 16;
        image[slot + 4] = 0x83;
        image[slot + 8..slot + 12].copy_from_slice(&(2048u32 + 4096).to_le_bytes());
        image[slot + 12..slot + 16].copy_from_slice(&1024u32.to_le_bytes());

        let mem = Arc::new(MemoryBlockDevice::from_image(image, 512));
        let device =
            MassStorageDevice::from_block_device(mem, &Registries::default(), quick_config())
                .unwrap();
        assert_eq!(device.partitions().len(), 1);
        assert_eq!(device.partitions()[0].entry.first_lba, 2048);
    }

    #[test]
    fn test_blank_device_is_unsupported() {
        let mem = Arc::new(MemoryBlockDevice::new(128, 512));
        let result =
            MassStorageDevice::from_block_device(mem, &Registries::default(), quick_config());
        assert!(matches!(
            result,
            Err(DeviceError::Partition(PartitionError::Unsupported))
        ));
    }
}
