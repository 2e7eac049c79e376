//! crabmsc - USB mass storage from user space
//!
//! Reads and writes FAT32 volumes on USB flash drives without kernel
//! support for the device. The host platform enumerates the drive and
//! hands over raw bulk/control endpoint access; everything above that
//! lives here:
//!
//! - `drivers::usb`: Bulk-Only Transport with the SCSI transparent command set
//! - `drivers::block`: block devices and a byte-addressable view over them
//! - `fs::partition`: whole-device, GPT and MBR partition tables
//! - `fs::fat`: FAT32 with long file names, exposed as a tree of `UsbFile` nodes
//! - `datasource`: chunk-cached random access reads for media decoders
//! - `drivers::storage`: attach/detach of a whole device

pub mod datasource;
pub mod drivers;
pub mod fs;
pub mod logger;
pub mod time;

#[cfg(test)]
mod testing;

pub use datasource::{ChunkedDataSource, DataSourceConfig, DataSourceError};
pub use drivers::storage::{DeviceError, MassStorageDevice, Partition, Registries, StorageConfig};
pub use drivers::usb::{UsbCommunication, UsbError};
pub use fs::fat::node::UsbFile;
pub use fs::fat::FatError;
pub use fs::FileSystem;
