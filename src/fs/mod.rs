//! Filesystem support
//!
//! Partition table parsing and FAT32. Filesystems are mounted through a
//! `FileSystemRegistry` of creator strategies; the first creator that does
//! not report `Unsupported` for a partition wins.

pub mod fat;
pub mod partition;

use self::fat::node::UsbFile;
use self::fat::{Fat32Creator, FatError};
use self::partition::PartitionEntry;
use crate::drivers::block::{BlockError, ByteBlockDevice};
use std::sync::Arc;
use thiserror::Error;

/// Split a path into segments
///
/// - `/` and `\` both separate segments
/// - empty and `.` segments are dropped
/// - `..` is kept; resolving it is up to the caller
///
/// # Example
///
/// ```ignore
/// assert_eq!(split_path("/Music\\live/./a.mp3"), vec!["Music", "live", "a.mp3"]);
/// ```
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// A mounted filesystem
pub trait FileSystem: Send + Sync {
    fn root_directory(&self) -> UsbFile;

    /// Resolve a path from the root; `Ok(None)` when it does not exist
    fn search(&self, path: &str) -> Result<Option<UsbFile>, FatError>;

    fn create_file(&self, path: &str) -> Result<UsbFile, FatError>;

    fn create_directory(&self, path: &str) -> Result<UsbFile, FatError>;

    /// Rename the node at `path` within its directory
    fn rename(&self, path: &str, new_name: &str) -> Result<UsbFile, FatError>;

    fn delete(&self, path: &str) -> Result<(), FatError>;

    fn volume_label(&self) -> String;

    /// Volume size in bytes
    fn capacity(&self) -> u64;

    /// Unallocated bytes
    fn free_space(&self) -> u64;

    fn occupied_space(&self) -> u64 {
        self.capacity().saturating_sub(self.free_space())
    }

    /// Allocation unit in bytes
    fn chunk_size(&self) -> u32;

    fn type_name(&self) -> &'static str;

    /// Forget every interned node; used when the device goes away
    fn invalidate(&self);
}

/// Options passed to every creator
#[derive(Clone, Copy, Debug)]
pub struct MountOptions {
    /// FAT sectors kept in the sector cache
    pub fat_cache_blocks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fat_cache_blocks: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    /// Not this creator's filesystem
    #[error("unsupported filesystem")]
    Unsupported,
    #[error(transparent)]
    Fat(#[from] FatError),
    #[error(transparent)]
    Io(#[from] BlockError),
}

/// A filesystem mounting strategy
pub trait FileSystemCreator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mount the partition, or `Err(MountError::Unsupported)` if it is not ours
    fn create(
        &self,
        entry: &PartitionEntry,
        device: ByteBlockDevice,
        options: &MountOptions,
    ) -> Result<Arc<dyn FileSystem>, MountError>;
}

/// Ordered list of filesystem creators
pub struct FileSystemRegistry {
    creators: Vec<Box<dyn FileSystemCreator>>,
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self {
            creators: Vec::new(),
        }
    }

    /// FAT32 only
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Fat32Creator));
        registry
    }

    pub fn register(&mut self, creator: Box<dyn FileSystemCreator>) {
        self.creators.push(creator);
    }

    /// Mount with the first creator that recognizes the partition
    pub fn mount(
        &self,
        entry: &PartitionEntry,
        device: &ByteBlockDevice,
        options: &MountOptions,
    ) -> Result<Arc<dyn FileSystem>, MountError> {
        for creator in &self.creators {
            match creator.create(entry, device.clone(), options) {
                Err(MountError::Unsupported) => continue,
                Ok(fs) => {
                    log::info!(
                        "FS: mounted {} at LBA {} ({} bytes)",
                        creator.name(),
                        entry.first_lba,
                        fs.capacity()
                    );
                    return Ok(fs);
                }
                Err(e) => return Err(e),
            }
        }
        Err(MountError::Unsupported)
    }
}

impl Default for FileSystemRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
