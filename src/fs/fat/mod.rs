//! FAT32 filesystem
//!
//! Mounts a partition's byte view as a FAT32 volume. Reading and writing
//! goes through directory and file nodes; every node of one volume shares
//! an `FsCore` holding the device, the boot sector, the FAT and the table
//! that interns nodes by absolute path.
//!
//! # Locking
//!
//! Locks are taken in this order and never the other way round:
//!
//! 1. a file's state
//! 2. a directory's contents
//! 3. a single directory entry
//! 4. the FAT
//!
//! The node table lock is only held for a map operation, never across I/O.

pub mod boot_sector;
pub mod chain;
pub mod directory;
pub mod entry;
pub mod file;
pub mod fs_info;
pub mod node;
pub mod short_name;
pub mod table;

use self::boot_sector::BootSector;
use self::directory::FatDirectory;
use self::node::UsbFile;
use self::table::Fat;
use super::partition::PartitionEntry;
use super::{split_path, FileSystem, FileSystemCreator, MountError, MountOptions};
use crate::drivers::block::{BlockError, ByteBlockDevice, SECTOR_SIZE};
use spin::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// FAT filesystem error
#[derive(Debug, Error)]
pub enum FatError {
    /// Boot sector does not carry the FAT32 type string
    #[error("not a FAT32 volume")]
    NotFat32,
    /// FAT32 type string present but the geometry is unusable
    #[error("invalid FAT32 boot sector")]
    InvalidBootSector,
    /// Device I/O failed
    #[error("FAT32 I/O error: {0}")]
    Io(#[from] BlockError),
    /// Cluster number outside the data area
    #[error("invalid cluster {0}")]
    InvalidCluster(u32),
    /// Chain starting at this cluster is broken
    #[error("corrupt cluster chain starting at {0}")]
    CorruptChain(u32),
    /// No free clusters left
    #[error("no space left on volume")]
    NoSpace,
    /// Access past the end of a cluster chain
    #[error("access beyond end of cluster chain")]
    OutOfBounds,
    /// Every `~N` tail is taken
    #[error("no unique short name available")]
    NoUniqueShortName,
    /// Item already exists
    #[error("item already exists: {0}")]
    AlreadyExists(String),
    /// File not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Not a directory
    #[error("not a directory")]
    NotADirectory,
    /// Not a file
    #[error("is a directory")]
    IsADirectory,
    /// Name cannot be stored in a directory
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    /// The root cannot be renamed or deleted
    #[error("operation not permitted on the root directory")]
    RootDirectory,
    /// Node was deleted
    #[error("file or directory was deleted")]
    Deleted,
    /// FAT32 sizes are 32-bit
    #[error("file too large")]
    FileTooLarge,
}

impl FatError {
    /// True when the volume is simply not FAT32 and another strategy may apply
    pub fn is_unsupported(&self) -> bool {
        matches!(self, FatError::NotFat32 | FatError::InvalidBootSector)
    }
}

/// State shared by every node of one mounted volume
pub struct FsCore {
    pub(crate) device: ByteBlockDevice,
    pub(crate) boot: BootSector,
    pub(crate) fat: Mutex<Fat>,
    /// Lower-cased absolute path -> live node
    nodes: Mutex<HashMap<String, UsbFile>>,
}

impl FsCore {
    /// The node interned under `key`, creating it with `make` on first use
    pub(crate) fn intern(&self, key: String, make: impl FnOnce() -> UsbFile) -> UsbFile {
        self.nodes.lock().entry(key).or_insert_with(make).clone()
    }

    /// Drop `key` and every node below it
    pub(crate) fn forget(&self, key: &str) {
        let prefix = format!("{}/", key);
        self.nodes
            .lock()
            .retain(|k, _| k != key && !k.starts_with(&prefix));
    }

    /// Move `old` and every node below it to `new`
    pub(crate) fn rekey(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let prefix = format!("{}/", old);
        let mut nodes = self.nodes.lock();
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| *k == old || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                nodes.insert(format!("{}{}", new, &key[old.len()..]), node);
            }
        }
    }

    /// Drop every interned node
    pub(crate) fn invalidate(&self) {
        self.nodes.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn interned(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A mounted FAT32 volume
pub struct Fat32FileSystem {
    core: Arc<FsCore>,
    root: Arc<FatDirectory>,
}

impl Fat32FileSystem {
    /// Mount the volume on `device`, caching `cache_sectors` FAT sectors
    pub fn mount(device: ByteBlockDevice, cache_sectors: usize) -> Result<Self, FatError> {
        let mut sector = vec![0u8; (device.block_size() as usize).max(SECTOR_SIZE)];
        device.read(0, &mut sector)?;
        let boot = BootSector::parse(&sector)?;

        if boot.capacity() > device.size() {
            log::warn!(
                "FAT32: volume claims {} bytes but partition holds {}",
                boot.capacity(),
                device.size()
            );
            return Err(FatError::InvalidBootSector);
        }

        let fat = Fat::load(&device, &boot, cache_sectors)?;
        let core = Arc::new(FsCore {
            device,
            boot,
            fat: Mutex::new(fat),
            nodes: Mutex::new(HashMap::new()),
        });
        let root = FatDirectory::root(core.clone());
        root.load()?;

        log::info!(
            "FAT32: mounted {:?}, {} bytes/cluster, {} of {} clusters free",
            root.volume_label().unwrap_or_else(|| core.boot.volume_label.clone()),
            core.boot.bytes_per_cluster(),
            core.fat.lock().free_clusters(),
            core.boot.total_clusters()
        );

        Ok(Self { core, root })
    }

    pub(crate) fn core(&self) -> &FsCore {
        &self.core
    }

    /// Directory that will hold the last segment of `path`, and that segment
    fn parent_of<'p>(&self, path: &'p str) -> Result<(Arc<FatDirectory>, &'p str), FatError> {
        let segments = split_path(path);
        let Some((name, rest)) = segments.split_last() else {
            return Err(FatError::RootDirectory);
        };
        match self.root.walk(rest)? {
            Some(UsbFile::Directory(dir)) => Ok((dir, *name)),
            Some(UsbFile::File(_)) => Err(FatError::NotADirectory),
            None => Err(FatError::NotFound(path.to_string())),
        }
    }
}

impl Drop for Fat32FileSystem {
    fn drop(&mut self) {
        // Nodes point back at the core
        self.core.invalidate();
    }
}

impl FileSystem for Fat32FileSystem {
    fn root_directory(&self) -> UsbFile {
        UsbFile::Directory(self.root.clone())
    }

    fn search(&self, path: &str) -> Result<Option<UsbFile>, FatError> {
        self.root.search(path)
    }

    fn create_file(&self, path: &str) -> Result<UsbFile, FatError> {
        let (parent, name) = self.parent_of(path)?;
        parent.create_file(name)
    }

    fn create_directory(&self, path: &str) -> Result<UsbFile, FatError> {
        let (parent, name) = self.parent_of(path)?;
        parent.create_directory(name)
    }

    fn rename(&self, path: &str, new_name: &str) -> Result<UsbFile, FatError> {
        let (parent, name) = self.parent_of(path)?;
        parent.rename_child(name, new_name)
    }

    fn delete(&self, path: &str) -> Result<(), FatError> {
        let (parent, name) = self.parent_of(path)?;
        parent.remove(name)
    }

    fn volume_label(&self) -> String {
        self.root
            .volume_label()
            .unwrap_or_else(|| self.core.boot.volume_label.clone())
    }

    fn capacity(&self) -> u64 {
        self.core.boot.capacity()
    }

    fn free_space(&self) -> u64 {
        self.core.fat.lock().free_clusters() as u64 * self.core.boot.bytes_per_cluster() as u64
    }

    fn chunk_size(&self) -> u32 {
        self.core.boot.bytes_per_cluster()
    }

    fn type_name(&self) -> &'static str {
        "FAT32"
    }

    fn invalidate(&self) {
        self.core.invalidate();
    }
}

/// Mounts FAT32 volumes for the filesystem registry
pub struct Fat32Creator;

impl FileSystemCreator for Fat32Creator {
    fn name(&self) -> &'static str {
        "FAT32"
    }

    fn create(
        &self,
        entry: &PartitionEntry,
        device: ByteBlockDevice,
        options: &MountOptions,
    ) -> Result<Arc<dyn FileSystem>, MountError> {
        match Fat32FileSystem::mount(device, options.fat_cache_blocks) {
            Ok(fs) => Ok(Arc::new(fs)),
            Err(e) if e.is_unsupported() => {
                log::debug!(
                    "FAT32: partition at LBA {} (type {:#04x}) not mountable: {}",
                    entry.first_lba,
                    entry.type_code(),
                    e
                );
                Err(MountError::Unsupported)
            }
            Err(e) => Err(e.into()),
        }
    }
}
