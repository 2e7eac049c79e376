//! FAT32 directories
//!
//! A directory's entry list is read from its cluster chain on first use and
//! kept in memory. Every mutation rewrites the whole chain: the volume label
//! (root only), then each entry group in order, zero-padded to the end of the
//! chain. The chain only ever grows.

use super::chain::ClusterChain;
use super::entry::{
    self, DirEntryGroup, RawDirEntry, SharedEntry, ATTR_ARCHIVE, ATTR_DIRECTORY, DIR_ENTRY_SIZE,
    MAX_LONG_NAME,
};
use super::file::FatFile;
use super::node::UsbFile;
use super::short_name::{self, ShortName};
use super::{FatError, FsCore};
use crate::fs::split_path;
use crate::time;
use spin::{Mutex, Once};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zerocopy::IntoBytes;

/// Characters VFAT does not allow in a long name
const INVALID_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Reject names a directory entry cannot hold
pub fn validate_name(name: &str) -> Result<(), FatError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.encode_utf16().count() > MAX_LONG_NAME
        || name
            .chars()
            .any(|c| c.is_control() || INVALID_CHARS.contains(&c));
    if invalid {
        return Err(FatError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// In-memory copy of a directory's entries
struct DirContents {
    chain: ClusterChain,
    volume_label: Option<RawDirEntry>,
    /// On-disk order, dot entries included
    entries: Vec<SharedEntry>,
    /// Lower-cased name -> entry, dot entries excluded
    by_name: HashMap<String, SharedEntry>,
    short_names: HashSet<ShortName>,
}

impl DirContents {
    fn insert(&mut self, group: DirEntryGroup) -> SharedEntry {
        let short = group.short_name();
        let key = (!group.is_dot_entry()).then(|| group.name().to_lowercase());
        let entry = Arc::new(Mutex::new(group));

        self.short_names.insert(short);
        if let Some(key) = key {
            self.by_name.entry(key).or_insert_with(|| entry.clone());
        }
        self.entries.push(entry.clone());
        entry
    }

    fn remove(&mut self, entry: &SharedEntry) {
        self.entries.retain(|e| !Arc::ptr_eq(e, entry));
        self.by_name.retain(|_, e| !Arc::ptr_eq(e, entry));
        self.short_names.remove(&entry.lock().short_name());
    }

    fn lookup(&self, name: &str) -> Option<SharedEntry> {
        self.by_name.get(&name.to_lowercase()).cloned()
    }
}

/// A directory node
pub struct FatDirectory {
    core: Arc<FsCore>,
    /// None for the root
    parent: Option<Arc<FatDirectory>>,
    /// Entry in the parent; None for the root
    entry: Option<SharedEntry>,
    contents: Once<Mutex<DirContents>>,
    dirty: AtomicBool,
    deleted: AtomicBool,
}

impl FatDirectory {
    pub(crate) fn root(core: Arc<FsCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            parent: None,
            entry: None,
            contents: Once::new(),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        })
    }

    pub(crate) fn new(core: Arc<FsCore>, parent: Arc<FatDirectory>, entry: SharedEntry) -> Arc<Self> {
        Arc::new(Self {
            core,
            parent: Some(parent),
            entry: Some(entry),
            contents: Once::new(),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent(&self) -> Option<Arc<FatDirectory>> {
        self.parent.clone()
    }

    pub(crate) fn entry(&self) -> Option<&SharedEntry> {
        self.entry.as_ref()
    }

    /// Name in the parent; empty for the root
    pub fn name(&self) -> String {
        self.entry
            .as_ref()
            .map(|e| e.lock().name())
            .unwrap_or_default()
    }

    /// Absolute path, `/` for the root
    pub fn path(&self) -> String {
        match &self.parent {
            Some(parent) => parent.child_path(&self.name()),
            None => "/".to_string(),
        }
    }

    pub(crate) fn child_path(&self, name: &str) -> String {
        let mut path = self.path();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(name);
        path
    }

    /// First cluster of the directory's chain
    pub fn start_cluster(&self) -> Result<u32, FatError> {
        Ok(self.contents()?.lock().chain.start_cluster())
    }

    /// Label from the root's volume label entry, once loaded
    pub fn volume_label(&self) -> Option<String> {
        let contents = self.contents.get()?.lock();
        contents.volume_label.as_ref().map(|l| l.label())
    }

    /// Read the entry list if that has not happened yet
    pub fn load(&self) -> Result<(), FatError> {
        self.contents().map(|_| ())
    }

    fn contents(&self) -> Result<&Mutex<DirContents>, FatError> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(FatError::Deleted);
        }
        self.contents
            .try_call_once(|| self.read_contents().map(Mutex::new))
    }

    fn read_contents(&self) -> Result<DirContents, FatError> {
        let start = match &self.entry {
            Some(entry) => entry.lock().start_cluster(),
            None => self.core.boot.root_cluster,
        };
        let chain = ClusterChain::open(&self.core, start)?;

        let mut bytes = vec![0u8; chain.capacity(&self.core) as usize];
        chain.read(&self.core, 0, &mut bytes)?;
        let parsed = entry::parse_entries(&bytes);

        let volume_label = match parsed.volume_label {
            Some(label) if self.is_root() => Some(label),
            Some(_) => {
                log::debug!("FAT32: ignoring volume label entry outside the root");
                None
            }
            None => None,
        };

        let mut contents = DirContents {
            chain,
            volume_label,
            entries: Vec::with_capacity(parsed.groups.len()),
            by_name: HashMap::new(),
            short_names: HashSet::new(),
        };
        for group in parsed.groups {
            contents.insert(group);
        }

        log::trace!(
            "FAT32: read directory {} ({} entries)",
            self.path(),
            contents.entries.len()
        );
        Ok(contents)
    }

    /// Write the whole entry list back to the chain
    ///
    /// The flag is cleared before the entries are read so that a
    /// `mark_dirty` racing with the write leaves the directory dirty.
    fn persist(&self, contents: &mut DirContents) -> Result<(), FatError> {
        self.dirty.store(false, Ordering::Release);
        let result = self.write_entries(contents);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn write_entries(&self, contents: &mut DirContents) -> Result<(), FatError> {
        let mut bytes = Vec::with_capacity(contents.entries.len() * 2 * DIR_ENTRY_SIZE);
        if let Some(label) = &contents.volume_label {
            bytes.extend_from_slice(label.as_bytes());
        }
        for entry in &contents.entries {
            entry.lock().serialize(&mut bytes);
        }

        let bpc = self.core.boot.bytes_per_cluster() as usize;
        let needed = bytes.len().div_ceil(bpc).max(1);
        if needed > contents.chain.clusters().len() {
            contents.chain.set_cluster_count(&self.core, needed)?;
        }
        bytes.resize(contents.chain.capacity(&self.core) as usize, 0);
        contents.chain.write(&self.core, 0, &bytes)?;

        log::trace!("FAT32: persisted directory {} ({} bytes)", self.path(), bytes.len());
        Ok(())
    }

    /// Note that an entry changed without being persisted
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Persist if an entry changed since the last write
    pub fn flush(&self) -> Result<(), FatError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut contents = self.contents()?.lock();
        self.persist(&mut contents)
    }

    /// The interned node for a child entry
    fn node_for(self: &Arc<Self>, entry: SharedEntry) -> UsbFile {
        let (name, is_directory) = {
            let group = entry.lock();
            (group.name(), group.is_directory())
        };
        let key = self.child_path(&name).to_lowercase();
        self.core.intern(key, || {
            if is_directory {
                UsbFile::Directory(FatDirectory::new(self.core.clone(), self.clone(), entry))
            } else {
                UsbFile::File(FatFile::new(self.core.clone(), self.clone(), entry))
            }
        })
    }

    /// Child named `name` (case-insensitive), if present
    pub fn child(self: &Arc<Self>, name: &str) -> Result<Option<UsbFile>, FatError> {
        let entry = self.contents()?.lock().lookup(name);
        Ok(entry.map(|e| self.node_for(e)))
    }

    /// Every child, in on-disk order
    pub fn list(self: &Arc<Self>) -> Result<Vec<UsbFile>, FatError> {
        let entries: Vec<SharedEntry> = self
            .contents()?
            .lock()
            .entries
            .iter()
            .filter(|e| !e.lock().is_dot_entry())
            .cloned()
            .collect();
        Ok(entries.into_iter().map(|e| self.node_for(e)).collect())
    }

    /// Resolve a relative path below this directory
    ///
    /// Returns `Ok(None)` if a segment does not exist or a file is used as
    /// a directory.
    pub fn search(self: &Arc<Self>, path: &str) -> Result<Option<UsbFile>, FatError> {
        self.walk(&split_path(path))
    }

    pub(crate) fn walk(self: &Arc<Self>, segments: &[&str]) -> Result<Option<UsbFile>, FatError> {
        let mut current = self.clone();
        for (i, segment) in segments.iter().enumerate() {
            let node = if *segment == ".." {
                UsbFile::Directory(current.parent().unwrap_or_else(|| current.clone()))
            } else {
                match current.child(segment)? {
                    Some(node) => node,
                    None => return Ok(None),
                }
            };

            if i + 1 == segments.len() {
                return Ok(Some(node));
            }
            match node {
                UsbFile::Directory(dir) => current = dir,
                UsbFile::File(_) => return Ok(None),
            }
        }
        Ok(Some(UsbFile::Directory(current)))
    }

    pub fn create_file(self: &Arc<Self>, name: &str) -> Result<UsbFile, FatError> {
        self.create(name, false)
    }

    pub fn create_directory(self: &Arc<Self>, name: &str) -> Result<UsbFile, FatError> {
        self.create(name, true)
    }

    fn create(self: &Arc<Self>, name: &str, directory: bool) -> Result<UsbFile, FatError> {
        validate_name(name)?;

        let entry = {
            let mut guard = self.contents()?.lock();
            let contents = &mut *guard;
            if contents.lookup(name).is_some() {
                return Err(FatError::AlreadyExists(name.to_string()));
            }

            let short = short_name::generate(name, &contents.short_names)?;
            let mut chain = ClusterChain::allocate(&self.core, 1)?;
            let cluster = chain.start_cluster();
            let now = time::now_unix_ms();

            if directory {
                let parent_cluster = if self.is_root() {
                    0
                } else {
                    contents.chain.start_cluster()
                };
                if let Err(e) = self.write_dot_entries(&chain, parent_cluster, now) {
                    chain.release(&self.core)?;
                    return Err(e);
                }
            }

            let attr = if directory { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
            let entry = contents.insert(DirEntryGroup::new(name, short, attr, cluster, now));
            if let Err(e) = self.persist(contents) {
                contents.remove(&entry);
                chain.release(&self.core)?;
                return Err(e);
            }
            entry
        };

        log::debug!(
            "FAT32: created {} {}",
            if directory { "directory" } else { "file" },
            self.child_path(name)
        );
        Ok(self.node_for(entry))
    }

    /// `.` and `..` at the start of a new directory's first cluster
    fn write_dot_entries(
        &self,
        chain: &ClusterChain,
        parent_cluster: u32,
        now: u64,
    ) -> Result<(), FatError> {
        let dot = RawDirEntry::new(ShortName::DOT, ATTR_DIRECTORY, chain.start_cluster(), now);
        let dot_dot = RawDirEntry::new(ShortName::DOT_DOT, ATTR_DIRECTORY, parent_cluster, now);

        let mut bytes = vec![0u8; self.core.boot.bytes_per_cluster() as usize];
        bytes[..DIR_ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        bytes[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(dot_dot.as_bytes());
        chain.write(&self.core, 0, &bytes)
    }

    /// Rename the child `old` to `new` in place
    pub fn rename_child(self: &Arc<Self>, old: &str, new: &str) -> Result<UsbFile, FatError> {
        validate_name(new)?;

        let (entry, old_key, new_key) = {
            let mut guard = self.contents()?.lock();
            let contents = &mut *guard;
            let entry = contents
                .lookup(old)
                .ok_or_else(|| FatError::NotFound(self.child_path(old)))?;
            if let Some(existing) = contents.lookup(new) {
                if !Arc::ptr_eq(&existing, &entry) {
                    return Err(FatError::AlreadyExists(new.to_string()));
                }
            }

            let (old_name, old_short) = {
                let group = entry.lock();
                (group.name(), group.short_name())
            };
            contents.short_names.remove(&old_short);
            let short = match short_name::generate(new, &contents.short_names) {
                Ok(short) => short,
                Err(e) => {
                    contents.short_names.insert(old_short);
                    return Err(e);
                }
            };

            // Re-added at the end, like a fresh entry
            contents.remove(&entry);
            entry.lock().rename(new, short);
            contents.short_names.insert(short);
            contents
                .by_name
                .insert(new.to_lowercase(), entry.clone());
            contents.entries.push(entry.clone());
            self.persist(contents)?;

            (
                entry,
                self.child_path(&old_name).to_lowercase(),
                self.child_path(new).to_lowercase(),
            )
        };

        self.core.rekey(&old_key, &new_key);
        log::debug!("FAT32: renamed {} to {}", old_key, new_key);
        Ok(self.node_for(entry))
    }

    /// Delete the child `name`; directories are emptied first
    pub fn remove(self: &Arc<Self>, name: &str) -> Result<(), FatError> {
        let node = self
            .child(name)?
            .ok_or_else(|| FatError::NotFound(self.child_path(name)))?;

        match &node {
            UsbFile::Directory(dir) => {
                for child in dir.list()? {
                    dir.remove(&child.name())?;
                }
                dir.release()?;
            }
            UsbFile::File(file) => file.release()?,
        }

        let key = node.path().to_lowercase();
        {
            let mut guard = self.contents()?.lock();
            let contents = &mut *guard;
            if let Some(entry) = contents.lookup(name) {
                contents.remove(&entry);
            }
            self.persist(contents)?;
        }

        self.core.forget(&key);
        log::debug!("FAT32: deleted {}", key);
        Ok(())
    }

    /// Free the chain of an emptied directory and mark it deleted
    fn release(&self) -> Result<(), FatError> {
        let mut contents = self.contents()?.lock();
        contents.chain.release(&self.core)?;
        self.deleted.store(true, Ordering::Release);
        Ok(())
    }
}
