//! File tree nodes
//!
//! `UsbFile` is what callers hold: either a directory or a file of a mounted
//! volume. Nodes are interned per absolute path, so two lookups of the same
//! path give the same `Arc` and any change made through one is seen by all.

use super::directory::FatDirectory;
use super::file::FatFile;
use super::FatError;
use std::sync::Arc;

#[derive(Clone)]
pub enum UsbFile {
    Directory(Arc<FatDirectory>),
    File(Arc<FatFile>),
}

impl UsbFile {
    pub fn is_directory(&self) -> bool {
        matches!(self, UsbFile::Directory(_))
    }

    pub fn is_root(&self) -> bool {
        match self {
            UsbFile::Directory(dir) => dir.is_root(),
            UsbFile::File(_) => false,
        }
    }

    /// Name in the parent directory; empty for the root
    pub fn name(&self) -> String {
        match self {
            UsbFile::Directory(dir) => dir.name(),
            UsbFile::File(file) => file.name(),
        }
    }

    /// Absolute path with the names' original case
    pub fn path(&self) -> String {
        match self {
            UsbFile::Directory(dir) => dir.path(),
            UsbFile::File(file) => file.path(),
        }
    }

    pub fn parent(&self) -> Option<UsbFile> {
        match self {
            UsbFile::Directory(dir) => dir.parent().map(UsbFile::Directory),
            UsbFile::File(file) => Some(UsbFile::Directory(file.parent())),
        }
    }

    /// Same node instance
    pub fn ptr_eq(&self, other: &UsbFile) -> bool {
        match (self, other) {
            (UsbFile::Directory(a), UsbFile::Directory(b)) => Arc::ptr_eq(a, b),
            (UsbFile::File(a), UsbFile::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_directory(&self) -> Result<&Arc<FatDirectory>, FatError> {
        match self {
            UsbFile::Directory(dir) => Ok(dir),
            UsbFile::File(_) => Err(FatError::NotADirectory),
        }
    }

    pub fn as_file(&self) -> Result<&Arc<FatFile>, FatError> {
        match self {
            UsbFile::Directory(_) => Err(FatError::IsADirectory),
            UsbFile::File(file) => Ok(file),
        }
    }

    /// Last modification time in Unix milliseconds; 0 for the root
    pub fn last_modified_ms(&self) -> u64 {
        let entry = match self {
            UsbFile::Directory(dir) => dir.entry(),
            UsbFile::File(file) => Some(file.entry()),
        };
        entry.map(|e| e.lock().modified_ms()).unwrap_or(0)
    }

    /// Creation time in Unix milliseconds; 0 for the root
    pub fn created_ms(&self) -> u64 {
        let entry = match self {
            UsbFile::Directory(dir) => dir.entry(),
            UsbFile::File(file) => Some(file.entry()),
        };
        entry.map(|e| e.lock().created_ms()).unwrap_or(0)
    }

    // Directory operations

    pub fn list(&self) -> Result<Vec<UsbFile>, FatError> {
        self.as_directory()?.list()
    }

    pub fn search(&self, path: &str) -> Result<Option<UsbFile>, FatError> {
        self.as_directory()?.search(path)
    }

    pub fn create_file(&self, name: &str) -> Result<UsbFile, FatError> {
        self.as_directory()?.create_file(name)
    }

    pub fn create_directory(&self, name: &str) -> Result<UsbFile, FatError> {
        self.as_directory()?.create_directory(name)
    }

    // File operations

    pub fn length(&self) -> Result<u64, FatError> {
        Ok(self.as_file()?.length())
    }

    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FatError> {
        self.as_file()?.read(offset, buffer)
    }

    pub fn write(&self, offset: u64, buffer: &[u8]) -> Result<(), FatError> {
        self.as_file()?.write(offset, buffer)
    }

    pub fn set_length(&self, length: u64) -> Result<(), FatError> {
        self.as_file()?.set_length(length)
    }

    // Both

    pub fn flush(&self) -> Result<(), FatError> {
        match self {
            UsbFile::Directory(dir) => dir.flush(),
            UsbFile::File(file) => file.flush(),
        }
    }

    pub fn close(&self) -> Result<(), FatError> {
        match self {
            UsbFile::Directory(dir) => dir.flush(),
            UsbFile::File(file) => file.close(),
        }
    }

    /// Rename in place; the node keeps its identity
    pub fn rename(&self, new_name: &str) -> Result<UsbFile, FatError> {
        let parent = self.parent().ok_or(FatError::RootDirectory)?;
        parent.as_directory()?.rename_child(&self.name(), new_name)
    }

    /// Delete this node, and everything below it for a directory
    pub fn delete(&self) -> Result<(), FatError> {
        let parent = self.parent().ok_or(FatError::RootDirectory)?;
        parent.as_directory()?.remove(&self.name())
    }
}

impl core::fmt::Debug for UsbFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = if self.is_directory() { "Directory" } else { "File" };
        f.debug_tuple(kind).field(&self.path()).finish()
    }
}
