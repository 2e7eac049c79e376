//! FAT32 files
//!
//! Content lives in the file's cluster chain; the length, first cluster and
//! timestamps live in the directory entry shared with the parent. Writes
//! update the entry in memory and mark the parent dirty; `flush` or `close`
//! persists it.

use super::chain::ClusterChain;
use super::directory::FatDirectory;
use super::entry::SharedEntry;
use super::{FatError, FsCore};
use crate::time;
use spin::Mutex;
use std::sync::Arc;

/// Largest zero run written at once when a write skips past the end
const ZERO_FILL_CHUNK: usize = 64 * 1024;

struct FileState {
    /// Opened on first access
    chain: Option<ClusterChain>,
    deleted: bool,
}

/// A file node
pub struct FatFile {
    core: Arc<FsCore>,
    parent: Arc<FatDirectory>,
    entry: SharedEntry,
    state: Mutex<FileState>,
}

impl FatFile {
    pub(crate) fn new(core: Arc<FsCore>, parent: Arc<FatDirectory>, entry: SharedEntry) -> Arc<Self> {
        Arc::new(Self {
            core,
            parent,
            entry,
            state: Mutex::new(FileState {
                chain: None,
                deleted: false,
            }),
        })
    }

    pub fn name(&self) -> String {
        self.entry.lock().name()
    }

    pub fn path(&self) -> String {
        self.parent.child_path(&self.name())
    }

    pub fn parent(&self) -> Arc<FatDirectory> {
        self.parent.clone()
    }

    pub(crate) fn entry(&self) -> &SharedEntry {
        &self.entry
    }

    /// File size in bytes
    pub fn length(&self) -> u64 {
        self.entry.lock().file_size() as u64
    }

    fn chain<'a>(&self, state: &'a mut FileState) -> Result<&'a mut ClusterChain, FatError> {
        if state.deleted {
            return Err(FatError::Deleted);
        }
        if state.chain.is_none() {
            let start = self.entry.lock().start_cluster();
            state.chain = Some(ClusterChain::open(&self.core, start)?);
        }
        Ok(state.chain.get_or_insert_with(ClusterChain::default))
    }

    /// Read at `offset`; returns the bytes read, 0 at or past the end
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FatError> {
        let mut state = self.state.lock();
        let chain = self.chain(&mut state)?;

        let length = self.length();
        if offset >= length || buffer.is_empty() {
            return Ok(0);
        }
        let count = (length - offset).min(buffer.len() as u64) as usize;
        chain.read(&self.core, offset, &mut buffer[..count])?;
        Ok(count)
    }

    /// Write at `offset`, growing the file as needed
    pub fn write(&self, offset: u64, buffer: &[u8]) -> Result<(), FatError> {
        let end = offset
            .checked_add(buffer.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or(FatError::FileTooLarge)?;

        let mut state = self.state.lock();
        let chain = self.chain(&mut state)?;
        if buffer.is_empty() {
            return Ok(());
        }

        if end > chain.capacity(&self.core) {
            chain.set_length(&self.core, end)?;
        }
        // Bytes skipped over by a write past the end read back as zero
        self.zero_fill(chain, self.length(), offset)?;
        chain.write(&self.core, offset, buffer)?;

        {
            let mut entry = self.entry.lock();
            entry.set_start_cluster(chain.start_cluster());
            if end > entry.file_size() as u64 {
                entry.set_file_size(end as u32);
            }
            entry.touch_modified(time::now_unix_ms());
        }
        self.parent.mark_dirty();
        Ok(())
    }

    /// Truncate or extend to `length` bytes and persist the entry
    pub fn set_length(&self, length: u64) -> Result<(), FatError> {
        if length > u32::MAX as u64 {
            return Err(FatError::FileTooLarge);
        }

        let mut state = self.state.lock();
        let chain = self.chain(&mut state)?;
        let old_length = self.length();
        chain.set_length(&self.core, length)?;
        // Clusters past the old end still hold whatever was there before
        self.zero_fill(chain, old_length, length)?;
        {
            let mut entry = self.entry.lock();
            entry.set_start_cluster(chain.start_cluster());
            entry.set_file_size(length as u32);
            entry.touch_modified(time::now_unix_ms());
        }
        self.parent.mark_dirty();
        self.parent.flush()
    }

    /// Overwrite `[from, to)` with zeros; nothing when `to <= from`
    fn zero_fill(&self, chain: &mut ClusterChain, from: u64, to: u64) -> Result<(), FatError> {
        if to <= from {
            return Ok(());
        }
        let zeros = vec![0u8; (to - from).min(ZERO_FILL_CHUNK as u64) as usize];
        let mut at = from;
        while at < to {
            let n = (to - at).min(zeros.len() as u64) as usize;
            chain.write(&self.core, at, &zeros[..n])?;
            at += n as u64;
        }
        Ok(())
    }

    /// Persist the directory entry if it changed
    pub fn flush(&self) -> Result<(), FatError> {
        let _state = self.state.lock();
        self.parent.flush()
    }

    /// Flush and drop the cached chain
    pub fn close(&self) -> Result<(), FatError> {
        let mut state = self.state.lock();
        self.parent.flush()?;
        state.chain = None;
        Ok(())
    }

    /// Free the chain ahead of removing the entry
    pub(crate) fn release(&self) -> Result<(), FatError> {
        let mut state = self.state.lock();
        self.chain(&mut state)?.release(&self.core)?;
        state.deleted = true;
        state.chain = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::drivers::block::ByteBlockDevice;
    use crate::fs::fat::{Fat32FileSystem, FatError};
    use crate::fs::FileSystem;
    use crate::testing::{format_fat32, MemoryBlockDevice};
    use std::sync::Arc;

    fn fs() -> Fat32FileSystem {
        let mem = Arc::new(MemoryBlockDevice::from_image(format_fat32(4096, "T"), 512));
        Fat32FileSystem::mount(ByteBlockDevice::new(mem), 8).unwrap()
    }

    #[test]
    fn test_read_clamps_at_end() {
        let fs = fs();
        let node = fs.create_file("/a.bin").unwrap();
        let file = node.as_file().unwrap();
        file.write(0, b"hello world").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read(11, &mut buf).unwrap(), 0);
        assert_eq!(file.read(500, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sparse_write_extends_length() {
        let fs = fs();
        let node = fs.create_file("/gap.bin").unwrap();
        let file = node.as_file().unwrap();
        file.write(2000, b"tail").unwrap();
        assert_eq!(file.length(), 2004);

        let mut buf = vec![0xFFu8; 2004];
        assert_eq!(file.read(0, &mut buf).unwrap(), 2004);
        assert!(buf[..2000].iter().all(|&b| b == 0));
        assert_eq!(&buf[2000..], b"tail");
    }

    #[test]
    fn test_grow_reads_back_zeros() {
        let fs = fs();
        let node = fs.create_file("/a.bin").unwrap();
        let file = node.as_file().unwrap();
        file.write(0, &[0xAB; 2048]).unwrap();
        file.set_length(10).unwrap();
        file.set_length(2048).unwrap();

        let mut buf = vec![0xFFu8; 2048];
        assert_eq!(file.read(0, &mut buf).unwrap(), 2048);
        assert!(buf[..10].iter().all(|&b| b == 0xAB));
        assert!(buf[10..].iter().all(|&b| b == 0));

        // Clusters freed by another file come back clean too
        let other = fs.create_file("/b.bin").unwrap();
        other.write(0, &[0xCD; 4096]).unwrap();
        fs.delete("/b.bin").unwrap();
        file.set_length(8192).unwrap();
        let mut buf = vec![0xFFu8; 8192];
        assert_eq!(file.read(0, &mut buf).unwrap(), 8192);
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_length_reaches_disk_on_flush() {
        let mem = Arc::new(MemoryBlockDevice::from_image(format_fat32(4096, "T"), 512));
        let fs = Fat32FileSystem::mount(ByteBlockDevice::new(mem.clone()), 8).unwrap();
        let node = fs.create_file("/a.bin").unwrap();
        node.write(0, &[1, 2, 3]).unwrap();

        let before = Fat32FileSystem::mount(ByteBlockDevice::new(mem.clone()), 8).unwrap();
        let stale = before.search("/a.bin").unwrap().unwrap();
        assert_eq!(stale.length().unwrap(), 0);

        node.flush().unwrap();
        let after = Fat32FileSystem::mount(ByteBlockDevice::new(mem), 8).unwrap();
        assert_eq!(after.search("/A.BIN").unwrap().unwrap().length().unwrap(), 3);
    }

    #[test]
    fn test_too_large() {
        let fs = fs();
        let node = fs.create_file("/a.bin").unwrap();
        assert!(matches!(
            node.as_file().unwrap().write(u32::MAX as u64, &[0]),
            Err(FatError::FileTooLarge)
        ));
    }
}
