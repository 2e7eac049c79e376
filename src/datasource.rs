//! Chunked random-access reader
//!
//! Decoders seek a lot and read small pieces; every miss over USB costs a
//! full command round trip. Reads are served from aligned, fixed-size chunks
//! of the file kept in an LRU cache, so a decoder walking through a file
//! costs one device read per chunk.

use crate::fs::fat::node::UsbFile;
use crate::fs::fat::FatError;
use lru::LruCache;
use spin::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Cache sizing
#[derive(Clone, Copy, Debug)]
pub struct DataSourceConfig {
    /// Bytes per chunk; chunk offsets are multiples of this
    pub chunk_size: usize,
    /// Chunks kept before the least recently used is evicted
    pub max_chunks: usize,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_chunks: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error(transparent)]
    Fs(#[from] FatError),
    /// `offset + length` does not fit the destination buffer
    #[error("buffer range {offset}+{length} exceeds buffer of {size} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("data source closed")]
    Closed,
}

/// Random-access reader over one file with an aligned chunk cache
pub struct ChunkedDataSource {
    file: UsbFile,
    size: u64,
    chunk_size: usize,
    cache: Mutex<LruCache<u64, Vec<u8>>>,
    closed: AtomicBool,
}

impl ChunkedDataSource {
    pub fn new(file: UsbFile, config: DataSourceConfig) -> Result<Self, DataSourceError> {
        let size = file.length()?;
        let capacity = NonZeroUsize::new(config.max_chunks).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            file,
            size,
            chunk_size: config.chunk_size.max(1),
            cache: Mutex::new(LruCache::new(capacity)),
            closed: AtomicBool::new(false),
        })
    }

    /// File length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `length` bytes at `position` into `buffer[offset..]`
    ///
    /// Returns the bytes copied; 0 at or past the end of the file.
    pub fn read_at(
        &self,
        position: u64,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<usize, DataSourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DataSourceError::Closed);
        }
        let size = buffer.len();
        let dest = offset
            .checked_add(length)
            .and_then(|end| buffer.get_mut(offset..end))
            .ok_or(DataSourceError::InvalidRange {
                offset,
                length,
                size,
            })?;

        if position >= self.size {
            return Ok(0);
        }
        let total = (self.size - position).min(dest.len() as u64) as usize;
        let chunk_size = self.chunk_size as u64;

        let mut copied = 0;
        while copied < total {
            let pos = position + copied as u64;
            let aligned = pos - pos % chunk_size;
            let within = (pos - aligned) as usize;

            let mut cache = self.cache.lock();
            if !cache.contains(&aligned) {
                let chunk = self.load_chunk(aligned)?;
                cache.put(aligned, chunk);
            }
            let Some(chunk) = cache.get(&aligned) else {
                break;
            };
            if within >= chunk.len() {
                break;
            }
            let n = (chunk.len() - within).min(total - copied);
            dest[copied..copied + n].copy_from_slice(&chunk[within..within + n]);
            copied += n;
        }
        Ok(copied)
    }

    fn load_chunk(&self, aligned: u64) -> Result<Vec<u8>, DataSourceError> {
        let len = (self.size - aligned).min(self.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; len];
        let n = self.file.read(aligned, &mut chunk)?;
        chunk.truncate(n);
        log::trace!("DataSource: loaded chunk at {} ({} bytes)", aligned, n);
        Ok(chunk)
    }

    /// Offsets of the cached chunks, ascending
    pub fn cached_offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self.cache.lock().iter().map(|(k, _)| *k).collect();
        offsets.sort_unstable();
        offsets
    }

    /// Drop the cache and release the file's chain
    pub fn close(&self) -> Result<(), DataSourceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.lock().clear();
        self.file.close()?;
        Ok(())
    }
}
