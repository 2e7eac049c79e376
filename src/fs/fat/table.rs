//! File Allocation Table
//!
//! Maps cluster -> next cluster. Reads go through an LRU cache of FAT
//! sectors; writes update the cached sector and store it to every FAT copy
//! that mirroring asks for. The free count and next-free hint live here and
//! are mirrored into FSInfo after every alloc and free.

use super::boot_sector::BootSector;
use super::fs_info::{self, FsInfo};
use super::FatError;
use crate::drivers::block::ByteBlockDevice;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Mask of the meaningful bits of a FAT32 entry
pub const ENTRY_MASK: u32 = 0x0FFF_FFFF;
/// Free cluster
pub const FREE: u32 = 0;
/// Bad cluster marker
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// Smallest end-of-chain marker
pub const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;
/// End-of-chain marker written by this driver
pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

/// Bytes read per step when counting free clusters
const SCAN_CHUNK: usize = 64 * 1024;

pub struct Fat {
    boot: BootSector,
    fs_info: FsInfo,
    free_count: u32,
    next_free: u32,
    cache: LruCache<u32, Vec<u8>>,
}

impl Fat {
    /// Load allocation state, scanning the FAT when FSInfo cannot be trusted
    pub fn load(
        device: &ByteBlockDevice,
        boot: &BootSector,
        cache_sectors: usize,
    ) -> Result<Self, FatError> {
        let fs_info = FsInfo::read(device, boot.fs_info_offset())?;
        let capacity = NonZeroUsize::new(cache_sectors.max(1)).unwrap_or(NonZeroUsize::MIN);

        let mut fat = Self {
            boot: boot.clone(),
            fs_info,
            free_count: fs_info.free_count,
            next_free: fs_info.next_free,
            cache: LruCache::new(capacity),
        };

        let total = boot.total_clusters();
        if !fs_info.is_valid() || fat.free_count == fs_info::UNKNOWN || fat.free_count > total {
            log::info!("FAT32: free cluster count unknown, scanning FAT");
            fat.free_count = fat.scan_free(device)?;
        }
        if fat.next_free < 2 || fat.next_free > boot.max_cluster() {
            fat.next_free = 2;
        }

        log::debug!(
            "FAT32: {} of {} clusters free, next free hint {}",
            fat.free_count,
            total,
            fat.next_free
        );
        Ok(fat)
    }

    fn scan_free(&self, device: &ByteBlockDevice) -> Result<u32, FatError> {
        let base = self.boot.fat_offset(self.boot.fat_to_read());
        let end = (self.boot.max_cluster() as u64 + 1) * 4;
        let mut buf = vec![0u8; SCAN_CHUNK];
        let mut free = 0u32;
        let mut pos = 0u64;

        while pos < end {
            let len = (end - pos).min(SCAN_CHUNK as u64) as usize;
            device.read(base + pos, &mut buf[..len])?;
            for (i, raw) in buf[..len].chunks_exact(4).enumerate() {
                let cluster = (pos / 4) as usize + i;
                let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) & ENTRY_MASK;
                if cluster >= 2 && value == FREE {
                    free += 1;
                }
            }
            pos += len as u64;
        }
        Ok(free)
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_count
    }

    pub fn total_clusters(&self) -> u32 {
        self.boot.total_clusters()
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), FatError> {
        if cluster < 2 || cluster > self.boot.max_cluster() {
            return Err(FatError::InvalidCluster(cluster));
        }
        Ok(())
    }

    /// Cached FAT sector holding `cluster`, and the entry's byte index in it
    fn sector(&mut self, device: &ByteBlockDevice, cluster: u32) -> Result<(u32, usize), FatError> {
        let bps = self.boot.bytes_per_sector;
        let byte = cluster as u64 * 4;
        let sector = (byte / bps as u64) as u32;
        let index = (byte % bps as u64) as usize;

        if !self.cache.contains(&sector) {
            let mut buf = vec![0u8; bps as usize];
            let at = self.boot.fat_offset(self.boot.fat_to_read()) + sector as u64 * bps as u64;
            device.read(at, &mut buf)?;
            self.cache.put(sector, buf);
        }
        Ok((sector, index))
    }

    /// Raw value of the FAT entry for `cluster`
    pub fn entry(&mut self, device: &ByteBlockDevice, cluster: u32) -> Result<u32, FatError> {
        self.check_cluster(cluster)?;
        let (sector, i) = self.sector(device, cluster)?;
        let buf = self.cache.get(&sector).ok_or(FatError::InvalidCluster(cluster))?;
        Ok(u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]) & ENTRY_MASK)
    }

    /// Store `value` for `cluster` in every FAT copy, keeping the reserved top bits
    fn set_entry(
        &mut self,
        device: &ByteBlockDevice,
        cluster: u32,
        value: u32,
    ) -> Result<(), FatError> {
        self.check_cluster(cluster)?;
        let (sector, i) = self.sector(device, cluster)?;
        let bps = self.boot.bytes_per_sector as u64;
        let buf = self
            .cache
            .get_mut(&sector)
            .ok_or(FatError::InvalidCluster(cluster))?;

        let old = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let new = (old & !ENTRY_MASK) | (value & ENTRY_MASK);
        buf[i..i + 4].copy_from_slice(&new.to_le_bytes());

        for copy in self.boot.fats_to_write() {
            device.write(self.boot.fat_offset(copy) + sector as u64 * bps, &buf[..])?;
        }
        Ok(())
    }

    /// Follow the chain starting at `start`. Cluster 0 is the empty chain.
    pub fn get_chain(&mut self, device: &ByteBlockDevice, start: u32) -> Result<Vec<u32>, FatError> {
        let mut chain = Vec::new();
        if start == FREE {
            return Ok(chain);
        }

        let limit = self.boot.total_clusters() as usize;
        let mut cluster = start;
        loop {
            if cluster < 2 || cluster > self.boot.max_cluster() {
                log::warn!("FAT32: chain from {} reaches invalid cluster {}", start, cluster);
                return Err(FatError::CorruptChain(start));
            }
            chain.push(cluster);
            if chain.len() > limit {
                log::warn!("FAT32: chain from {} loops", start);
                return Err(FatError::CorruptChain(start));
            }

            match self.entry(device, cluster)? {
                next if next >= END_OF_CHAIN_MIN => break,
                FREE | BAD_CLUSTER => {
                    log::warn!("FAT32: chain from {} runs into cluster {}", start, cluster);
                    return Err(FatError::CorruptChain(start));
                }
                next => cluster = next,
            }
        }
        Ok(chain)
    }

    /// Append `count` free clusters to `chain`, returning the whole new chain
    pub fn alloc(
        &mut self,
        device: &ByteBlockDevice,
        chain: &[u32],
        count: u32,
    ) -> Result<Vec<u32>, FatError> {
        let mut result = chain.to_vec();
        if count == 0 {
            return Ok(result);
        }
        if count > self.free_count {
            return Err(FatError::NoSpace);
        }

        let first = 2u32;
        let last = self.boot.max_cluster();
        let start = self.next_free.clamp(first, last);
        let mut found = Vec::with_capacity(count as usize);

        let candidates = (start..=last).chain(first..start);
        for cluster in candidates {
            if self.entry(device, cluster)? == FREE {
                found.push(cluster);
                if found.len() == count as usize {
                    break;
                }
            }
        }
        if found.len() < count as usize {
            log::warn!(
                "FAT32: free count says {} but only {} clusters free",
                self.free_count,
                found.len()
            );
            return Err(FatError::NoSpace);
        }

        // Terminate the new run first, then link it in
        for (i, &cluster) in found.iter().enumerate().rev() {
            let next = found.get(i + 1).copied().unwrap_or(END_OF_CHAIN);
            self.set_entry(device, cluster, next)?;
        }
        if let Some(&tail) = chain.last() {
            self.set_entry(device, tail, found[0])?;
        }

        self.free_count -= count;
        self.next_free = found.last().map(|&c| c + 1).unwrap_or(first);
        if self.next_free > last {
            self.next_free = first;
        }
        self.store_fs_info(device)?;

        log::trace!("FAT32: allocated {} clusters {:?}", count, found);
        result.extend_from_slice(&found);
        Ok(result)
    }

    /// Release the last `count` clusters of `chain`, returning what remains
    pub fn free(
        &mut self,
        device: &ByteBlockDevice,
        chain: &[u32],
        count: u32,
    ) -> Result<Vec<u32>, FatError> {
        let count = (count as usize).min(chain.len());
        if count == 0 {
            return Ok(chain.to_vec());
        }
        let keep = chain.len() - count;

        if keep > 0 {
            self.set_entry(device, chain[keep - 1], END_OF_CHAIN)?;
        }
        for &cluster in &chain[keep..] {
            self.set_entry(device, cluster, FREE)?;
        }

        self.free_count += count as u32;
        self.next_free = self.next_free.min(chain[keep]);
        self.store_fs_info(device)?;

        log::trace!("FAT32: freed {} clusters", count);
        Ok(chain[..keep].to_vec())
    }

    fn store_fs_info(&mut self, device: &ByteBlockDevice) -> Result<(), FatError> {
        self.fs_info.free_count = self.free_count;
        self.fs_info.next_free = self.next_free;
        self.fs_info.write(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{format_fat32, MemoryBlockDevice};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn setup(image: Vec<u8>) -> (ByteBlockDevice, BootSector, Fat) {
        let dev = ByteBlockDevice::new(Arc::new(MemoryBlockDevice::from_image(image, 512)));
        let mut sector = [0u8; 512];
        dev.read(0, &mut sector).unwrap();
        let boot = BootSector::parse(&sector).unwrap();
        let fat = Fat::load(&dev, &boot, 8).unwrap();
        (dev, boot, fat)
    }

    #[test]
    fn test_alloc_decrements_free_count_exactly() {
        let (dev, _, mut fat) = setup(format_fat32(4096, "T"));
        let before = fat.free_clusters();

        let a = fat.alloc(&dev, &[], 5).unwrap();
        let b = fat.alloc(&dev, &a, 7).unwrap();
        assert_eq!(fat.free_clusters(), before - 12);
        assert_eq!(b.len(), 12);
        assert_eq!(&b[..5], &a[..]);

        let unique: HashSet<u32> = b.iter().copied().collect();
        assert_eq!(unique.len(), 12);
        // Root directory owns cluster 2
        assert!(!unique.contains(&2));

        assert_eq!(fat.get_chain(&dev, b[0]).unwrap(), b);
    }

    #[test]
    fn test_alloc_writes_every_fat_copy() {
        let (dev, boot, mut fat) = setup(format_fat32(4096, "T"));
        let chain = fat.alloc(&dev, &[], 2).unwrap();

        for copy in 0..boot.num_fats {
            let mut raw = [0u8; 4];
            dev.read(boot.fat_offset(copy) + chain[0] as u64 * 4, &mut raw)
                .unwrap();
            assert_eq!(u32::from_le_bytes(raw), chain[1]);
        }
    }

    #[test]
    fn test_free_truncates_and_restores_count() {
        let (dev, _, mut fat) = setup(format_fat32(4096, "T"));
        let before = fat.free_clusters();
        let chain = fat.alloc(&dev, &[], 6).unwrap();

        let rest = fat.free(&dev, &chain, 4).unwrap();
        assert_eq!(rest, chain[..2].to_vec());
        assert_eq!(fat.free_clusters(), before - 2);
        assert_eq!(fat.get_chain(&dev, chain[0]).unwrap(), rest);
        assert_eq!(fat.entry(&dev, chain[5]).unwrap(), FREE);
    }

    #[test]
    fn test_free_count_rescanned_when_fs_info_invalid() {
        let mut image = format_fat32(4096, "T");
        // Wrong free count in FSInfo
        image[512 + 488..512 + 492].copy_from_slice(&999_999u32.to_le_bytes());
        let (_, _, fat) = setup(image);
        assert_eq!(fat.free_clusters(), 3999);
    }

    #[test]
    fn test_loop_is_reported_as_corrupt() {
        let (dev, _, mut fat) = setup(format_fat32(4096, "T"));
        let chain = fat.alloc(&dev, &[], 3).unwrap();
        fat.set_entry(&dev, chain[2], chain[0]).unwrap();
        assert!(matches!(
            fat.get_chain(&dev, chain[0]),
            Err(FatError::CorruptChain(_))
        ));
    }

    #[test]
    fn test_no_space() {
        let (dev, _, mut fat) = setup(format_fat32(4096, "T"));
        let free = fat.free_clusters();
        assert!(matches!(
            fat.alloc(&dev, &[], free + 1),
            Err(FatError::NoSpace)
        ));
        assert_eq!(fat.free_clusters(), free);
    }
}
