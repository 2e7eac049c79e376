//! Cluster chains
//!
//! The clusters backing one file or directory, in order. Byte I/O is split
//! into runs of physically contiguous clusters so a defragmented file costs
//! one device request per run instead of one per cluster.

use super::{FatError, FsCore};

#[derive(Clone, Debug, Default)]
pub struct ClusterChain {
    clusters: Vec<u32>,
}

impl ClusterChain {
    /// Follow the FAT from `start`; cluster 0 gives an empty chain
    pub fn open(core: &FsCore, start: u32) -> Result<Self, FatError> {
        let clusters = core.fat.lock().get_chain(&core.device, start)?;
        Ok(Self { clusters })
    }

    /// A fresh chain of `count` clusters
    pub fn allocate(core: &FsCore, count: u32) -> Result<Self, FatError> {
        let clusters = core.fat.lock().alloc(&core.device, &[], count)?;
        Ok(Self { clusters })
    }

    /// First cluster, or 0 when empty
    pub fn start_cluster(&self) -> u32 {
        self.clusters.first().copied().unwrap_or(0)
    }

    pub fn clusters(&self) -> &[u32] {
        &self.clusters
    }

    /// Bytes the chain can hold
    pub fn capacity(&self, core: &FsCore) -> u64 {
        self.clusters.len() as u64 * core.boot.bytes_per_cluster() as u64
    }

    /// Grow or shrink to exactly `count` clusters
    pub fn set_cluster_count(&mut self, core: &FsCore, count: usize) -> Result<(), FatError> {
        let current = self.clusters.len();
        if count == current {
            return Ok(());
        }
        let mut fat = core.fat.lock();
        self.clusters = if count > current {
            fat.alloc(&core.device, &self.clusters, (count - current) as u32)?
        } else {
            fat.free(&core.device, &self.clusters, (current - count) as u32)?
        };
        Ok(())
    }

    /// Resize to hold `length` bytes. A chain never drops below one cluster.
    pub fn set_length(&mut self, core: &FsCore, length: u64) -> Result<(), FatError> {
        let bpc = core.boot.bytes_per_cluster() as u64;
        let count = length.div_ceil(bpc).max(1);
        self.set_cluster_count(core, count as usize)
    }

    /// Return every cluster to the free pool
    pub fn release(&mut self, core: &FsCore) -> Result<(), FatError> {
        self.set_cluster_count(core, 0)
    }

    /// Contiguous pieces covering `len` bytes at `offset`: (device offset, bytes)
    fn runs(&self, core: &FsCore, offset: u64, len: usize) -> Result<Vec<(u64, usize)>, FatError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity(core) => {}
            _ => return Err(FatError::OutOfBounds),
        }

        let bpc = core.boot.bytes_per_cluster() as u64;
        let mut runs = Vec::new();
        let mut pos = offset;
        let mut remaining = len as u64;

        while remaining > 0 {
            let index = (pos / bpc) as usize;
            let within = pos % bpc;
            let mut last = index;
            while last + 1 < self.clusters.len()
                && self.clusters[last + 1] == self.clusters[last] + 1
                && ((last + 1 - index) as u64 * bpc - within) < remaining
            {
                last += 1;
            }

            let span = ((last - index + 1) as u64 * bpc - within).min(remaining);
            let at = core.boot.cluster_offset(self.clusters[index]) + within;
            runs.push((at, span as usize));
            pos += span;
            remaining -= span;
        }
        Ok(runs)
    }

    pub fn read(&self, core: &FsCore, offset: u64, buffer: &mut [u8]) -> Result<(), FatError> {
        let mut done = 0;
        for (at, len) in self.runs(core, offset, buffer.len())? {
            core.device.read(at, &mut buffer[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    pub fn write(&self, core: &FsCore, offset: u64, buffer: &[u8]) -> Result<(), FatError> {
        let mut done = 0;
        for (at, len) in self.runs(core, offset, buffer.len())? {
            core.device.write(at, &buffer[done..done + len])?;
            done += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::Fat32FileSystem;
    use crate::testing::{format_fat32, MemoryBlockDevice};
    use crate::drivers::block::ByteBlockDevice;
    use std::sync::Arc;

    fn mount() -> (Arc<MemoryBlockDevice>, Fat32FileSystem) {
        let mem = Arc::new(MemoryBlockDevice::from_image(format_fat32(4096, "T"), 512));
        let fs = Fat32FileSystem::mount(ByteBlockDevice::new(mem.clone()), 8).unwrap();
        (mem, fs)
    }

    #[test]
    fn test_contiguous_clusters_merge_into_one_request() {
        let (mem, fs) = mount();
        let core = fs.core();
        let chain = ClusterChain::allocate(core, 8).unwrap();
        let data: Vec<u8> = (0..8 * 512).map(|i| (i % 253) as u8).collect();

        let writes = mem.writes();
        chain.write(core, 0, &data).unwrap();
        assert_eq!(mem.writes(), writes + 1);

        let mut back = vec![0u8; data.len()];
        chain.read(core, 0, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_fragmented_chain_round_trip() {
        let (_, fs) = mount();
        let core = fs.core();
        let mut a = ClusterChain::allocate(core, 2).unwrap();
        let _gap = ClusterChain::allocate(core, 1).unwrap();
        a.set_cluster_count(core, 4).unwrap();
        assert_ne!(a.clusters()[1] + 1, a.clusters()[2]);

        let data: Vec<u8> = (0..1500).map(|i| (i % 7) as u8).collect();
        a.write(core, 300, &data).unwrap();
        let mut back = vec![0u8; 1500];
        a.read(core, 300, &mut back).unwrap();
        assert_eq!(back, data);

        assert!(matches!(
            a.read(core, 4 * 512 - 1, &mut [0u8; 2]),
            Err(FatError::OutOfBounds)
        ));
    }

    #[test]
    fn test_set_length_rounds_up_to_clusters() {
        let (_, fs) = mount();
        let core = fs.core();
        let mut chain = ClusterChain::allocate(core, 1).unwrap();
        chain.set_length(core, 1025).unwrap();
        assert_eq!(chain.clusters().len(), 3);
        chain.set_length(core, 0).unwrap();
        assert_eq!(chain.clusters().len(), 1);
    }
}
