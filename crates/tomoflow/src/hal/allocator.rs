/// Host Allocator - device memory emulation for CPU nodes
///
/// Backs "device" arrays with host RAM so that the host/device coherency
/// protocol behaves identically on machines without a GPU.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A region of emulated device memory
pub struct HostRegion {
    /// Region identifier (unique per allocator)
    id: u64,
    /// Size in bytes as requested by the caller
    size: usize,
    data: Mutex<Vec<f32>>,
    stats: Arc<AllocatorStats>,
}

impl HostRegion {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn data(&self) -> &Mutex<Vec<f32>> {
        &self.data
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        self.stats.allocated_bytes.fetch_sub(self.size, Ordering::Relaxed);
        self.stats.regions.fetch_sub(1, Ordering::Relaxed);
        log::trace!("Freed host region {} ({} bytes)", self.id, self.size);
    }
}

#[derive(Default)]
struct AllocatorStats {
    allocated_bytes: AtomicUsize,
    regions: AtomicUsize,
}

/// Allocator for emulated device memory
pub struct HostAllocator {
    next_id: AtomicU64,
    stats: Arc<AllocatorStats>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            stats: Arc::new(AllocatorStats::default()),
        }
    }

    /// Allocate a zeroed region of `size` bytes, rounded up to whole elements
    pub fn allocate(&self, size: usize) -> Arc<HostRegion> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let elements = size.div_ceil(std::mem::size_of::<f32>());

        self.stats.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        self.stats.regions.fetch_add(1, Ordering::Relaxed);
        log::trace!("Allocated host region {} ({} bytes)", id, size);

        Arc::new(HostRegion {
            id,
            size,
            data: Mutex::new(vec![0.0; elements]),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Total live bytes
    pub fn total_allocated(&self) -> usize {
        self.stats.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Number of live regions
    pub fn allocation_count(&self) -> usize {
        self.stats.regions.load(Ordering::Relaxed)
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_accounted_until_dropped() {
        let allocator = HostAllocator::new();
        let a = allocator.allocate(64);
        let b = allocator.allocate(6);
        assert_eq!(allocator.total_allocated(), 70);
        assert_eq!(allocator.allocation_count(), 2);
        assert_eq!(b.data().lock().len(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        assert_eq!(allocator.total_allocated(), 6);
        assert_eq!(allocator.allocation_count(), 1);
    }
}
