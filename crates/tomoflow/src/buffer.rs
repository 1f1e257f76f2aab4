/// Buffer - numeric data with host/device duality
///
/// A buffer owns a host array of native `f32` elements and, lazily, a
/// device array bound to one command queue. Exactly one of the two is
/// authoritative at any time; asking for the other performs a single
/// synchronizing copy and flips authority.

use crate::error::{EngineError, Result};
use crate::hal::{CommandQueue, DeviceArray};
use crate::types::{Requisition, SampleDepth};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Which representation currently holds the valid data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    Device,
}

/// Number of synchronizing copies a buffer has performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
}

struct DeviceCopy {
    queue: CommandQueue,
    array: DeviceArray,
}

pub struct Buffer {
    id: u64,
    requisition: Requisition,
    depth: SampleDepth,
    /// Host storage; its length is the element capacity of the buffer
    host: Vec<f32>,
    device: Option<DeviceCopy>,
    location: Location,
    transfers: TransferStats,
}

impl Buffer {
    /// Create a zeroed, host-authoritative buffer
    pub fn new(requisition: &Requisition) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            requisition: requisition.clone(),
            depth: SampleDepth::F32,
            host: vec![0.0; requisition.num_elements()],
            device: None,
            location: Location::Host,
            transfers: TransferStats::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requisition(&self) -> &Requisition {
        &self.requisition
    }

    pub fn depth(&self) -> SampleDepth {
        self.depth
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn transfers(&self) -> TransferStats {
        self.transfers
    }

    /// Number of native elements in the current requisition
    pub fn len(&self) -> usize {
        self.requisition.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the shape of this buffer for the next invocation
    ///
    /// Growing beyond the current capacity reallocates host storage; the
    /// device array is reallocated lazily on the next `device_view`.
    pub fn set_requisition(&mut self, requisition: &Requisition) -> Result<()> {
        if &self.requisition == requisition {
            return Ok(());
        }
        // Keep the current contents reachable from the host before resizing.
        self.sync_host()?;
        self.ensure_capacity(requisition.num_elements());
        self.requisition = requisition.clone();
        Ok(())
    }

    fn ensure_capacity(&mut self, elements: usize) {
        if self.host.len() < elements {
            self.host.resize(elements, 0.0);
        }
    }

    fn sync_host(&mut self) -> Result<()> {
        if self.location == Location::Device {
            if let Some(copy) = &self.device {
                let len = self.requisition.num_elements();
                copy.queue.read(&copy.array, &mut self.host[..len])?;
                self.transfers.device_to_host += 1;
                log::trace!("Buffer {}: device -> host ({} elements)", self.id, len);
            }
            self.location = Location::Host;
        }
        Ok(())
    }

    /// Mutable host array; copies device data back first if it is newer
    pub fn host_view(&mut self) -> Result<&mut [f32]> {
        self.sync_host()?;
        let len = self.requisition.num_elements();
        Ok(&mut self.host[..len])
    }

    /// Device array on `queue`; uploads host data first if it is newer
    pub fn device_view(&mut self, queue: &CommandQueue) -> Result<&DeviceArray> {
        let len = self.requisition.num_elements();
        let needed = len * std::mem::size_of::<f32>();

        let reusable = self
            .device
            .as_ref()
            .map(|copy| copy.queue.id() == queue.id() && copy.array.size_bytes() >= needed)
            .unwrap_or(false);

        if !reusable {
            // Moving to another queue or growing: pull data home first.
            self.sync_host()?;
            let capacity = self.host.len().max(len) * std::mem::size_of::<f32>();
            let array = queue.allocate(capacity)?;
            self.device = Some(DeviceCopy {
                queue: queue.clone(),
                array,
            });
        }

        let copy = self
            .device
            .as_ref()
            .ok_or_else(|| EngineError::ResourceUnavailable("device array missing".into()))?;

        if self.location == Location::Host {
            copy.queue.write(&copy.array, &self.host[..len])?;
            self.transfers.host_to_device += 1;
            self.location = Location::Device;
            log::trace!("Buffer {}: host -> device ({} elements)", self.id, len);
        }

        Ok(&copy.array)
    }

    /// Replace host storage outright with native data
    ///
    /// The host becomes authoritative and any device copy is stale.
    pub fn set_host_array(&mut self, data: Vec<f32>) -> Result<()> {
        let len = self.requisition.num_elements();
        if data.len() < len {
            return Err(EngineError::ShapeMismatch(format!(
                "host array of {} elements is smaller than requisition {}",
                data.len(),
                self.requisition
            )));
        }
        self.host = data;
        self.depth = SampleDepth::F32;
        self.location = Location::Host;
        Ok(())
    }

    /// Replace host contents with raw samples of the given depth
    ///
    /// Sub-native samples stay packed at the start of the storage until
    /// `reinterpret` expands them.
    pub fn set_host_bytes(&mut self, bytes: &[u8], depth: SampleDepth) -> Result<()> {
        let elements = bytes.len().div_ceil(std::mem::size_of::<f32>());
        self.ensure_capacity(elements.max(self.requisition.num_elements()));

        let storage: &mut [u8] = bytemuck::cast_slice_mut(&mut self.host);
        storage[..bytes.len()].copy_from_slice(bytes);

        self.depth = depth;
        self.location = Location::Host;
        Ok(())
    }

    /// Expand `count` packed samples of `bits_per_sample` to native `f32`
    ///
    /// With `normalize` the result is divided by the largest value the
    /// depth can represent. A no-op for native (32-bit) data, including
    /// data that was already expanded. Packed data of another depth is
    /// rejected.
    pub fn reinterpret(&mut self, bits_per_sample: u16, count: usize, normalize: bool) -> Result<()> {
        let depth = SampleDepth::from_bits(bits_per_sample)
            .ok_or(EngineError::UnsupportedDepth(bits_per_sample))?;
        if depth == SampleDepth::F32 || self.depth == SampleDepth::F32 {
            return Ok(());
        }
        if depth != self.depth {
            return Err(EngineError::DepthMismatch {
                stored: self.depth.bits(),
                requested: bits_per_sample,
            });
        }

        self.sync_host()?;
        self.ensure_capacity(count);

        let scale = if normalize { 1.0 / depth.max_value() } else { 1.0 };

        // Walk backwards: element i is written over bytes [4i, 4i + 4),
        // which only hold samples that were already consumed.
        for i in (0..count).rev() {
            let raw = {
                let bytes: &[u8] = bytemuck::cast_slice(&self.host);
                match depth {
                    SampleDepth::U8 => bytes[i] as f32,
                    SampleDepth::U16 => u16::from_ne_bytes([bytes[2 * i], bytes[2 * i + 1]]) as f32,
                    SampleDepth::F32 => unreachable!(),
                }
            };
            self.host[i] = raw * scale;
        }

        self.depth = SampleDepth::F32;
        self.location = Location::Host;
        log::trace!(
            "Buffer {}: reinterpreted {} samples from {} bits (normalize={})",
            self.id,
            count,
            bits_per_sample,
            normalize
        );
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("requisition", &self.requisition)
            .field("depth", &self.depth)
            .field("location", &self.location)
            .finish()
    }
}
