/// Command queues and device arrays
///
/// A `CommandQueue` is bound to exactly one compute node for the lifetime
/// of the pipeline. GPU nodes submit through wgpu; the CPU node emulates
/// device memory in host RAM and runs registered host kernels.

use super::allocator::{HostAllocator, HostRegion};
use super::NodeId;
use crate::error::{EngineError, Result};
use crate::resources::Kernel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

enum QueueBackend {
    Gpu {
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
    },
    Host {
        allocator: HostAllocator,
    },
}

struct QueueInner {
    id: u64,
    node: NodeId,
    backend: QueueBackend,
}

/// Shared handle to a node's command queue
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

enum DeviceStorage {
    Gpu(Arc<wgpu::Buffer>),
    Host(Arc<HostRegion>),
}

/// A device-resident array bound to one command queue
#[derive(Clone)]
pub struct DeviceArray {
    queue_id: u64,
    size: usize,
    storage: Arc<DeviceStorage>,
}

impl DeviceArray {
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// Id of the queue this array was allocated on
    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// Underlying wgpu buffer, if this array lives on a GPU
    pub fn wgpu_buffer(&self) -> Option<&wgpu::Buffer> {
        match self.storage.as_ref() {
            DeviceStorage::Gpu(buffer) => Some(buffer),
            DeviceStorage::Host(_) => None,
        }
    }

    fn host_region(&self) -> Option<&Arc<HostRegion>> {
        match self.storage.as_ref() {
            DeviceStorage::Host(region) => Some(region),
            DeviceStorage::Gpu(_) => None,
        }
    }
}

impl CommandQueue {
    pub(crate) fn gpu(node: NodeId, device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self::with_backend(node, QueueBackend::Gpu { device, queue })
    }

    pub(crate) fn host(node: NodeId) -> Self {
        Self::with_backend(
            node,
            QueueBackend::Host {
                allocator: HostAllocator::new(),
            },
        )
    }

    fn with_backend(node: NodeId, backend: QueueBackend) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                node,
                backend,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// True when device memory is emulated in host RAM
    pub fn is_emulated(&self) -> bool {
        matches!(self.inner.backend, QueueBackend::Host { .. })
    }

    /// Bytes of live emulated device memory (0 for GPU queues)
    pub fn emulated_bytes(&self) -> usize {
        match &self.inner.backend {
            QueueBackend::Host { allocator } => allocator.total_allocated(),
            QueueBackend::Gpu { .. } => 0,
        }
    }

    pub(crate) fn wgpu_device(&self) -> Option<&wgpu::Device> {
        match &self.inner.backend {
            QueueBackend::Gpu { device, .. } => Some(device),
            QueueBackend::Host { .. } => None,
        }
    }

    /// Allocate a device array of at least `size` bytes
    pub fn allocate(&self, size: usize) -> Result<DeviceArray> {
        let storage = match &self.inner.backend {
            QueueBackend::Gpu { device, .. } => {
                // Copies must be 4-byte aligned and bindings non-empty.
                let padded = size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
                let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("tomoflow device array"),
                    size: padded as u64,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                DeviceStorage::Gpu(Arc::new(buffer))
            }
            QueueBackend::Host { allocator } => DeviceStorage::Host(allocator.allocate(size)),
        };

        Ok(DeviceArray {
            queue_id: self.inner.id,
            size,
            storage: Arc::new(storage),
        })
    }

    fn check_owner(&self, array: &DeviceArray) -> Result<()> {
        if array.queue_id != self.inner.id {
            return Err(EngineError::ResourceUnavailable(format!(
                "device array belongs to queue {}, not queue {}",
                array.queue_id, self.inner.id
            )));
        }
        Ok(())
    }

    /// Upload host data into `dst`
    pub fn write(&self, dst: &DeviceArray, data: &[f32]) -> Result<()> {
        self.check_owner(dst)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() > dst.size {
            return Err(EngineError::ResourceUnavailable(format!(
                "upload of {} bytes exceeds device array of {} bytes",
                bytes.len(),
                dst.size
            )));
        }

        match (&self.inner.backend, dst.storage.as_ref()) {
            (QueueBackend::Gpu { queue, .. }, DeviceStorage::Gpu(buffer)) => {
                if !bytes.is_empty() {
                    queue.write_buffer(buffer, 0, bytes);
                }
            }
            (QueueBackend::Host { .. }, DeviceStorage::Host(region)) => {
                region.data().lock()[..data.len()].copy_from_slice(data);
            }
            _ => unreachable!("device array storage does not match its queue"),
        }

        log::trace!("Queue {}: uploaded {} bytes", self.inner.id, bytes.len());
        Ok(())
    }

    /// Download `dst.len()` elements from `src`, blocking until the copy is done
    pub fn read(&self, src: &DeviceArray, dst: &mut [f32]) -> Result<()> {
        self.check_owner(src)?;
        let size = std::mem::size_of_val(dst);
        if size > src.size {
            return Err(EngineError::ResourceUnavailable(format!(
                "download of {} bytes exceeds device array of {} bytes",
                size, src.size
            )));
        }

        match (&self.inner.backend, src.storage.as_ref()) {
            (QueueBackend::Gpu { device, queue }, DeviceStorage::Gpu(buffer)) => {
                if size > 0 {
                    read_back(device, queue, buffer, dst)?;
                }
            }
            (QueueBackend::Host { .. }, DeviceStorage::Host(region)) => {
                let len = dst.len();
                dst.copy_from_slice(&region.data().lock()[..len]);
            }
            _ => unreachable!("device array storage does not match its queue"),
        }

        log::trace!("Queue {}: downloaded {} bytes", self.inner.id, size);
        Ok(())
    }

    /// Enqueue `kernel` over a global work size with `args` bound in order
    pub fn dispatch(&self, kernel: &Kernel, args: &[&DeviceArray], global: [u32; 3]) -> Result<()> {
        for arg in args {
            self.check_owner(arg)?;
        }

        match &self.inner.backend {
            QueueBackend::Gpu { device, queue } => {
                let compiled = kernel.gpu(self.inner.node).ok_or_else(|| {
                    EngineError::ResourceUnavailable(format!(
                        "kernel {} was not compiled for node {}",
                        kernel.key(),
                        self.inner.node
                    ))
                })?;

                device.push_error_scope(wgpu::ErrorFilter::Validation);

                let entries: Vec<wgpu::BindGroupEntry> = args
                    .iter()
                    .enumerate()
                    .filter_map(|(binding, arg)| {
                        arg.wgpu_buffer().map(|buffer| wgpu::BindGroupEntry {
                            binding: binding as u32,
                            resource: buffer.as_entire_binding(),
                        })
                    })
                    .collect();

                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("tomoflow kernel bind group"),
                    layout: compiled.bind_group_layout(),
                    entries: &entries,
                });

                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("tomoflow kernel encoder"),
                });

                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("tomoflow kernel pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(compiled.pipeline());
                    pass.set_bind_group(0, &bind_group, &[]);
                    let [x, y, z] = compiled.workgroups(global);
                    pass.dispatch_workgroups(x, y, z);
                }

                queue.submit(std::iter::once(encoder.finish()));

                if let Some(err) = pollster::block_on(device.pop_error_scope()) {
                    return Err(EngineError::ResourceUnavailable(format!(
                        "dispatch of {} failed: {err}",
                        kernel.key()
                    )));
                }
            }
            QueueBackend::Host { .. } => {
                let host_fn = kernel.host_fn().ok_or_else(|| {
                    EngineError::ResourceUnavailable(format!(
                        "kernel {} has no host implementation for emulated node {}",
                        kernel.key(),
                        self.inner.node
                    ))
                })?;

                let mut regions: Vec<&Arc<HostRegion>> = Vec::with_capacity(args.len());
                for arg in args {
                    let region = arg.host_region().ok_or_else(|| {
                        EngineError::ResourceUnavailable("GPU array bound on host queue".into())
                    })?;
                    if regions.iter().any(|r| Arc::ptr_eq(r, region)) {
                        return Err(EngineError::ResourceUnavailable(format!(
                            "device array bound twice to kernel {}",
                            kernel.key()
                        )));
                    }
                    regions.push(region);
                }

                let mut guards: Vec<_> = regions.iter().map(|r| r.data().lock()).collect();
                let mut slices: Vec<&mut [f32]> =
                    guards.iter_mut().map(|g| g.as_mut_slice()).collect();

                host_fn(slices.as_mut_slice(), global).map_err(|reason| {
                    EngineError::ResourceUnavailable(format!(
                        "host kernel {} failed: {reason}",
                        kernel.key()
                    ))
                })?;
            }
        }

        log::trace!(
            "Queue {}: dispatched {} over {:?}",
            self.inner.id,
            kernel.key(),
            global
        );
        Ok(())
    }

    /// Block until all submitted work on this queue has completed
    pub fn finish(&self) -> Result<()> {
        match &self.inner.backend {
            QueueBackend::Gpu { device, queue } => wait_for_queue_idle(device, queue),
            // Host dispatches run synchronously.
            QueueBackend::Host { .. } => Ok(()),
        }
    }
}

fn wait_for_queue_idle(device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    queue.on_submitted_work_done(move || {
        let _ = tx.send(());
    });
    queue.submit(std::iter::empty());
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| EngineError::ResourceUnavailable("queue completion canceled".into()))
}

fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    dst: &mut [f32],
) -> Result<()> {
    let size = std::mem::size_of_val(dst) as u64;
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("tomoflow readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("tomoflow readback encoder"),
    });
    encoder.copy_buffer_to_buffer(src, 0, &readback, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = readback.slice(..);
    let (tx, rx) = crossbeam::channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });

    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| EngineError::ResourceUnavailable("readback canceled".into()))?
        .map_err(|e| EngineError::ResourceUnavailable(format!("readback map failed: {e:?}")))?;

    {
        let data = slice.get_mapped_range();
        bytemuck::cast_slice_mut::<f32, u8>(dst).copy_from_slice(&data);
    }
    readback.unmap();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_queue_round_trips_data() {
        let queue = CommandQueue::host(0);
        assert!(queue.is_emulated());

        let array = queue.allocate(16).unwrap();
        queue.write(&array, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(queue.emulated_bytes(), 16);

        let mut out = [0.0f32; 4];
        queue.read(&array, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let queue = CommandQueue::host(0);
        let array = queue.allocate(8).unwrap();
        assert!(queue.write(&array, &[0.0; 3]).is_err());
    }

    #[test]
    fn arrays_are_bound_to_their_queue() {
        let a = CommandQueue::host(0);
        let b = CommandQueue::host(1);
        let array = a.allocate(4).unwrap();
        assert!(matches!(
            b.write(&array, &[1.0]),
            Err(EngineError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn queue_ids_are_unique() {
        assert_ne!(CommandQueue::host(0).id(), CommandQueue::host(0).id());
    }
}
