/// Hardware Abstraction Layer
///
/// Discovers compute devices and exposes them as compute nodes, each with
/// exactly one command queue for the lifetime of the pipeline.

pub mod allocator;
pub mod queue;

use crate::error::{EngineError, Result};
use std::sync::Arc;

pub use queue::{CommandQueue, DeviceArray};

/// Index of a compute node inside a resource manager
pub type NodeId = usize;

/// Hardware capabilities of a compute node
#[derive(Debug, Clone)]
pub struct HardwareInfo {
    pub device_name: String,
    pub backend: String,
    pub unified_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Cpu,
    Gpu,
}

/// A CPU or GPU execution context with its own command queue
#[derive(Clone)]
pub struct ComputeNode {
    id: NodeId,
    kind: NodeKind,
    info: HardwareInfo,
    queue: CommandQueue,
}

impl ComputeNode {
    pub(crate) fn cpu(id: NodeId) -> Self {
        Self {
            id,
            kind: NodeKind::Cpu,
            info: HardwareInfo {
                device_name: "host".to_string(),
                backend: "emulated".to_string(),
                unified_memory: true,
            },
            queue: CommandQueue::host(id),
        }
    }

    pub(crate) fn gpu(id: NodeId, device: GpuDevice) -> Self {
        Self {
            id,
            kind: NodeKind::Gpu,
            info: device.info,
            queue: CommandQueue::gpu(id, device.device, device.queue),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_gpu(&self) -> bool {
        self.kind == NodeKind::Gpu
    }

    pub fn info(&self) -> &HardwareInfo {
        &self.info
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

impl std::fmt::Debug for ComputeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device", &self.info.device_name)
            .finish()
    }
}

pub(crate) struct GpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: HardwareInfo,
}

/// Enumerate every adapter and open one device/queue pair per adapter
pub(crate) fn discover_gpus() -> Result<Vec<GpuDevice>> {
    log::info!("Initializing Hardware Abstraction Layer...");

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let mut devices = Vec::new();

    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let info = adapter.get_info();
        log::info!("Found GPU: {} ({:?})", info.name, info.backend);

        let requested = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(&format!("Device: {}", info.name)),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ));

        let (device, queue) = match requested {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("  Skipping {}: {e}", info.name);
                continue;
            }
        };

        let unified_memory = matches!(info.device_type, wgpu::DeviceType::IntegratedGpu);
        devices.push(GpuDevice {
            device: Arc::new(device),
            queue: Arc::new(queue),
            info: HardwareInfo {
                device_name: info.name,
                backend: format!("{:?}", info.backend),
                unified_memory,
            },
        });
    }

    log::info!("HAL initialized with {} GPU device(s)", devices.len());
    Ok(devices)
}

/// Fail unless at least one GPU was found
pub(crate) fn require_gpus(devices: &[GpuDevice]) -> Result<()> {
    if devices.is_empty() {
        return Err(EngineError::ResourceUnavailable(
            "no compatible GPU devices found".to_string(),
        ));
    }
    Ok(())
}
