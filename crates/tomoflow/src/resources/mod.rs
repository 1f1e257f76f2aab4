/// Resource Manager - compute nodes, command queues and the kernel cache
///
/// The manager is created once per engine and shared by every task. It
/// owns one command queue per compute node and compiles each
/// (module, entry) pair at most once, handing out shared handles.

pub mod kernel;

pub use kernel::{GpuKernel, HostKernelFn, Kernel, KernelKey};

use crate::config::{DevicePreference, EngineConfig};
use crate::error::{EngineError, Result};
use crate::hal::{self, CommandQueue, ComputeNode, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Node id of the host CPU node; GPU nodes follow it
pub const CPU_NODE: NodeId = 0;

/// Cache entry for one key; its lock is held while that key compiles
type KernelSlot = Arc<Mutex<Option<Kernel>>>;

pub struct ResourceManager {
    config: EngineConfig,
    nodes: Vec<ComputeNode>,
    /// Kernel sources registered in memory, by module name
    sources: RwLock<HashMap<String, String>>,
    host_kernels: RwLock<HashMap<KernelKey, Arc<HostKernelFn>>>,
    kernels: Mutex<HashMap<KernelKey, KernelSlot>>,
    compilations: AtomicU64,
}

impl ResourceManager {
    /// Open the compute nodes the configuration asks for
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut nodes = vec![ComputeNode::cpu(CPU_NODE)];

        if config.device != DevicePreference::Cpu {
            let gpus = hal::discover_gpus()?;
            if config.require_gpu {
                hal::require_gpus(&gpus)?;
            }
            if gpus.is_empty() && config.device == DevicePreference::Gpu {
                log::warn!("No GPU available, GPU tasks will run on the emulated host node");
            }
            for (i, gpu) in gpus.into_iter().enumerate() {
                nodes.push(ComputeNode::gpu(CPU_NODE + 1 + i, gpu));
            }
        }

        for node in &nodes {
            log::info!(
                "  Node {}: {} ({})",
                node.id(),
                node.info().device_name,
                node.info().backend
            );
        }

        Ok(Self::with_nodes(config, nodes))
    }

    /// A manager with only the emulated host node
    pub fn host_only(config: EngineConfig) -> Self {
        Self::with_nodes(config, vec![ComputeNode::cpu(CPU_NODE)])
    }

    fn with_nodes(config: EngineConfig, nodes: Vec<ComputeNode>) -> Self {
        Self {
            config,
            nodes,
            sources: RwLock::new(HashMap::new()),
            host_kernels: RwLock::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[ComputeNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ComputeNode> {
        self.nodes.get(id)
    }

    pub fn cpu_node(&self) -> &ComputeNode {
        &self.nodes[CPU_NODE]
    }

    pub fn gpu_nodes(&self) -> impl Iterator<Item = &ComputeNode> {
        self.nodes.iter().filter(|n| n.is_gpu())
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_nodes().next().is_some()
    }

    /// The command queue bound to `node`
    pub fn command_queue(&self, node: NodeId) -> Result<CommandQueue> {
        self.nodes
            .get(node)
            .map(|n| n.queue().clone())
            .ok_or_else(|| EngineError::ResourceUnavailable(format!("no compute node {node}")))
    }

    /// Make a kernel module available without touching the filesystem
    pub fn register_source(&self, module: &str, source: &str) {
        self.sources
            .write()
            .insert(module.to_string(), source.to_string());
    }

    /// Provide the implementation used when `entry` runs on an emulated node
    pub fn register_host_kernel<F>(&self, module: &str, entry: &str, kernel: F)
    where
        F: Fn(&mut [&mut [f32]], [u32; 3]) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        self.host_kernels
            .write()
            .insert(KernelKey::new(module, entry), Arc::new(kernel));
    }

    fn load_source(&self, module: &str) -> Result<Option<String>> {
        if let Some(source) = self.sources.read().get(module) {
            return Ok(Some(source.clone()));
        }
        for dir in &self.config.kernel_paths {
            let path = dir.join(module);
            if path.is_file() {
                log::debug!("Loading kernel module {}", path.display());
                return Ok(Some(std::fs::read_to_string(path)?));
            }
        }
        Ok(None)
    }

    /// Return the compiled kernel for `(module, entry)`
    ///
    /// The first request compiles; later requests for the same key return
    /// the same handle. Compilation holds only the slot of its own key, so
    /// concurrent first requests for a key compile exactly once while
    /// other keys proceed in parallel.
    pub fn get_kernel(&self, module: &str, entry: &str) -> Result<Kernel> {
        let key = KernelKey::new(module, entry);
        let slot = Arc::clone(self.kernels.lock().entry(key.clone()).or_default());

        let mut compiled = slot.lock();
        if let Some(kernel) = compiled.as_ref() {
            return Ok(kernel.clone());
        }

        match self.compile(&key) {
            Ok(kernel) => {
                self.compilations.fetch_add(1, Ordering::Relaxed);
                log::info!("Kernel {} ready", key);
                *compiled = Some(kernel.clone());
                Ok(kernel)
            }
            Err(e) => {
                drop(compiled);
                self.forget_empty_slot(&key, slot);
                Err(e)
            }
        }
    }

    /// Drop the slot of a failed compilation unless another request is
    /// already waiting on it
    fn forget_empty_slot(&self, key: &KernelKey, slot: KernelSlot) {
        let mut cache = self.kernels.lock();
        let unused = cache
            .get(key)
            .map(|cached| Arc::ptr_eq(cached, &slot) && Arc::strong_count(&slot) == 2)
            .unwrap_or(false);
        if unused && slot.lock().is_none() {
            cache.remove(key);
        }
    }

    fn compile(&self, key: &KernelKey) -> Result<Kernel> {
        let source = self.load_source(&key.module)?;
        let host = self.host_kernels.read().get(key).cloned();

        let mut gpu = HashMap::new();
        if self.has_gpu() {
            let source = source.as_deref().ok_or_else(|| EngineError::CompileFailed {
                module: key.module.clone(),
                entry: key.entry.clone(),
                reason: "module not found".to_string(),
            })?;
            for node in self.gpu_nodes() {
                if let Some(device) = node.queue().wgpu_device() {
                    gpu.insert(node.id(), kernel::compile_gpu(device, key, source)?);
                }
            }
        } else {
            if host.is_none() {
                return Err(EngineError::CompileFailed {
                    module: key.module.clone(),
                    entry: key.entry.clone(),
                    reason: "no GPU available and no host implementation registered".to_string(),
                });
            }
            if let Some(source) = &source {
                if kernel::find_entry(source, &key.entry).is_none() {
                    return Err(EngineError::CompileFailed {
                        module: key.module.clone(),
                        entry: key.entry.clone(),
                        reason: "entry point not found in module".to_string(),
                    });
                }
            }
        }

        Ok(Kernel::new(key.clone(), gpu, host))
    }

    /// Give back a kernel handle
    ///
    /// The compiled kernel is evicted once no task holds a handle to it.
    pub fn release(&self, kernel: Kernel) {
        let key = kernel.key().clone();
        let mut cache = self.kernels.lock();
        drop(kernel);

        // Slots are only cloned under the cache lock, so a count of one
        // means no request is waiting on this key.
        let unused = cache
            .get(&key)
            .filter(|slot| Arc::strong_count(slot) == 1)
            .and_then(|slot| slot.lock().as_ref().map(|cached| cached.strong_count() == 1))
            .unwrap_or(false);
        if unused {
            cache.remove(&key);
            log::debug!("Evicted kernel {}", key);
        }
    }

    /// Outstanding handles to a cached kernel (0 if not cached)
    pub fn ref_count(&self, module: &str, entry: &str) -> usize {
        self.kernels
            .lock()
            .get(&KernelKey::new(module, entry))
            .and_then(|slot| slot.lock().as_ref().map(|k| k.strong_count() - 1))
            .unwrap_or(0)
    }

    /// Number of compilations performed so far
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn cached_kernels(&self) -> usize {
        self.kernels
            .lock()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("nodes", &self.nodes)
            .field("cached_kernels", &self.cached_kernels())
            .finish()
    }
}
