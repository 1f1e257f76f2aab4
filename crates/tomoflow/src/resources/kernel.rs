/// Compiled kernels
///
/// A kernel is identified by the module it comes from and its entry point.
/// It carries one compute pipeline per GPU node it was built for and,
/// optionally, a host implementation used on emulated nodes.

use crate::error::{EngineError, Result};
use crate::hal::NodeId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Host implementation of a kernel
///
/// Receives the bound arrays in argument order and the global work size.
pub type HostKernelFn = dyn Fn(&mut [&mut [f32]], [u32; 3]) -> std::result::Result<(), String>
    + Send
    + Sync;

/// Cache key of a kernel: (module name, entry point)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub module: String,
    pub entry: String,
}

impl KernelKey {
    pub fn new(module: &str, entry: &str) -> Self {
        Self {
            module: module.to_string(),
            entry: entry.to_string(),
        }
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.entry)
    }
}

/// A compute pipeline built for one GPU device
pub struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroup_size: [u32; 3],
}

impl GpuKernel {
    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Number of workgroups covering `global` work items
    pub fn workgroups(&self, global: [u32; 3]) -> [u32; 3] {
        std::array::from_fn(|i| global[i].div_ceil(self.workgroup_size[i].max(1)))
    }
}

struct KernelInner {
    key: KernelKey,
    gpu: HashMap<NodeId, GpuKernel>,
    host: Option<Arc<HostKernelFn>>,
}

/// Shared handle to a compiled kernel
///
/// Handles are cheap to clone; all clones refer to the same compiled
/// object, so the resource manager can count references with `Arc`.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub(crate) fn new(
        key: KernelKey,
        gpu: HashMap<NodeId, GpuKernel>,
        host: Option<Arc<HostKernelFn>>,
    ) -> Self {
        Self {
            inner: Arc::new(KernelInner { key, gpu, host }),
        }
    }

    pub fn key(&self) -> &KernelKey {
        &self.inner.key
    }

    /// Pipeline compiled for GPU node `node`
    pub fn gpu(&self, node: NodeId) -> Option<&GpuKernel> {
        self.inner.gpu.get(&node)
    }

    pub fn host_fn(&self) -> Option<&Arc<HostKernelFn>> {
        self.inner.host.as_ref()
    }

    /// True if both handles refer to the same compiled kernel
    pub fn same_as(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("key", &self.inner.key)
            .field("gpu_nodes", &self.inner.gpu.len())
            .field("host", &self.inner.host.is_some())
            .finish()
    }
}

/// Byte offset of `fn <entry>` in a WGSL source, if it is declared
pub(crate) fn find_entry(source: &str, entry: &str) -> Option<usize> {
    let needle = format!("fn {entry}");
    let mut from = 0;
    while let Some(pos) = source[from..].find(&needle) {
        let at = from + pos;
        let rest = source[at + needle.len()..].trim_start();
        if rest.starts_with('(') {
            return Some(at);
        }
        from = at + needle.len();
    }
    None
}

/// Workgroup size declared on the entry point, `[1, 1, 1]` when absent
pub(crate) fn parse_workgroup_size(source: &str, entry: &str) -> [u32; 3] {
    let mut size = [1u32; 3];
    let Some(at) = find_entry(source, entry) else {
        return size;
    };
    let head = &source[..at];
    let Some(attr) = head.rfind("@workgroup_size(") else {
        return size;
    };
    let args = &head[attr + "@workgroup_size(".len()..];
    let Some(close) = args.find(')') else {
        return size;
    };
    for (slot, value) in size.iter_mut().zip(args[..close].split(',')) {
        if let Ok(v) = value.trim().trim_end_matches('u').parse::<u32>() {
            *slot = v.max(1);
        }
    }
    size
}

/// Build a compute pipeline for `entry` on one device
pub(crate) fn compile_gpu(device: &wgpu::Device, key: &KernelKey, source: &str) -> Result<GpuKernel> {
    let compile_error = |reason: String| EngineError::CompileFailed {
        module: key.module.clone(),
        entry: key.entry.clone(),
        reason,
    };

    if find_entry(source, &key.entry).is_none() {
        return Err(compile_error("entry point not found in module".to_string()));
    }

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&key.module),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&key.entry),
        layout: None,
        module: &module,
        entry_point: &key.entry,
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(compile_error(err.to_string()));
    }

    let layout = pipeline.get_bind_group_layout(0);
    let workgroup_size = parse_workgroup_size(source, &key.entry);

    log::debug!("Compiled {} (workgroup size {:?})", key, workgroup_size);

    Ok(GpuKernel {
        pipeline,
        layout,
        workgroup_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<f32>;

@compute @workgroup_size(8, 4)
fn scale(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = data[id.x] * 2.0;
}

@compute @workgroup_size(64)
fn scale_all(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = 0.0;
}
"#;

    #[test]
    fn finds_exact_entry_points() {
        assert!(find_entry(SHADER, "scale").is_some());
        assert!(find_entry(SHADER, "scale_all").is_some());
        assert!(find_entry(SHADER, "sca").is_none());
        assert!(find_entry(SHADER, "missing").is_none());
    }

    #[test]
    fn parses_workgroup_size_of_entry() {
        assert_eq!(parse_workgroup_size(SHADER, "scale"), [8, 4, 1]);
        assert_eq!(parse_workgroup_size(SHADER, "scale_all"), [64, 1, 1]);
        assert_eq!(parse_workgroup_size(SHADER, "missing"), [1, 1, 1]);
    }

    #[test]
    fn key_display() {
        assert_eq!(KernelKey::new("arith.wgsl", "add").to_string(), "arith.wgsl::add");
    }

    #[test]
    fn clones_share_the_compiled_kernel() {
        let kernel = Kernel::new(KernelKey::new("m", "e"), HashMap::new(), None);
        let clone = kernel.clone();
        assert!(kernel.same_as(&clone));
        assert_eq!(kernel.strong_count(), 2);
    }
}
