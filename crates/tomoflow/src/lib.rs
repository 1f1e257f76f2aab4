/// tomoflow - streaming dataflow engine for GPU image pipelines
///
/// Pipelines are graphs of tasks connected by bounded channels. Each task
/// runs on its own worker, reads buffers from its input channels and
/// writes one buffer per invocation to its output channel. Buffers keep a
/// host copy and a device copy coherent lazily.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hal;
pub mod profiler;
pub mod resources;
pub mod task;
pub mod tasks;
pub mod types;

pub use buffer::{Buffer, Location};
pub use channel::Channel;
pub use config::{DevicePreference, EngineConfig};
pub use error::{EngineError, Result};
pub use executor::{ExecutionReport, Executor, TaskReport};
pub use graph::{Graph, TaskId};
pub use resources::{Kernel, ResourceManager};
pub use task::{Task, TaskEnv};
pub use types::{Requisition, SampleDepth, TaskMode, TaskState};

use std::path::PathBuf;
use std::sync::Arc;

/// Resource manager plus executor
pub struct Engine {
    resources: Arc<ResourceManager>,
    executor: Executor,
}

impl Engine {
    /// Open compute nodes according to `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        log::info!("=== Initializing tomoflow engine ===");
        let resources = Arc::new(ResourceManager::new(config)?);
        Ok(Self::with_resources(resources))
    }

    /// Engine on the emulated host node only; never touches the GPU stack
    pub fn host_only(config: EngineConfig) -> Self {
        Self::with_resources(Arc::new(ResourceManager::host_only(config)))
    }

    fn with_resources(resources: Arc<ResourceManager>) -> Self {
        let executor = Executor::new(Arc::clone(&resources));
        Self {
            resources,
            executor,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn config(&self) -> &EngineConfig {
        self.resources.config()
    }

    /// Execute `graph` until every task has finished or failed
    pub fn run(&self, graph: Graph) -> Result<ExecutionReport> {
        self.executor.run(graph)
    }
}

/// Builder for `Engine` with custom configuration
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.config.device = device;
        self
    }

    pub fn with_require_gpu(mut self, required: bool) -> Self {
        self.config.require_gpu = required;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.config.profiling = enabled;
        self
    }

    pub fn with_kernel_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_paths.push(path.into());
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        if self.config.device == DevicePreference::Cpu {
            return Ok(Engine::host_only(self.config));
        }
        Engine::new(self.config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_options() {
        let engine = EngineBuilder::new()
            .with_device(DevicePreference::Cpu)
            .with_pool_size(3)
            .with_profiling(true)
            .with_kernel_path("/opt/kernels")
            .build()
            .unwrap();

        assert_eq!(engine.config().pool_size, 3);
        assert!(engine.config().profiling);
        assert_eq!(engine.config().kernel_paths.len(), 1);
        assert!(!engine.resources().has_gpu());
    }

    #[test]
    fn builder_rejects_invalid_config() {
        assert!(EngineBuilder::new()
            .with_device(DevicePreference::Cpu)
            .with_pool_size(0)
            .build()
            .is_err());
    }
}
