/// Generic GPU processor
///
/// Binds every input and then the output, in that order, and dispatches
/// one kernel over the requisition.

use crate::buffer::Buffer;
use crate::error::{EngineError, Result};
use crate::hal::DeviceArray;
use crate::resources::Kernel;
use crate::task::{common_requisition, expect_output, Task, TaskEnv};
use crate::types::{Requisition, TaskMode};

pub struct KernelTask {
    name: String,
    module: String,
    entry: String,
    inputs: usize,
    rank: usize,
    kernel: Option<Kernel>,
}

impl KernelTask {
    pub fn new(module: &str, entry: &str, inputs: usize) -> Self {
        Self {
            name: entry.to_string(),
            module: module.to_string(),
            entry: entry.to_string(),
            inputs,
            rank: 0,
            kernel: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Require every input to have this rank
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }
}

impl Task for KernelTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, env: &TaskEnv) -> Result<()> {
        let kernel = env
            .resources
            .get_kernel(&self.module, &self.entry)
            .map_err(|e| EngineError::setup(self.name.as_str(), e))?;
        self.kernel = Some(kernel);
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        self.inputs
    }

    fn num_dimensions(&self, _input: usize) -> usize {
        self.rank
    }

    fn mode(&self) -> TaskMode {
        TaskMode::GPU_PROCESSOR
    }

    fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition> {
        common_requisition(&self.name, inputs)
    }

    fn process(
        &mut self,
        env: &TaskEnv,
        inputs: &mut [Buffer],
        output: Option<&mut Buffer>,
        requisition: &Requisition,
    ) -> Result<bool> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| EngineError::process(self.name.as_str(), "kernel not set up"))?;
        let queue = env.queue();

        let mut args: Vec<DeviceArray> = Vec::with_capacity(inputs.len() + 1);
        for input in inputs.iter_mut() {
            args.push(input.device_view(queue)?.clone());
        }
        let output = expect_output(&self.name, output)?;
        args.push(output.device_view(queue)?.clone());

        let bound: Vec<&DeviceArray> = args.iter().collect();
        env.profiler
            .call(queue, kernel, &bound, requisition.global_size())
            .map_err(|e| EngineError::process(self.name.as_str(), e))?;
        Ok(true)
    }

    fn teardown(&mut self, env: &TaskEnv) {
        if let Some(kernel) = self.kernel.take() {
            env.resources.release(kernel);
        }
    }
}
