/// Task contract
///
/// A task is an opaque unit of computation. The executor queries its
/// static shape contract once, calls `setup` once, then drives `process`
/// until an input finishes or the task reports exhaustion.

use crate::buffer::Buffer;
use crate::error::{EngineError, Result};
use crate::hal::{CommandQueue, ComputeNode};
use crate::profiler::Profiler;
use crate::resources::ResourceManager;
use crate::types::{Requisition, TaskMode};
use std::sync::Arc;

/// What a task sees of the engine
///
/// The node is fixed for the task's lifetime.
#[derive(Clone)]
pub struct TaskEnv {
    pub resources: Arc<ResourceManager>,
    pub node: ComputeNode,
    pub profiler: Profiler,
}

impl TaskEnv {
    pub fn new(resources: Arc<ResourceManager>, node: ComputeNode, profiler: Profiler) -> Self {
        Self {
            resources,
            node,
            profiler,
        }
    }

    /// The command queue of this task's node
    pub fn queue(&self) -> &CommandQueue {
        self.node.queue()
    }
}

pub trait Task: Send {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Resolve kernels and other resources. Called once before `process`.
    fn setup(&mut self, env: &TaskEnv) -> Result<()>;

    fn num_inputs(&self) -> usize;

    /// Expected rank of input `input`; 0 accepts any rank
    fn num_dimensions(&self, _input: usize) -> usize {
        0
    }

    fn mode(&self) -> TaskMode;

    /// Output shape for the current inputs
    ///
    /// Must only inspect the shapes of `inputs`, never their contents.
    fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition>;

    /// Compute one output from the current inputs
    ///
    /// `output` is `None` for tasks nobody consumes from. Returning
    /// `false` means the task is exhausted; the output of that call is not
    /// delivered.
    fn process(
        &mut self,
        env: &TaskEnv,
        inputs: &mut [Buffer],
        output: Option<&mut Buffer>,
        requisition: &Requisition,
    ) -> Result<bool>;

    /// Give back resources acquired in `setup`
    fn teardown(&mut self, _env: &TaskEnv) {}
}

/// Unwrap the output buffer of a task that needs somewhere to write
pub fn expect_output<'a>(task: &str, output: Option<&'a mut Buffer>) -> Result<&'a mut Buffer> {
    output.ok_or_else(|| EngineError::process(task, "task has no output channel"))
}

/// Requisition shared by all inputs, or `ShapeMismatch`
pub fn common_requisition(task: &str, inputs: &[Buffer]) -> Result<Requisition> {
    let first = inputs
        .first()
        .ok_or_else(|| EngineError::ShapeMismatch(format!("{task}: no inputs")))?
        .requisition();
    if let Some(other) = inputs.iter().find(|b| b.requisition() != first) {
        return Err(EngineError::ShapeMismatch(format!(
            "{task}: inputs disagree, {} vs {}",
            first,
            other.requisition()
        )));
    }
    Ok(first.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_requisition_requires_equal_shapes() {
        let a = Buffer::new(&Requisition::new(&[4, 4]));
        let b = Buffer::new(&Requisition::new(&[4, 4]));
        let c = Buffer::new(&Requisition::new(&[16]));

        assert_eq!(
            common_requisition("t", &[a, b]).unwrap(),
            Requisition::new(&[4, 4])
        );

        let a = Buffer::new(&Requisition::new(&[4, 4]));
        assert!(matches!(
            common_requisition("t", &[a, c]),
            Err(EngineError::ShapeMismatch(_))
        ));
        assert!(common_requisition("t", &[]).is_err());
    }

    #[test]
    fn missing_output_is_a_process_failure() {
        assert!(matches!(
            expect_output("sink", None),
            Err(EngineError::ProcessFailed { .. })
        ));
    }
}
