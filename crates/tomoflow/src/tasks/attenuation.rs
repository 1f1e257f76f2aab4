/// Attenuation - adds the dark field to a data frame
///
/// Declared as a GPU processor but computes on the host arrays, so it
/// exercises device-to-host coherency on whichever node it lands on.

use crate::buffer::Buffer;
use crate::error::{EngineError, Result};
use crate::task::{common_requisition, expect_output, Task, TaskEnv};
use crate::types::{Requisition, TaskMode};

#[derive(Debug, Default)]
pub struct Attenuation;

impl Attenuation {
    pub fn new() -> Self {
        Self
    }
}

impl Task for Attenuation {
    fn name(&self) -> &str {
        "attenuation"
    }

    fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
        Ok(())
    }

    /// data, dark
    fn num_inputs(&self) -> usize {
        2
    }

    fn num_dimensions(&self, _input: usize) -> usize {
        2
    }

    fn mode(&self) -> TaskMode {
        TaskMode::GPU_PROCESSOR
    }

    fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition> {
        common_requisition(self.name(), inputs)
    }

    fn process(
        &mut self,
        _env: &TaskEnv,
        inputs: &mut [Buffer],
        output: Option<&mut Buffer>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let [data, dark] = inputs else {
            return Err(EngineError::process(self.name(), "expected data and dark inputs"));
        };
        let data = data.host_view()?;
        let dark = dark.host_view()?;
        let out = expect_output(self.name(), output)?.host_view()?;

        for ((o, d), k) in out.iter_mut().zip(data.iter()).zip(dark.iter()) {
            *o = d + k;
        }
        Ok(true)
    }
}
