/// Sink tasks

use crate::buffer::Buffer;
use crate::error::Result;
use crate::task::{Task, TaskEnv};
use crate::types::{Requisition, TaskMode};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One received buffer snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub requisition: Requisition,
    pub data: Vec<f32>,
}

/// Read side of a `CollectSink`, usable after the pipeline has run
#[derive(Clone, Default)]
pub struct CollectHandle {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl CollectHandle {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copies every input buffer to host memory
pub struct CollectSink {
    name: String,
    frames: CollectHandle,
    delay: Option<std::time::Duration>,
}

impl CollectSink {
    pub fn new() -> (Self, CollectHandle) {
        let handle = CollectHandle::default();
        (
            Self {
                name: "collect-sink".to_string(),
                frames: handle.clone(),
                delay: None,
            },
            handle,
        )
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep after every frame, simulating a slow consumer
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Task for CollectSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn mode(&self) -> TaskMode {
        TaskMode::CPU_PROCESSOR
    }

    fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition> {
        Ok(inputs[0].requisition().clone())
    }

    fn process(
        &mut self,
        _env: &TaskEnv,
        inputs: &mut [Buffer],
        _output: Option<&mut Buffer>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let input = &mut inputs[0];
        let frame = Frame {
            requisition: input.requisition().clone(),
            data: input.host_view()?.to_vec(),
        };
        self.frames.frames.lock().push(frame);

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(true)
    }
}

/// Writes each input as `<prefix>-<index>.raw`, little-endian `f32`
pub struct RawWriter {
    dir: PathBuf,
    prefix: String,
    written: usize,
}

impl RawWriter {
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
            written: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}-{:05}.raw", self.prefix, index))
    }
}

impl Task for RawWriter {
    fn name(&self) -> &str {
        "raw-writer"
    }

    fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn mode(&self) -> TaskMode {
        TaskMode::CPU_PROCESSOR
    }

    fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition> {
        Ok(inputs[0].requisition().clone())
    }

    fn process(
        &mut self,
        _env: &TaskEnv,
        inputs: &mut [Buffer],
        _output: Option<&mut Buffer>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let data = inputs[0].host_view()?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();

        let path = self.frame_path(self.written);
        std::fs::write(&path, bytes)?;
        log::debug!("Wrote {}", path.display());

        self.written += 1;
        Ok(true)
    }

    fn teardown(&mut self, _env: &TaskEnv) {
        log::info!("Raw writer: {} frame(s) in {}", self.written, self.dir.display());
    }
}
