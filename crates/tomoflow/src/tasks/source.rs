/// Generator tasks
///
/// `MemorySource` replays frames held in memory. `RawSource` reads
/// headerless raw frames of known geometry from a directory.

use crate::buffer::Buffer;
use crate::error::{EngineError, Result};
use crate::task::{expect_output, Task, TaskEnv};
use crate::types::{Requisition, SampleDepth, TaskMode};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;

/// Emits each frame once, in order, then reports exhaustion
pub struct MemorySource {
    name: String,
    frames: VecDeque<(Requisition, Vec<f32>)>,
    last: Requisition,
}

impl MemorySource {
    /// Frames of identical shape
    pub fn new(requisition: &Requisition, frames: Vec<Vec<f32>>) -> Self {
        Self::with_shapes(
            frames
                .into_iter()
                .map(|data| (requisition.clone(), data))
                .collect(),
        )
    }

    /// Frames that may change shape between invocations
    pub fn with_shapes(frames: Vec<(Requisition, Vec<f32>)>) -> Self {
        let last = frames
            .first()
            .map(|(req, _)| req.clone())
            .unwrap_or_default();
        Self {
            name: "memory-source".to_string(),
            frames: frames.into(),
            last,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl Task for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
        for (requisition, data) in &self.frames {
            if data.len() != requisition.num_elements() {
                return Err(EngineError::setup(
                    self.name.as_str(),
                    format!(
                        "frame of {} elements does not match {}",
                        data.len(),
                        requisition
                    ),
                ));
            }
        }
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn mode(&self) -> TaskMode {
        TaskMode::CPU_GENERATOR
    }

    fn requisition(&mut self, _inputs: &[Buffer]) -> Result<Requisition> {
        if let Some((requisition, _)) = self.frames.front() {
            self.last = requisition.clone();
        }
        Ok(self.last.clone())
    }

    fn process(
        &mut self,
        _env: &TaskEnv,
        _inputs: &mut [Buffer],
        output: Option<&mut Buffer>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let Some((_, data)) = self.frames.pop_front() else {
            return Ok(false);
        };
        if let Some(output) = output {
            output.host_view()?.copy_from_slice(&data);
        }
        Ok(true)
    }
}

/// Options of a `RawSource`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSourceConfig {
    /// Directory holding the frames
    pub path: PathBuf,
    /// File extension of frames, without the dot
    pub suffix: String,
    pub width: usize,
    pub height: usize,
    /// 8, 16 or 32
    pub bits_per_sample: u16,
    /// Maximum number of files, -1 for all
    pub count: i64,
    /// 1-based index of the first file, -1 for the first one
    pub nth: i64,
    /// Scale 8/16-bit samples to [0.0, 1.0]
    pub normalize: bool,
}

impl Default for RawSourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            suffix: "raw".to_string(),
            width: 0,
            height: 0,
            bits_per_sample: 32,
            count: -1,
            nth: -1,
            normalize: false,
        }
    }
}

impl RawSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::Config(format!(
                "raw frame geometry {}x{} is empty",
                self.width, self.height
            )));
        }
        if SampleDepth::from_bits(self.bits_per_sample).is_none() {
            return Err(EngineError::UnsupportedDepth(self.bits_per_sample));
        }
        if self.count < -1 {
            return Err(EngineError::Config(format!("invalid count {}", self.count)));
        }
        if self.nth != -1 && self.nth < 1 {
            return Err(EngineError::Config(format!("invalid nth {}", self.nth)));
        }
        Ok(())
    }

    fn depth(&self) -> SampleDepth {
        SampleDepth::from_bits(self.bits_per_sample).unwrap_or(SampleDepth::F32)
    }

    /// Bytes in one frame file
    pub fn frame_bytes(&self) -> usize {
        self.width * self.height * self.depth().bytes()
    }
}

/// Reads one frame per raw file, sorted by file name
pub struct RawSource {
    config: RawSourceConfig,
    files: VecDeque<PathBuf>,
}

impl RawSource {
    pub fn new(config: RawSourceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            files: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &RawSourceConfig {
        &self.config
    }

    /// Files selected by the nth/count window
    fn select_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.config.path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext == self.config.suffix.as_str())
                        .unwrap_or(false)
            })
            .collect();
        files.sort();

        let start = if self.config.nth < 0 {
            0
        } else {
            (self.config.nth - 1) as usize
        };
        let end = if self.config.count < 0 {
            files.len()
        } else {
            (start + self.config.count as usize).min(files.len())
        };

        if start >= files.len() {
            return Ok(Vec::new());
        }
        Ok(files.drain(start..end).collect())
    }
}

impl Task for RawSource {
    fn name(&self) -> &str {
        "raw-source"
    }

    fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
        let files = self.select_files().map_err(|e| EngineError::setup("raw-source", e))?;
        log::info!(
            "Raw source: {} file(s) in {}",
            files.len(),
            self.config.path.display()
        );
        self.files = files.into();
        Ok(())
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn mode(&self) -> TaskMode {
        TaskMode::CPU_GENERATOR
    }

    fn requisition(&mut self, _inputs: &[Buffer]) -> Result<Requisition> {
        Ok(Requisition::new(&[self.config.width, self.config.height]))
    }

    fn process(
        &mut self,
        _env: &TaskEnv,
        _inputs: &mut [Buffer],
        output: Option<&mut Buffer>,
        requisition: &Requisition,
    ) -> Result<bool> {
        let Some(path) = self.files.pop_front() else {
            return Ok(false);
        };

        let bytes = std::fs::read(&path)?;
        let expected = self.config.frame_bytes();
        if bytes.len() != expected {
            log::warn!(
                "{} has {} bytes, expected {}; stopping",
                path.display(),
                bytes.len(),
                expected
            );
            return Ok(false);
        }
        log::debug!("Reading {}", path.display());

        let output = expect_output(self.name(), output)?;
        output.set_host_bytes(&bytes, self.config.depth())?;
        output.reinterpret(
            self.config.bits_per_sample,
            requisition.num_elements(),
            self.config.normalize,
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frames(dir: &std::path::Path, n: usize, bytes: usize) {
        for i in 0..n {
            std::fs::write(dir.join(format!("frame-{i:03}.raw")), vec![i as u8; bytes]).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
    }

    fn config(dir: &std::path::Path) -> RawSourceConfig {
        RawSourceConfig {
            path: dir.to_path_buf(),
            width: 2,
            height: 2,
            bits_per_sample: 8,
            ..RawSourceConfig::default()
        }
    }

    #[test]
    fn validates_options() {
        let base = RawSourceConfig {
            width: 4,
            height: 4,
            ..RawSourceConfig::default()
        };
        assert!(base.validate().is_ok());
        assert!(RawSourceConfig { width: 0, ..base.clone() }.validate().is_err());
        assert!(RawSourceConfig { bits_per_sample: 12, ..base.clone() }.validate().is_err());
        assert!(RawSourceConfig { count: -2, ..base.clone() }.validate().is_err());
        assert!(RawSourceConfig { nth: 0, ..base.clone() }.validate().is_err());
        assert_eq!(RawSourceConfig { bits_per_sample: 16, ..base }.frame_bytes(), 32);
    }

    #[test]
    fn selects_all_files_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 4, 4);
        let source = RawSource::new(config(dir.path())).unwrap();
        let files = source.select_files().unwrap();
        assert_eq!(files.len(), 4);
        assert!(files[0].ends_with("frame-000.raw"));
    }

    #[test]
    fn nth_and_count_window_the_files() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 5, 4);
        let source = RawSource::new(RawSourceConfig {
            nth: 2,
            count: 2,
            ..config(dir.path())
        })
        .unwrap();
        let files = source.select_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("frame-001.raw"));
        assert!(files[1].ends_with("frame-002.raw"));

        let past_end = RawSource::new(RawSourceConfig {
            nth: 9,
            ..config(dir.path())
        })
        .unwrap();
        assert!(past_end.select_files().unwrap().is_empty());
    }

    #[test]
    fn memory_source_rejects_mismatched_frames() {
        let resources = std::sync::Arc::new(crate::resources::ResourceManager::host_only(
            crate::config::EngineConfig::default(),
        ));
        let env = TaskEnv::new(
            resources.clone(),
            resources.cpu_node().clone(),
            crate::profiler::Profiler::default(),
        );
        let mut source = MemorySource::new(&Requisition::new(&[2]), vec![vec![1.0; 3]]);
        assert!(matches!(
            source.setup(&env),
            Err(EngineError::SetupFailed { .. })
        ));
    }
}
