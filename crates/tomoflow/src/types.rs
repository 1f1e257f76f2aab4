/// Core types for the tomoflow engine
///
/// This module defines the small value types that flow between tasks,
/// channels and the executor.

use std::fmt;

/// Maximum rank a requisition may carry
pub const MAX_DIMENSIONS: usize = 3;

/// The negotiated shape of one buffer snapshot
///
/// Two requisitions are compatible only if they are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Requisition {
    dims: Vec<usize>,
}

impl Requisition {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    /// Rank (number of dimensions)
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of native elements described by this shape
    pub fn num_elements(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().product()
        }
    }

    /// Size in bytes of the native `f32` representation
    pub fn size_bytes(&self) -> usize {
        self.num_elements() * std::mem::size_of::<f32>()
    }

    /// Global work size padded to three dimensions (unused dims are 1)
    pub fn global_size(&self) -> [u32; 3] {
        let mut size = [1u32; 3];
        for (slot, dim) in size.iter_mut().zip(self.dims.iter()) {
            *slot = *dim as u32;
        }
        size
    }
}

impl fmt::Display for Requisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Sample depth of the data currently held in a buffer's host array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDepth {
    U8,
    U16,
    /// Native element type
    F32,
}

impl SampleDepth {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::U8),
            16 => Some(Self::U16),
            32 => Some(Self::F32),
            _ => None,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::U16 => 16,
            Self::F32 => 32,
        }
    }

    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Largest representable value, used for normalization
    pub fn max_value(self) -> f32 {
        match self {
            Self::U8 => u8::MAX as f32,
            Self::U16 => u16::MAX as f32,
            Self::F32 => 1.0,
        }
    }
}

/// Whether a task transforms inputs or generates data on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Processor,
    /// Zero inputs; runs until it reports exhaustion
    Generator,
}

/// Where a task wants to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    Gpu,
}

/// Execution placement requirements of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMode {
    pub kind: TaskKind,
    pub placement: Placement,
}

impl TaskMode {
    pub const CPU_PROCESSOR: Self = Self::new(TaskKind::Processor, Placement::Cpu);
    pub const GPU_PROCESSOR: Self = Self::new(TaskKind::Processor, Placement::Gpu);
    pub const CPU_GENERATOR: Self = Self::new(TaskKind::Generator, Placement::Cpu);
    pub const GPU_GENERATOR: Self = Self::new(TaskKind::Generator, Placement::Gpu);

    pub const fn new(kind: TaskKind, placement: Placement) -> Self {
        Self { kind, placement }
    }

    pub fn is_generator(&self) -> bool {
        self.kind == TaskKind::Generator
    }

    pub fn wants_gpu(&self) -> bool {
        self.placement == Placement::Gpu
    }
}

/// Life cycle of a task instance inside the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    SetUp,
    Running,
    Draining,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requisition_sizes() {
        let req = Requisition::new(&[4, 3]);
        assert_eq!(req.rank(), 2);
        assert_eq!(req.num_elements(), 12);
        assert_eq!(req.size_bytes(), 48);
        assert_eq!(req.global_size(), [4, 3, 1]);
        assert_eq!(req.to_string(), "[4x3]");
    }

    #[test]
    fn empty_requisition_has_no_elements() {
        assert_eq!(Requisition::default().num_elements(), 0);
    }

    #[test]
    fn requisitions_compare_by_value() {
        assert_eq!(Requisition::new(&[4, 4]), Requisition::new(&[4, 4]));
        assert_ne!(Requisition::new(&[4, 4]), Requisition::new(&[16]));
    }

    #[test]
    fn sample_depth_bits() {
        assert_eq!(SampleDepth::from_bits(8), Some(SampleDepth::U8));
        assert_eq!(SampleDepth::from_bits(12), None);
        assert_eq!(SampleDepth::U16.bytes(), 2);
        assert_eq!(SampleDepth::U8.max_value(), 255.0);
    }

    #[test]
    fn task_mode_flags() {
        assert!(TaskMode::CPU_GENERATOR.is_generator());
        assert!(!TaskMode::CPU_GENERATOR.wants_gpu());
        assert!(TaskMode::GPU_PROCESSOR.wants_gpu());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Draining.is_terminal());
    }
}
