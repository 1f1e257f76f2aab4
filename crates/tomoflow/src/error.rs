/// Engine error taxonomy
///
/// Every failure the engine can observe maps onto one of these variants.
/// None of them is recoverable locally: the executor only guarantees that
/// finish still propagates so no other task waits forever.

use crate::types::Requisition;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A task could not resolve the kernels or resources it needs.
    #[error("setup of task `{task}` failed: {reason}")]
    SetupFailed { task: String, reason: String },

    /// Requisition negotiation failed (wiring or configuration bug).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A channel pool was asked to change shape after allocation.
    #[error("channel pool already allocated for {existing}, refusing {requested}")]
    AlreadyAllocated {
        existing: Requisition,
        requested: Requisition,
    },

    /// Compute context, queue or device memory failure.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A kernel module could not be resolved or compiled.
    #[error("failed to compile kernel `{entry}` from `{module}`: {reason}")]
    CompileFailed {
        module: String,
        entry: String,
        reason: String,
    },

    /// A task's compute step failed at runtime.
    #[error("task `{task}` failed while processing: {reason}")]
    ProcessFailed { task: String, reason: String },

    #[error("unsupported sample depth: {0} bits")]
    UnsupportedDepth(u16),

    #[error("buffer holds {stored}-bit samples, cannot reinterpret as {requested}-bit")]
    DepthMismatch { stored: u16, requested: u16 },

    /// Invalid graph wiring handed to the executor.
    #[error("invalid wiring: {0}")]
    Wiring(String),

    /// Aggregate result of a run in which at least one task failed.
    #[error("{failed} task(s) failed, first error: {first}")]
    PipelineFailed { failed: usize, first: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn process(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProcessFailed {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    pub fn setup(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::SetupFailed {
            task: task.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
