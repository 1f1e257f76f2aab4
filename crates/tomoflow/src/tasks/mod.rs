/// Stock tasks

pub mod attenuation;
pub mod kernel;
pub mod sink;
pub mod source;

pub use attenuation::Attenuation;
pub use kernel::KernelTask;
pub use sink::{CollectHandle, CollectSink, Frame, RawWriter};
pub use source::{MemorySource, RawSource, RawSourceConfig};
