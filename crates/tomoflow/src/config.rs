/// Engine configuration
///
/// Loaded from a TOML file; every field has a default so an empty file is
/// a valid configuration.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which devices the resource manager should open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use GPUs when present, emulate otherwise
    #[default]
    Auto,
    Gpu,
    /// Never touch the GPU stack
    Cpu,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffers per output channel
    pub pool_size: usize,
    pub device: DevicePreference,
    /// Fail instead of falling back to host emulation
    pub require_gpu: bool,
    /// Record per-kernel timings
    pub profiling: bool,
    /// Directories searched for kernel modules
    pub kernel_paths: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            device: DevicePreference::Auto,
            require_gpu: false,
            profiling: false,
            kernel_paths: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be at least 1".into()));
        }
        if self.require_gpu && self.device == DevicePreference::Cpu {
            return Err(EngineError::Config(
                "require_gpu cannot be combined with device = \"cpu\"".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(!config.profiling);
    }

    #[test]
    fn parses_all_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
pool_size = 2
device = "cpu"
profiling = true
kernel_paths = ["/opt/kernels", "kernels"]
"#,
        )
        .unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.device, DevicePreference::Cpu);
        assert!(config.profiling);
        assert_eq!(config.kernel_paths.len(), 2);
    }

    #[test]
    fn rejects_zero_pool() {
        assert!(matches!(
            EngineConfig::from_toml_str("pool_size = 0"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn rejects_unknown_device() {
        assert!(matches!(
            EngineConfig::from_toml_str("device = \"tpu\""),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool_size = 8").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.pool_size, 8);
    }
}
