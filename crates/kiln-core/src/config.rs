//! Configuration for the device context and kernel buffers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::{DeviceClass, WorkSize};
use crate::{KilnError, Result};

pub const DEFAULT_BUFFER_SIZE: usize = 10_000_000;
pub const DEFAULT_SIGNATURE_BUFFER_SIZE: usize = 20_000_000;
pub const DEFAULT_SIGNATURE_BUFFER_NAME: &str = "outputMemoryPoolSignature";

/// Environment variable overriding [`GpuConfig::device_class`].
pub const ENV_DEVICE: &str = "KILN_DEVICE";
/// Environment variable overriding [`GpuConfig::kernel_dir`].
pub const ENV_KERNEL_DIR: &str = "KILN_KERNEL_DIR";

/// Configuration for a [`Gpu`](crate::Gpu) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Class of device selected at platform initialization.
    pub device_class: DeviceClass,

    /// Directory holding one `<kernel name>.cl` source per kernel.
    /// Also passed to the compiler as the include path.
    pub kernel_dir: PathBuf,

    /// Extra compiler flags, appended after the include path.
    pub build_options: Vec<String>,

    /// Size in bytes of every owned device buffer and its host staging region.
    pub default_buffer_size: usize,

    /// Name of the buffer that carries serialized signatures.
    pub signature_buffer_name: String,

    /// Device size in bytes of the signature buffer.
    pub signature_buffer_size: usize,

    /// Host scratch region for reading back the multiplication context.
    pub multiplication_context_size: usize,

    /// Host scratch region for reading back the generator context.
    pub generator_context_size: usize,

    /// Host scratch region for signature payloads.
    pub signature_scratch_size: usize,

    /// Host scratch region for `test_suite_1_basic_operations` results.
    pub test_suite_scratch_size: usize,

    /// Work size every kernel is launched with unless overridden.
    pub work_size: WorkSize,

    /// Log driver version, endianness and memory size at initialization.
    pub verbose: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Gpu,
            kernel_dir: PathBuf::from("opencl/cl"),
            build_options: Vec::new(),
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            signature_buffer_name: DEFAULT_SIGNATURE_BUFFER_NAME.into(),
            signature_buffer_size: DEFAULT_SIGNATURE_BUFFER_SIZE,
            multiplication_context_size: DEFAULT_BUFFER_SIZE,
            generator_context_size: DEFAULT_BUFFER_SIZE,
            signature_scratch_size: DEFAULT_SIGNATURE_BUFFER_SIZE,
            test_suite_scratch_size: DEFAULT_BUFFER_SIZE,
            work_size: WorkSize::default(),
            verbose: false,
        }
    }
}

impl GpuConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| KilnError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KILN_DEVICE` and `KILN_KERNEL_DIR` if they are set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(device) = std::env::var(ENV_DEVICE) {
            self.device_class = device.parse()?;
        }
        if let Ok(dir) = std::env::var(ENV_KERNEL_DIR) {
            self.kernel_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_buffer_size == 0 {
            return Err(KilnError::Config("default_buffer_size must be non-zero".into()));
        }
        if self.signature_buffer_size == 0 {
            return Err(KilnError::Config("signature_buffer_size must be non-zero".into()));
        }
        if self.work_size.local.iter().any(|&n| n == 0) || self.work_size.global.iter().any(|&n| n == 0) {
            return Err(KilnError::Config("work sizes must be non-zero in every dimension".into()));
        }
        Ok(())
    }

    /// Device allocation size for the owned buffer called `name`.
    pub fn buffer_size_for(&self, name: &str) -> usize {
        if name == self.signature_buffer_name {
            self.signature_buffer_size
        } else {
            self.default_buffer_size
        }
    }

    /// Compiler options for every kernel program.
    pub fn compile_options(&self) -> String {
        let mut options = format!("-I {}", self.kernel_dir.display());
        for extra in &self.build_options {
            options.push(' ');
            options.push_str(extra);
        }
        options
    }
}
