//! The compute runtime seam.
//!
//! Everything the kernel subsystem needs from a native compute API goes
//! through [`ComputeBackend`]: platform and device enumeration, context and
//! queue creation, program compile, kernel-object creation, buffer
//! allocation, argument binding, enqueue/transfer/finish, and release.
//! Status codes follow OpenCL numbering so backends can share them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{KilnError, Result};

// ---------------------------------------------------------------------------
// Shared status codes
// ---------------------------------------------------------------------------

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_DEVICE_NOT_FOUND: i32 = -1;
pub const STATUS_OUT_OF_RESOURCES: i32 = -5;
pub const STATUS_BUILD_PROGRAM_FAILURE: i32 = -11;
pub const STATUS_INVALID_VALUE: i32 = -30;
pub const STATUS_INVALID_DEVICE: i32 = -33;
pub const STATUS_INVALID_CONTEXT: i32 = -34;
pub const STATUS_INVALID_COMMAND_QUEUE: i32 = -36;
pub const STATUS_INVALID_MEM_OBJECT: i32 = -38;
pub const STATUS_INVALID_PROGRAM: i32 = -44;
pub const STATUS_INVALID_PROGRAM_EXECUTABLE: i32 = -45;
pub const STATUS_INVALID_KERNEL_NAME: i32 = -46;
pub const STATUS_INVALID_KERNEL: i32 = -48;

/// Device class requested at platform initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Gpu,
    Cpu,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceClass::Gpu),
            "cpu" => Ok(DeviceClass::Cpu),
            other => Err(KilnError::Config(format!("unknown device class '{other}'"))),
        }
    }
}

/// Informational device metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub driver_version: String,
    pub little_endian: bool,
    pub global_memory: u64,
}

/// Host-visible access mode of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    ReadWrite,
    WriteOnly,
    ReadOnly,
}

/// Global and local work-item counts for a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSize {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl Default for WorkSize {
    fn default() -> Self {
        Self {
            global: [32, 1, 1],
            local: [32, 1, 1],
        }
    }
}

impl WorkSize {
    /// Number of dimensions actually in use (trailing 1s are dropped).
    pub fn dimensions(&self) -> u32 {
        if self.global[2] > 1 || self.local[2] > 1 {
            3
        } else if self.global[1] > 1 || self.local[1] > 1 {
            2
        } else {
            1
        }
    }
}

/// A native compute runtime.
///
/// Implementations are cheap handles onto shared runtime state: cloning a
/// backend must yield a handle onto the same runtime.
pub trait ComputeBackend: Clone {
    type Platform: Copy + fmt::Debug;
    type Device: Copy + fmt::Debug;
    type Context;
    type Queue;
    type Program;
    type Kernel;
    type Memory: Copy + fmt::Debug + PartialEq;

    fn platforms(&self) -> Result<Vec<Self::Platform>>;
    fn devices(&self, platform: Self::Platform, class: DeviceClass) -> Result<Vec<Self::Device>>;
    fn device_info(&self, device: Self::Device) -> DeviceInfo;

    fn create_context(&self, device: Self::Device) -> Result<Self::Context>;
    /// Create a queue allowing out-of-order execution of independent work.
    fn create_queue(&self, context: &Self::Context, device: Self::Device) -> Result<Self::Queue>;

    fn create_program(&self, context: &Self::Context, source: &str) -> Result<Self::Program>;
    fn compile_program(&self, program: &Self::Program, device: Self::Device, options: &str) -> Result<()>;
    fn build_log(&self, program: &Self::Program, device: Self::Device) -> Result<String>;

    /// Fails with [`STATUS_INVALID_KERNEL_NAME`] when the program has no such entry point.
    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> Result<Self::Kernel>;

    fn create_buffer(&self, context: &Self::Context, access: MemAccess, size: usize) -> Result<Self::Memory>;

    fn set_arg_memory(&self, kernel: &Self::Kernel, slot: u32, memory: Self::Memory) -> Result<()>;
    fn set_arg_bytes(&self, kernel: &Self::Kernel, slot: u32, bytes: &[u8]) -> Result<()>;

    /// Blocking host to device copy at offset zero.
    fn write_buffer(&self, queue: &Self::Queue, memory: Self::Memory, data: &[u8]) -> Result<()>;
    /// Blocking device to host copy at offset zero.
    fn read_buffer(&self, queue: &Self::Queue, memory: Self::Memory, out: &mut [u8]) -> Result<()>;
    fn enqueue_kernel(&self, queue: &Self::Queue, kernel: &Self::Kernel, work: &WorkSize) -> Result<()>;
    fn flush(&self, queue: &Self::Queue) -> Result<()>;
    fn finish(&self, queue: &Self::Queue) -> Result<()>;

    fn release_memory(&self, memory: Self::Memory) -> Result<()>;
    fn release_kernel(&self, kernel: Self::Kernel) -> Result<()>;
    fn release_program(&self, program: Self::Program) -> Result<()>;
    fn release_queue(&self, queue: Self::Queue) -> Result<()>;
    fn release_context(&self, context: Self::Context) -> Result<()>;
}

/// Turn a native status code into a `Result`.
pub fn check_status(code: i32, call: &str) -> Result<()> {
    if code == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(KilnError::native(call, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_class_parse() {
        assert_eq!("GPU".parse::<DeviceClass>().unwrap(), DeviceClass::Gpu);
        assert_eq!("cpu".parse::<DeviceClass>().unwrap(), DeviceClass::Cpu);
        assert!("fpga".parse::<DeviceClass>().is_err());
        assert_eq!(DeviceClass::default(), DeviceClass::Gpu);
    }

    #[test]
    fn test_work_size_dimensions() {
        assert_eq!(WorkSize::default().dimensions(), 1);
        let two = WorkSize { global: [64, 4, 1], local: [32, 1, 1] };
        assert_eq!(two.dimensions(), 2);
        let three = WorkSize { global: [8, 8, 8], local: [2, 2, 2] };
        assert_eq!(three.dimensions(), 3);
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(STATUS_SUCCESS, "clFinish").is_ok());
        let err = check_status(STATUS_INVALID_COMMAND_QUEUE, "clFinish").unwrap_err();
        assert_eq!(err.status(), Some(STATUS_INVALID_COMMAND_QUEUE));
    }
}
