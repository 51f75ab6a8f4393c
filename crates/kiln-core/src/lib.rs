//! # kiln-core
//!
//! Kernel registry and build orchestration for GPU-resident cryptographic kernels.
//!
//! Provides:
//! - Device and queue selection behind the `ComputeBackend` trait
//! - A registry of named kernels with typed, ordered arguments
//! - Cross-kernel borrowed buffers, validated at registration
//! - Lazy, idempotent builds that recurse into owner kernels
//! - Big-endian byte-slot encoding of the message index
//! - An in-process emulated backend (`HostBackend`) for tests
//! - OpenCL loaded at run time (behind `opencl` feature flag)

pub mod backend;
pub mod binding;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod gpu;
pub mod host;
pub mod kernel;
pub mod registry;
pub mod source;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use backend::{ComputeBackend, DeviceClass, DeviceInfo, MemAccess, WorkSize};
pub use buffer::{BufferKind, BufferObject, BufferRef};
pub use config::GpuConfig;
pub use context::DeviceContext;
pub use descriptor::KernelDescriptor;
pub use error::{CatalogError, KilnError};
pub use gpu::{Gpu, KernelHandle, ScratchBuffers};
pub use host::HostBackend;
pub use kernel::{BuildState, Kernel};
pub use registry::{KernelId, Registry};
pub use source::{DirectorySources, InMemorySources, SourceRepository};

pub type Result<T> = std::result::Result<T, KilnError>;
