//! OpenCL backend.
//!
//! Loads the system ICD loader (`libOpenCL.so.1` and friends) with
//! `libloading` at run time, so no OpenCL SDK is needed to build.
//!
//! Provides:
//! - Runtime OpenCL detection
//! - `OpenClBackend`, a [`ComputeBackend`](crate::ComputeBackend) over the loaded API

pub mod ffi;
pub mod backend;

pub use backend::OpenClBackend;

use crate::backend::ComputeBackend;

/// Check if OpenCL is available (ICD loader loadable + at least 1 platform).
pub fn is_opencl_available() -> bool {
    match OpenClBackend::load() {
        Ok(backend) => backend.platforms().map(|p| !p.is_empty()).unwrap_or(false),
        Err(_) => false,
    }
}
