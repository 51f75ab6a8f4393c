//! Integration tests against the system OpenCL runtime.
//! Run with: cargo test -p kiln-core --features opencl -- --nocapture
//!
//! Each test returns early when no OpenCL platform is present.

#![cfg(feature = "opencl")]

use kiln_core::buffer::BufferKind::{MessageIndex, Owned};
use kiln_core::opencl::{is_opencl_available, OpenClBackend};
use kiln_core::{DeviceClass, Gpu, GpuConfig, InMemorySources, KernelDescriptor, KilnError};

const COPY_SOURCE: &str = r#"
__kernel void copyIndexed(__global uchar* out, __global const uchar* in,
                          uchar i0, uchar i1, uchar i2, uchar i3) {
    uint index = ((uint)i0 << 24) | ((uint)i1 << 16) | ((uint)i2 << 8) | (uint)i3;
    size_t gid = get_global_id(0);
    out[gid] = in[gid] + (uchar)index;
}
"#;

fn copy_indexed() -> KernelDescriptor {
    KernelDescriptor::new("copyIndexed")
        .outputs(&["out"], &[Owned])
        .inputs(&["in", "messageIndex"], &[Owned, MessageIndex])
}

fn config() -> GpuConfig {
    GpuConfig {
        default_buffer_size: 256,
        signature_buffer_size: 256,
        ..Default::default()
    }
}

/// Any device: GPU first, then CPU.
fn open_gpu(sources: InMemorySources, catalog: Vec<KernelDescriptor>) -> Option<Gpu<OpenClBackend>> {
    if !is_opencl_available() {
        eprintln!("OpenCL not available, skipping");
        return None;
    }
    let backend = OpenClBackend::load().ok()?;
    for class in [DeviceClass::Gpu, DeviceClass::Cpu] {
        let config = GpuConfig { device_class: class, ..config() };
        let mut gpu = Gpu::with_sources(backend, config, sources.clone()).with_catalog(catalog.clone());
        if gpu.initialize_platform().is_ok() {
            return Some(gpu);
        }
    }
    eprintln!("no OpenCL device, skipping");
    None
}

#[test]
fn test_opencl_device_id() {
    let Some(mut gpu) = open_gpu(InMemorySources::new(), Vec::new()) else {
        return;
    };
    let id = gpu.id().unwrap();
    assert!(id.starts_with("Graphics PU, ") || id.starts_with("OpenCL CPU, "));
    gpu.finish().unwrap();
    gpu.shutdown();
}

#[test]
fn test_opencl_message_index_reaches_kernel() {
    let sources = InMemorySources::new().with("copyIndexed", COPY_SOURCE);
    let Some(mut gpu) = open_gpu(sources, vec![copy_indexed()]) else {
        return;
    };

    let mut kernel = gpu.kernel("copyIndexed");
    kernel.write_to_buffer(1, &[10u8; 32]).unwrap();
    kernel.write_message_index(0x0000_0005).unwrap();
    kernel.enqueue().unwrap();
    gpu.finish().unwrap();

    let out = gpu.kernel("copyIndexed").read_from_buffer(0, 32).unwrap();
    assert_eq!(out, vec![15u8; 32]);
}

#[test]
fn test_opencl_compile_error_log() {
    let sources = InMemorySources::new().with("copyIndexed", "__kernel void copyIndexed( { syntax error");
    let Some(mut gpu) = open_gpu(sources, vec![copy_indexed()]) else {
        return;
    };
    match gpu.kernel("copyIndexed").build() {
        Err(KilnError::Compile { log, .. }) => assert!(!log.is_empty()),
        other => panic!("expected Compile, got {:?}", other.err()),
    }
}
