//! Argument binding and transfer encoding.
//!
//! Slot layout for a kernel with `O` outputs and `I` inputs: outputs take
//! slots `0..O`, inputs take `O..O+I`, each in declaration order. A message
//! index is always the last input and is written as four single-byte slots
//! starting at its own slot `O+I-1`, most significant byte first. Byte-wise
//! binding keeps the value identical on little- and big-endian devices.

use tracing::error;

use crate::backend::ComputeBackend;
use crate::buffer::{BufferKind, BufferObject, ResolvedBuffer};
use crate::{KilnError, Result};

/// Number of single-byte slots a message index occupies.
pub const MESSAGE_INDEX_SLOTS: u32 = 4;

/// The bytes written to the message-index slots, in slot order.
#[inline]
pub fn message_index_bytes(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// First slot of the message index of a kernel with this many arguments.
#[inline]
pub fn message_index_slot(num_outputs: usize, num_inputs: usize) -> u32 {
    debug_assert!(num_inputs > 0, "a message index is always an input");
    (num_outputs + num_inputs - 1) as u32
}

/// Serialize 32-bit values big-endian, four bytes each.
pub fn u32s_to_be_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Bind every output, then every input, of a freshly allocated kernel.
///
/// Each borrowed buffer consumes the next entry of `external`, in declaration
/// order.
pub(crate) fn bind_arguments<B: ComputeBackend>(
    backend: &B,
    kernel: &B::Kernel,
    kernel_name: &str,
    outputs: &mut [BufferObject<B::Memory>],
    inputs: &mut [BufferObject<B::Memory>],
    external: &[ResolvedBuffer<B::Memory>],
) -> Result<()> {
    let mut next_external = 0;
    let num_outputs = outputs.len();
    bind_group(backend, kernel, kernel_name, outputs, 0, external, &mut next_external)?;
    bind_group(backend, kernel, kernel_name, inputs, num_outputs, external, &mut next_external)?;
    if next_external < external.len() {
        tracing::warn!(
            "kernel {} declares {} external buffers but binds only {}",
            kernel_name,
            external.len(),
            next_external
        );
    }
    Ok(())
}

fn bind_group<B: ComputeBackend>(
    backend: &B,
    kernel: &B::Kernel,
    kernel_name: &str,
    args: &mut [BufferObject<B::Memory>],
    offset: usize,
    external: &[ResolvedBuffer<B::Memory>],
    next_external: &mut usize,
) -> Result<()> {
    for (i, buffer) in args.iter_mut().enumerate() {
        let slot = (offset + i) as u32;
        let result = match buffer.kind() {
            BufferKind::Owned => match buffer.memory() {
                Some(memory) => backend.set_arg_memory(kernel, slot, memory),
                None => Err(KilnError::NotDeviceMemory {
                    kernel: kernel_name.to_string(),
                    buffer: buffer.name().to_string(),
                }),
            },
            BufferKind::Borrowed => {
                let Some(resolved) = external.get(*next_external) else {
                    error!(
                        "argument {} of kernel {} is borrowed but all {} external buffers are already bound",
                        buffer.name(),
                        kernel_name,
                        external.len()
                    );
                    return Err(KilnError::ExternalBufferOverflow {
                        kernel: kernel_name.to_string(),
                        declared: external.len(),
                    });
                };
                *next_external += 1;
                buffer.resolve(resolved.origin.clone(), resolved.size);
                backend.set_arg_memory(kernel, slot, resolved.memory)
            }
            BufferKind::MessageIndex => {
                let value = buffer.message_index_value().unwrap_or(0);
                set_message_index(backend, kernel, slot, value)
            }
        };
        if let Err(e) = result {
            error!("failed to set argument {} of kernel {}: {}", buffer.name(), kernel_name, e);
            return Err(e);
        }
    }
    Ok(())
}

/// Write `value` into the four single-byte slots starting at `first_slot`.
///
/// All four slots are attempted; the first failure is returned.
pub(crate) fn set_message_index<B: ComputeBackend>(
    backend: &B,
    kernel: &B::Kernel,
    first_slot: u32,
    value: u32,
) -> Result<()> {
    let mut first_error = None;
    for (k, byte) in message_index_bytes(value).iter().enumerate() {
        if let Err(e) = backend.set_arg_bytes(kernel, first_slot + k as u32, std::slice::from_ref(byte)) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceClass, MemAccess};
    use crate::buffer::BufferRef;
    use crate::host::{HostArg, HostBackend};
    use crate::registry::KernelId;

    const SOURCE: &str = "__kernel void k(__global uchar* out, __global uchar* ctx, uint idx) {}";

    fn setup(backend: &HostBackend) -> (<HostBackend as ComputeBackend>::Context, <HostBackend as ComputeBackend>::Kernel) {
        let platform = backend.platforms().unwrap()[0];
        let device = backend.devices(platform, DeviceClass::Gpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        let program = backend.create_program(&context, SOURCE).unwrap();
        backend.compile_program(&program, device, "").unwrap();
        let kernel = backend.create_kernel(&program, "k").unwrap();
        (context, kernel)
    }

    #[test]
    fn test_message_index_bytes_big_endian() {
        assert_eq!(message_index_bytes(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(message_index_bytes(1), [0, 0, 0, 1]);
        assert_eq!(message_index_slot(1, 4), 4);
    }

    #[test]
    fn test_u32s_to_be_bytes() {
        assert_eq!(
            u32s_to_be_bytes(&[1, 2, 3]),
            vec![0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
        assert!(u32s_to_be_bytes(&[]).is_empty());
    }

    #[test]
    fn test_bind_arguments_slot_order() {
        let backend = HostBackend::new();
        let (context, kernel) = setup(&backend);
        let out = backend.create_buffer(&context, MemAccess::WriteOnly, 8).unwrap();
        let owner_mem = backend.create_buffer(&context, MemAccess::WriteOnly, 8).unwrap();

        let mut outputs = vec![BufferObject::owned("out", out, 8)];
        let mut inputs = vec![BufferObject::borrowed("ctx"), BufferObject::message_index("idx")];
        inputs[1].set_index_value(0xAABB_CCDD);
        let external = vec![ResolvedBuffer {
            origin: BufferRef { kernel: KernelId::new(0), argument: "ctx".into() },
            memory: owner_mem,
            size: 8,
        }];

        bind_arguments(&backend, &kernel, "k", &mut outputs, &mut inputs, &external).unwrap();

        assert_eq!(backend.arg(kernel, 0), Some(HostArg::Memory(out)));
        assert_eq!(backend.arg(kernel, 1), Some(HostArg::Memory(owner_mem)));
        assert_eq!(backend.arg(kernel, 2), Some(HostArg::Bytes(vec![0xAA])));
        assert_eq!(backend.arg(kernel, 3), Some(HostArg::Bytes(vec![0xBB])));
        assert_eq!(backend.arg(kernel, 4), Some(HostArg::Bytes(vec![0xCC])));
        assert_eq!(backend.arg(kernel, 5), Some(HostArg::Bytes(vec![0xDD])));
        assert_eq!(inputs[0].origin().map(|o| o.argument.as_str()), Some("ctx"));
    }

    #[test]
    fn test_bind_arguments_external_overflow() {
        let backend = HostBackend::new();
        let (context, kernel) = setup(&backend);
        let mut outputs = Vec::new();
        let mut inputs = vec![BufferObject::borrowed("a"), BufferObject::borrowed("b")];
        let external = vec![ResolvedBuffer {
            origin: BufferRef { kernel: KernelId::new(0), argument: "a".into() },
            memory: backend.create_buffer(&context, MemAccess::ReadWrite, 4).unwrap(),
            size: 4,
        }];

        let err = bind_arguments(&backend, &kernel, "k", &mut outputs, &mut inputs, &external).unwrap_err();
        assert!(matches!(err, KilnError::ExternalBufferOverflow { declared: 1, .. }));
    }
}
