//! The fixed catalog of hashing and secp256k1 kernels.
//!
//! Order matters: a kernel that borrows a buffer is listed after the kernel
//! owning it.

use crate::buffer::BufferKind::{Borrowed, MessageIndex, Owned};
use crate::descriptor::KernelDescriptor;

pub const SHA256: &str = "sha256GPU";
pub const SHA256_TWICE_FETCH_BEST: &str = "sha256_twice_GPU_fetch_best";
pub const INITIALIZE_MULTIPLICATION_CONTEXT: &str = "secp256k1_opencl_compute_multiplication_context";
pub const INITIALIZE_GENERATOR_CONTEXT: &str = "secp256k1_opencl_compute_generator_context";
pub const VERIFY_SIGNATURE: &str = "secp256k1_opencl_verify_signature";
pub const GENERATE_PUBLIC_KEY: &str = "secp256k1_opencl_generate_public_key";
pub const SIGN: &str = "secp256k1_opencl_sign";
pub const TEST_BUFFER: &str = "testBuffer";
pub const TEST_SUITE_1_BASIC_OPERATIONS: &str = "test_suite_1_basic_operations";

/// Every kernel the host program knows about, in registration order.
pub fn standard_catalog() -> Vec<KernelDescriptor> {
    vec![
        KernelDescriptor::new(SHA256)
            .outputs(&["result"], &[Owned])
            .inputs(
                &["offsets", "lengths", "message", "messageIndex"],
                &[Owned, Owned, Owned, MessageIndex],
            ),
        KernelDescriptor::new(SHA256_TWICE_FETCH_BEST)
            .outputs(&["result"], &[Owned])
            .inputs(&["message", "messageIndex"], &[Owned, MessageIndex]),
        KernelDescriptor::new(INITIALIZE_MULTIPLICATION_CONTEXT)
            .outputs(&["outputMultiplicationContext"], &[Owned]),
        KernelDescriptor::new(INITIALIZE_GENERATOR_CONTEXT)
            .outputs(&["outputGeneratorContext"], &[Owned]),
        KernelDescriptor::new(VERIFY_SIGNATURE)
            .outputs(&["output", "outputMemoryPoolSignature"], &[Owned, Owned])
            .inputs(
                &[
                    "inputSignature",
                    "signatureSize",
                    "publicKey",
                    "publicKeySize",
                    "message",
                    "memoryPoolMultiplicationContext",
                    "messageIndex",
                ],
                &[Owned, Owned, Owned, Owned, Owned, Borrowed, MessageIndex],
            )
            .borrows("outputMultiplicationContext", INITIALIZE_MULTIPLICATION_CONTEXT),
        KernelDescriptor::new(GENERATE_PUBLIC_KEY)
            .outputs(&["outputPublicKey", "outputPublicKeySize"], &[Owned, Owned])
            .inputs(
                &["inputSecretKey", "inputMemoryPoolGeneratorContext", "inputMessageIndex"],
                &[Owned, Borrowed, MessageIndex],
            )
            .borrows("outputGeneratorContext", INITIALIZE_GENERATOR_CONTEXT),
        KernelDescriptor::new(SIGN)
            .outputs(&["outputSignature", "outputSize", "outputInputNonce"], &[Owned, Owned, Owned])
            .inputs(
                &["inputSecretKey", "inputMessage", "inputMemoryPoolGeneratorContext", "inputMessageIndex"],
                &[Owned, Owned, Borrowed, MessageIndex],
            )
            .borrows("outputGeneratorContext", INITIALIZE_GENERATOR_CONTEXT),
        KernelDescriptor::new(TEST_BUFFER)
            .outputs(&["buffer"], &[Owned])
            .inputs(&["offsets", "messageIndex"], &[Owned, MessageIndex]),
        KernelDescriptor::new(TEST_SUITE_1_BASIC_OPERATIONS)
            .outputs(&["outputMemoryPool"], &[Owned]),
    ]
}
