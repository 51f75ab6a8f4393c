//! The caller-facing manager: one device context and its kernel registry.
//!
//! Initialization runs in three idempotent stages: platform, no-build
//! registration of the catalog, then per-kernel builds on first use.

use tracing::{error, info};

use crate::backend::{ComputeBackend, DeviceInfo, WorkSize};
use crate::binding::u32s_to_be_bytes;
use crate::buffer::BufferObject;
use crate::catalog::standard_catalog;
use crate::config::GpuConfig;
use crate::context::DeviceContext;
use crate::descriptor::KernelDescriptor;
use crate::error::CatalogError;
use crate::kernel::{BuildState, Kernel};
use crate::registry::{KernelId, Registry};
use crate::source::{DirectorySources, SourceRepository};
use crate::{KilnError, Result};

/// Host-side scratch regions for results read back from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchBuffers {
    pub multiplication_context: Vec<u8>,
    pub generator_context: Vec<u8>,
    pub signature: Vec<u8>,
    pub test_suite: Vec<u8>,
}

impl ScratchBuffers {
    pub fn new(config: &GpuConfig) -> Self {
        Self {
            multiplication_context: vec![0; config.multiplication_context_size],
            generator_context: vec![0; config.generator_context_size],
            signature: vec![0; config.signature_scratch_size],
            test_suite: vec![0; config.test_suite_scratch_size],
        }
    }
}

/// Device context manager.
///
/// Owns the device context, the kernel registry and the host scratch
/// buffers. Everything is released by [`shutdown`](Self::shutdown) or on drop.
pub struct Gpu<B: ComputeBackend> {
    backend: B,
    config: GpuConfig,
    sources: Box<dyn SourceRepository>,
    catalog: Vec<KernelDescriptor>,
    context: Option<DeviceContext<B>>,
    registry: Registry<B>,
    registered: bool,
    scratch: Option<ScratchBuffers>,
}

impl<B: ComputeBackend> Gpu<B> {
    /// Standard catalog, sources read from `config.kernel_dir`.
    pub fn new(backend: B, config: GpuConfig) -> Self {
        let sources = DirectorySources::new(config.kernel_dir.clone());
        Self::with_sources(backend, config, sources)
    }

    pub fn with_sources(backend: B, config: GpuConfig, sources: impl SourceRepository + 'static) -> Self {
        Self {
            backend,
            config,
            sources: Box::new(sources),
            catalog: standard_catalog(),
            context: None,
            registry: Registry::new(),
            registered: false,
            scratch: None,
        }
    }

    /// Replace the kernel catalog. Takes effect at the next registration.
    pub fn with_catalog(mut self, catalog: Vec<KernelDescriptor>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Select the device and create its context and queue.
    ///
    /// No-op once it has succeeded. A failure leaves the manager
    /// uninitialized; the call can be retried.
    pub fn initialize_platform(&mut self) -> Result<()> {
        if self.context.is_some() {
            return Ok(());
        }
        let ctx = DeviceContext::initialize(self.backend.clone(), &self.config).map_err(|e| {
            error!("platform initialization failed: {}", e);
            e
        })?;
        info!("using device {}", ctx.id());
        self.scratch = Some(ScratchBuffers::new(&self.config));
        self.context = Some(ctx);
        Ok(())
    }

    /// Register every catalog kernel without building it.
    ///
    /// No-op once it has succeeded. On failure nothing stays registered.
    pub fn register_all_known_kernels_no_build(&mut self) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        self.initialize_platform()?;
        let Some(ctx) = self.context.as_ref() else {
            return Err(KilnError::NotInitialized);
        };
        for descriptor in self.catalog.iter().cloned() {
            let name = descriptor.name.clone();
            if let Err(e) = self.registry.register(ctx, &*self.sources, descriptor, self.config.work_size) {
                error!("failed to register kernel {}: {}", name, e);
                self.registry.release_all(ctx.backend());
                return Err(e);
            }
        }
        info!("{} kernels registered", self.registry.len());
        self.registered = true;
        Ok(())
    }

    /// Build every registered kernel.
    pub fn build_all_kernels(&mut self) -> Result<()> {
        self.register_all_known_kernels_no_build()?;
        let Some(ctx) = self.context.as_ref() else {
            return Err(KilnError::NotInitialized);
        };
        self.registry.build_all(ctx, &self.config)
    }

    /// Platform, registration and build of every kernel.
    pub fn initialize_all_full(&mut self) -> Result<()> {
        self.initialize_platform()?;
        self.register_all_known_kernels_no_build()?;
        self.build_all_kernels()
    }

    /// Kernel `name`, initializing the platform and registry if needed.
    ///
    /// # Panics
    /// If `name` is not in the catalog or initialization fails. Use
    /// [`try_kernel`](Self::try_kernel) to handle these as errors.
    pub fn kernel(&mut self, name: &str) -> KernelHandle<'_, B> {
        match self.try_kernel(name) {
            Ok(handle) => handle,
            Err(e) => programming_error(format!("kernel {name} is not available: {e}")),
        }
    }

    pub fn try_kernel(&mut self, name: &str) -> Result<KernelHandle<'_, B>> {
        self.register_all_known_kernels_no_build()?;
        let id = self
            .registry
            .id(name)
            .ok_or_else(|| CatalogError::UnknownKernel(name.to_string()))?;
        Ok(KernelHandle { gpu: self, id })
    }

    /// Block until all enqueued device work has completed.
    pub fn finish(&self) -> Result<()> {
        self.context.as_ref().ok_or(KilnError::NotInitialized)?.finish()
    }

    pub fn flush(&self) -> Result<()> {
        self.context.as_ref().ok_or(KilnError::NotInitialized)?.flush()
    }

    /// Human-readable description of the selected device.
    pub fn id(&self) -> Option<String> {
        self.context.as_ref().map(DeviceContext::id)
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.context.as_ref().map(DeviceContext::info)
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn context(&self) -> Option<&DeviceContext<B>> {
        self.context.as_ref()
    }

    pub fn registry(&self) -> &Registry<B> {
        &self.registry
    }

    pub fn scratch(&self) -> Option<&ScratchBuffers> {
        self.scratch.as_ref()
    }

    pub fn scratch_mut(&mut self) -> Option<&mut ScratchBuffers> {
        self.scratch.as_mut()
    }

    /// Wait for enqueued work, release every kernel, then the queue and
    /// context, then host scratch.
    ///
    /// Idempotent. Every release step is attempted; failures are logged.
    pub fn shutdown(&mut self) {
        let Some(ctx) = self.context.take() else {
            return;
        };
        ctx.drain();
        info!("releasing {} kernels", self.registry.len());
        self.registry.release_all(ctx.backend());
        self.registered = false;
        ctx.release();
        self.scratch = None;
    }
}

impl<B: ComputeBackend> Drop for Gpu<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A registered kernel, borrowed from its [`Gpu`].
pub struct KernelHandle<'a, B: ComputeBackend> {
    gpu: &'a mut Gpu<B>,
    id: KernelId,
}

impl<'a, B: ComputeBackend> KernelHandle<'a, B> {
    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn kernel(&self) -> &Kernel<B> {
        self.gpu.registry.get(self.id)
    }

    pub fn name(&self) -> &str {
        self.kernel().name()
    }

    pub fn state(&self) -> BuildState {
        self.kernel().state()
    }

    pub fn is_built(&self) -> bool {
        self.kernel().is_built()
    }

    /// Build this kernel and the kernels it borrows from. No-op once built.
    pub fn build(&mut self) -> Result<()> {
        let gpu = &mut *self.gpu;
        let ctx = gpu.context.as_ref().ok_or(KilnError::NotInitialized)?;
        gpu.registry.build(ctx, &gpu.config, self.id)
    }

    fn ensure_built(&mut self) -> &Kernel<B> {
        if let Err(e) = self.build() {
            programming_error(format!("kernel {} failed to build: {e}", self.name()));
        }
        self.kernel()
    }

    /// # Panics
    /// If the build fails or `index` is out of range.
    pub fn output(&mut self, index: usize) -> &BufferObject<B::Memory> {
        let kernel = self.ensure_built();
        match kernel.outputs().get(index) {
            Some(buffer) => buffer,
            None => programming_error(format!(
                "output {index} of kernel {} out of range ({} outputs)",
                kernel.name(),
                kernel.outputs().len()
            )),
        }
    }

    /// # Panics
    /// If the build fails or `index` is out of range.
    pub fn input(&mut self, index: usize) -> &BufferObject<B::Memory> {
        let kernel = self.ensure_built();
        match kernel.inputs().get(index) {
            Some(buffer) => buffer,
            None => programming_error(format!(
                "input {index} of kernel {} out of range ({} inputs)",
                kernel.name(),
                kernel.inputs().len()
            )),
        }
    }

    /// # Panics
    /// If the build fails.
    pub fn outputs(&mut self) -> &[BufferObject<B::Memory>] {
        self.ensure_built().outputs()
    }

    /// # Panics
    /// If the build fails.
    pub fn inputs(&mut self) -> &[BufferObject<B::Memory>] {
        self.ensure_built().inputs()
    }

    fn check_argument(&self, argument: usize) {
        let kernel = self.kernel();
        if argument >= kernel.num_arguments() {
            programming_error(format!(
                "argument {argument} of kernel {} out of range ({} arguments)",
                kernel.name(),
                kernel.num_arguments()
            ));
        }
    }

    /// Blocking copy of `data` into argument `argument`, counted over
    /// outputs then inputs. Builds first.
    ///
    /// # Panics
    /// If `argument` is out of range.
    pub fn write_to_buffer(&mut self, argument: usize, data: &[u8]) -> Result<()> {
        self.check_argument(argument);
        self.build()?;
        let gpu = &mut *self.gpu;
        let ctx = gpu.context.as_ref().ok_or(KilnError::NotInitialized)?;
        gpu.registry.write_argument(ctx, self.id, argument, data)
    }

    /// Write 32-bit values, big-endian.
    pub fn write_u32s(&mut self, argument: usize, values: &[u32]) -> Result<()> {
        self.write_to_buffer(argument, &u32s_to_be_bytes(values))
    }

    pub fn write_str(&mut self, argument: usize, text: &str) -> Result<()> {
        self.write_to_buffer(argument, text.as_bytes())
    }

    /// Blocking copy of the first `len` bytes of argument `argument`.
    ///
    /// # Panics
    /// If `argument` is out of range.
    pub fn read_from_buffer(&mut self, argument: usize, len: usize) -> Result<Vec<u8>> {
        self.check_argument(argument);
        self.build()?;
        let gpu = &*self.gpu;
        let ctx = gpu.context.as_ref().ok_or(KilnError::NotInitialized)?;
        gpu.registry.read_argument(ctx, self.id, argument, len)
    }

    /// Set the message index and re-issue its four byte slots.
    pub fn write_message_index(&mut self, value: u32) -> Result<()> {
        self.build()?;
        let gpu = &mut *self.gpu;
        let ctx = gpu.context.as_ref().ok_or(KilnError::NotInitialized)?;
        gpu.registry.get_mut(self.id).write_message_index(ctx, value)
    }

    pub fn work_size(&self) -> WorkSize {
        self.kernel().work_size()
    }

    pub fn set_work_size(&mut self, work_size: WorkSize) {
        self.gpu.registry.get_mut(self.id).set_work_size(work_size);
    }

    /// Submit one launch without waiting; see [`Gpu::finish`].
    pub fn enqueue(&mut self) -> Result<()> {
        self.build()?;
        let gpu = &*self.gpu;
        let ctx = gpu.context.as_ref().ok_or(KilnError::NotInitialized)?;
        gpu.registry.get(self.id).enqueue(ctx)
    }

    pub fn native(&self) -> Option<&B::Kernel> {
        self.kernel().native()
    }
}

fn programming_error(message: String) -> ! {
    error!("{}", message);
    panic!("{}", message)
}
