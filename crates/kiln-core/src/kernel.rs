//! A single compute kernel: program, entry point and argument buffers.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::{ComputeBackend, MemAccess, WorkSize, STATUS_INVALID_KERNEL_NAME};
use crate::binding::{self, message_index_slot};
use crate::buffer::{BufferKind, BufferObject, ResolvedBuffer};
use crate::config::GpuConfig;
use crate::context::DeviceContext;
use crate::descriptor::KernelDescriptor;
use crate::error::CatalogError;
use crate::registry::KernelId;
use crate::source::SourceRepository;
use crate::{KilnError, Result};

/// Build progress of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Source loaded and program object created.
    Registered,
    /// Build in progress, possibly building its owners.
    Building,
    /// Compiled, allocated and bound. Terminal.
    Built,
}

/// A registered kernel and, once built, its device resources.
pub struct Kernel<B: ComputeBackend> {
    id: KernelId,
    descriptor: KernelDescriptor,
    /// Owner of each declared external buffer, in declaration order.
    owners: Vec<KernelId>,
    program: Option<B::Program>,
    kernel: Option<B::Kernel>,
    outputs: Vec<BufferObject<B::Memory>>,
    inputs: Vec<BufferObject<B::Memory>>,
    state: BuildState,
    work_size: WorkSize,
}

impl<B: ComputeBackend> Kernel<B> {
    /// Load the source and create the program object. Nothing is compiled.
    pub(crate) fn construct_no_build(
        id: KernelId,
        descriptor: KernelDescriptor,
        owners: Vec<KernelId>,
        ctx: &DeviceContext<B>,
        sources: &dyn SourceRepository,
        work_size: WorkSize,
    ) -> Result<Self> {
        let source = sources.load(&descriptor.name)?;
        let program = ctx.backend().create_program(ctx.context(), &source).map_err(|e| {
            error!("failed to create program {}: {}", descriptor.name, e);
            e
        })?;
        debug!("kernel {} registered", descriptor.name);
        Ok(Self {
            id,
            descriptor,
            owners,
            program: Some(program),
            kernel: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
            state: BuildState::Registered,
            work_size,
        })
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    /// Kernels this one borrows buffers from, one entry per external buffer.
    pub fn owners(&self) -> &[KernelId] {
        &self.owners
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn is_built(&self) -> bool {
        self.state == BuildState::Built
    }

    /// Output buffers. Empty until built.
    pub fn outputs(&self) -> &[BufferObject<B::Memory>] {
        &self.outputs
    }

    /// Input buffers. Empty until built.
    pub fn inputs(&self) -> &[BufferObject<B::Memory>] {
        &self.inputs
    }

    /// Buffer at a combined index running over outputs, then inputs.
    pub fn argument(&self, index: usize) -> Option<&BufferObject<B::Memory>> {
        if index < self.outputs.len() {
            self.outputs.get(index)
        } else {
            self.inputs.get(index - self.outputs.len())
        }
    }

    /// Buffer named `name`, among outputs then inputs.
    pub fn argument_named(&self, name: &str) -> Option<&BufferObject<B::Memory>> {
        self.outputs.iter().chain(&self.inputs).find(|b| b.name() == name)
    }

    pub(crate) fn argument_named_mut(&mut self, name: &str) -> Option<&mut BufferObject<B::Memory>> {
        self.outputs
            .iter_mut()
            .chain(self.inputs.iter_mut())
            .find(|b| b.name() == name)
    }

    pub fn num_arguments(&self) -> usize {
        self.descriptor.num_outputs() + self.descriptor.num_inputs()
    }

    pub fn work_size(&self) -> WorkSize {
        self.work_size
    }

    pub fn set_work_size(&mut self, work_size: WorkSize) {
        self.work_size = work_size;
    }

    /// The native kernel object, once created.
    pub fn native(&self) -> Option<&B::Kernel> {
        self.kernel.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: BuildState) {
        self.state = state;
    }

    /// Compile the program and create the kernel object.
    ///
    /// Does nothing if the kernel object already exists.
    pub(crate) fn compile(&mut self, ctx: &DeviceContext<B>) -> Result<()> {
        if self.kernel.is_some() {
            return Ok(());
        }
        let backend = ctx.backend();
        let name = self.descriptor.name.clone();
        let Some(program) = self.program.as_ref() else {
            return Err(KilnError::NotInitialized);
        };

        let start = Instant::now();
        if let Err(e) = backend.compile_program(program, ctx.device(), ctx.compile_options()) {
            error!("failed to build program {}: {}", name, e);
            let log = match backend.build_log(program, ctx.device()) {
                Ok(log) => {
                    error!("build log of {}:\n{}", name, log);
                    log
                }
                Err(log_err) => {
                    error!("failed to fetch build log of {}: {}", name, log_err);
                    String::new()
                }
            };
            return Err(KilnError::Compile { kernel: name, log });
        }
        info!("program {} built in {:.3} s", name, start.elapsed().as_secs_f64());

        match backend.create_kernel(program, &name) {
            Ok(kernel) => {
                self.kernel = Some(kernel);
                Ok(())
            }
            Err(e) if e.status() == Some(STATUS_INVALID_KERNEL_NAME) => {
                error!("program {} has no entry point named {}", name, name);
                Err(CatalogError::EntryPointMismatch { kernel: name }.into())
            }
            Err(e) => {
                error!("failed to create kernel {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Allocate every owned buffer and bind all arguments.
    ///
    /// On failure every allocation made here is released again.
    pub(crate) fn allocate_and_bind(
        &mut self,
        ctx: &DeviceContext<B>,
        config: &GpuConfig,
        external: &[ResolvedBuffer<B::Memory>],
    ) -> Result<()> {
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(KilnError::NotInitialized);
        };
        let backend = ctx.backend();
        let mut outputs = Vec::with_capacity(self.descriptor.num_outputs());
        let mut inputs = Vec::with_capacity(self.descriptor.num_inputs());

        let result = allocate_group(
            ctx,
            config,
            &self.descriptor.output_names,
            &self.descriptor.output_types,
            MemAccess::WriteOnly,
            &mut outputs,
        )
        .and_then(|()| {
            allocate_group(
                ctx,
                config,
                &self.descriptor.input_names,
                &self.descriptor.input_types,
                MemAccess::ReadOnly,
                &mut inputs,
            )
        })
        .and_then(|()| {
            binding::bind_arguments(backend, kernel, &self.descriptor.name, &mut outputs, &mut inputs, external)
        });

        if let Err(e) = result {
            error!("failed to build kernel {}: {}", self.descriptor.name, e);
            for buffer in outputs.iter_mut().chain(inputs.iter_mut()) {
                release_buffer(backend, &self.descriptor.name, buffer);
            }
            return Err(e);
        }

        self.outputs = outputs;
        self.inputs = inputs;
        Ok(())
    }

    /// Store `value` in the message-index buffer and re-issue its four slots.
    pub(crate) fn write_message_index(&mut self, ctx: &DeviceContext<B>, value: u32) -> Result<()> {
        if !self.descriptor.has_message_index() {
            return Err(CatalogError::NoMessageIndex { kernel: self.descriptor.name.clone() }.into());
        }
        let slot = message_index_slot(self.descriptor.num_outputs(), self.descriptor.num_inputs());
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(KilnError::NotInitialized);
        };
        if let Some(buffer) = self.inputs.last_mut() {
            buffer.set_index_value(value);
        }
        binding::set_message_index(ctx.backend(), kernel, slot, value).map_err(|e| {
            error!("failed to set message index of kernel {}: {}", self.descriptor.name, e);
            e
        })
    }

    /// Submit one launch with the current work size. Does not wait.
    pub(crate) fn enqueue(&self, ctx: &DeviceContext<B>) -> Result<()> {
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(KilnError::NotInitialized);
        };
        ctx.backend()
            .enqueue_kernel(ctx.queue(), kernel, &self.work_size)
            .map_err(|e| {
                error!("failed to enqueue kernel {}: {}", self.descriptor.name, e);
                e
            })
    }

    /// Release owned buffers, then the kernel object, then the program.
    ///
    /// Every step is attempted; failures are logged.
    pub(crate) fn release(&mut self, backend: &B) {
        let name = self.descriptor.name.clone();
        for buffer in self.outputs.iter_mut().chain(self.inputs.iter_mut()) {
            release_buffer(backend, &name, buffer);
        }
        self.outputs.clear();
        self.inputs.clear();
        if let Some(kernel) = self.kernel.take() {
            if let Err(e) = backend.release_kernel(kernel) {
                warn!("failed to release kernel {}: {}", name, e);
            }
        }
        if let Some(program) = self.program.take() {
            if let Err(e) = backend.release_program(program) {
                warn!("failed to release program {}: {}", name, e);
            }
        }
        self.state = BuildState::Registered;
    }
}

impl<B: ComputeBackend> std::fmt::Debug for Kernel<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .field("outputs", &self.outputs)
            .field("inputs", &self.inputs)
            .finish()
    }
}

fn allocate_group<B: ComputeBackend>(
    ctx: &DeviceContext<B>,
    config: &GpuConfig,
    names: &[String],
    types: &[BufferKind],
    access: MemAccess,
    out: &mut Vec<BufferObject<B::Memory>>,
) -> Result<()> {
    for (name, kind) in names.iter().zip(types) {
        let buffer = match kind {
            BufferKind::Owned => {
                let size = config.buffer_size_for(name);
                let memory = ctx.backend().create_buffer(ctx.context(), access, size).map_err(|e| {
                    error!("failed to allocate {} bytes for buffer {}: {}", size, name, e);
                    e
                })?;
                BufferObject::owned(name, memory, size)
            }
            BufferKind::Borrowed => BufferObject::borrowed(name),
            BufferKind::MessageIndex => BufferObject::message_index(name),
        };
        out.push(buffer);
    }
    Ok(())
}

fn release_buffer<B: ComputeBackend>(backend: &B, kernel: &str, buffer: &mut BufferObject<B::Memory>) {
    if let Some(memory) = buffer.take_memory() {
        if let Err(e) = backend.release_memory(memory) {
            warn!("failed to release buffer {} of kernel {}: {}", buffer.name(), kernel, e);
        }
    }
}
