//! The kernel registry: an arena of kernels keyed by [`KernelId`].
//!
//! Dependencies are validated when a kernel is registered. An owner must be
//! registered before any kernel borrowing from it, so every dependency edge
//! points at a lower id and the graph is acyclic. Builds run on demand and
//! recurse into owners first.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::backend::{ComputeBackend, WorkSize};
use crate::buffer::{BufferKind, BufferObject, BufferRef, ResolvedBuffer};
use crate::config::GpuConfig;
use crate::context::DeviceContext;
use crate::descriptor::KernelDescriptor;
use crate::error::CatalogError;
use crate::kernel::{BuildState, Kernel};
use crate::source::SourceRepository;
use crate::{KilnError, Result};

/// Opaque identifier of a registered kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(usize);

impl KernelId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Registered kernels, by id and by name.
pub struct Registry<B: ComputeBackend> {
    kernels: Vec<Kernel<B>>,
    by_name: HashMap<String, KernelId>,
}

impl<B: ComputeBackend> Default for Registry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ComputeBackend> Registry<B> {
    pub fn new() -> Self {
        Self {
            kernels: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<KernelId> {
        self.by_name.get(name).copied()
    }

    /// # Panics
    /// If `id` was not issued by this registry.
    pub fn get(&self, id: KernelId) -> &Kernel<B> {
        &self.kernels[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: KernelId) -> &mut Kernel<B> {
        &mut self.kernels[id.0]
    }

    pub fn by_name(&self, name: &str) -> Option<&Kernel<B>> {
        self.id(name).map(|id| self.get(id))
    }

    /// Kernels in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Kernel<B>> {
        self.kernels.iter()
    }

    /// Validate `descriptor` against the kernels already registered, then
    /// load its source and create its program.
    pub fn register(
        &mut self,
        ctx: &DeviceContext<B>,
        sources: &dyn SourceRepository,
        descriptor: KernelDescriptor,
        work_size: WorkSize,
    ) -> Result<KernelId> {
        let owners = self.validate(&descriptor).map_err(|e| {
            error!("invalid kernel descriptor: {}", e);
            KilnError::from(e)
        })?;
        let id = KernelId::new(self.kernels.len());
        let name = descriptor.name.clone();
        let kernel = Kernel::construct_no_build(id, descriptor, owners, ctx, sources, work_size)?;
        self.kernels.push(kernel);
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn validate(&self, descriptor: &KernelDescriptor) -> std::result::Result<Vec<KernelId>, CatalogError> {
        descriptor.validate_layout()?;
        if self.by_name.contains_key(&descriptor.name) {
            return Err(CatalogError::DuplicateKernel(descriptor.name.clone()));
        }
        descriptor
            .external
            .iter()
            .map(|ext| {
                let owner = self.id(&ext.owner).ok_or_else(|| CatalogError::UnknownOwner {
                    kernel: descriptor.name.clone(),
                    owner: ext.owner.clone(),
                })?;
                if !self.get(owner).descriptor().has_argument(&ext.buffer) {
                    return Err(CatalogError::UnknownOwnerArgument {
                        kernel: descriptor.name.clone(),
                        owner: ext.owner.clone(),
                        buffer: ext.buffer.clone(),
                    });
                }
                Ok(owner)
            })
            .collect()
    }

    /// Build `id`, building its owners first. Does nothing once built.
    ///
    /// A failed build leaves the kernel registered, so it can be retried.
    pub fn build(&mut self, ctx: &DeviceContext<B>, config: &GpuConfig, id: KernelId) -> Result<()> {
        match self.get(id).state() {
            BuildState::Built => return Ok(()),
            BuildState::Building => {
                return Err(CatalogError::DependencyCycle { kernel: self.get(id).name().to_string() }.into())
            }
            BuildState::Registered => {}
        }

        self.get_mut(id).set_state(BuildState::Building);
        let result = self.build_inner(ctx, config, id);
        let state = if result.is_ok() { BuildState::Built } else { BuildState::Registered };
        self.get_mut(id).set_state(state);
        result
    }

    fn build_inner(&mut self, ctx: &DeviceContext<B>, config: &GpuConfig, id: KernelId) -> Result<()> {
        self.get_mut(id).compile(ctx)?;

        let owners = self.get(id).owners().to_vec();
        for &owner in &owners {
            if !self.get(owner).is_built() {
                debug!("building {} for {}", self.get(owner).name(), self.get(id).name());
                self.build(ctx, config, owner)?;
            }
        }

        let external = self
            .get(id)
            .descriptor()
            .external
            .iter()
            .zip(&owners)
            .map(|(ext, &owner)| self.resolve(owner, &ext.buffer))
            .collect::<Result<Vec<_>>>()?;

        self.get_mut(id).allocate_and_bind(ctx, config, &external)?;
        debug!("kernel {} built", self.get(id).name());
        Ok(())
    }

    /// Build every registered kernel, in registration order.
    pub fn build_all(&mut self, ctx: &DeviceContext<B>, config: &GpuConfig) -> Result<()> {
        for index in 0..self.kernels.len() {
            self.build(ctx, config, KernelId::new(index))?;
        }
        Ok(())
    }

    /// Device memory behind argument `argument` of a built kernel.
    ///
    /// A borrowed argument is followed to the buffer that owns the memory.
    pub fn resolve(&self, kernel: KernelId, argument: &str) -> Result<ResolvedBuffer<B::Memory>> {
        match self.get(kernel).argument_named(argument) {
            Some(buffer) => self.resolve_object(kernel, buffer),
            None => Err(KilnError::NotDeviceMemory {
                kernel: self.get(kernel).name().to_string(),
                buffer: argument.to_string(),
            }),
        }
    }

    /// Like [`resolve`](Self::resolve), selecting the argument by its
    /// combined outputs-then-inputs index.
    pub fn resolve_argument(&self, kernel: KernelId, index: usize) -> Result<ResolvedBuffer<B::Memory>> {
        match self.get(kernel).argument(index) {
            Some(buffer) => self.resolve_object(kernel, buffer),
            None => Err(KilnError::NotDeviceMemory {
                kernel: self.get(kernel).name().to_string(),
                buffer: format!("#{index}"),
            }),
        }
    }

    fn resolve_object(
        &self,
        kernel: KernelId,
        buffer: &BufferObject<B::Memory>,
    ) -> Result<ResolvedBuffer<B::Memory>> {
        let not_device_memory = || KilnError::NotDeviceMemory {
            kernel: self.get(kernel).name().to_string(),
            buffer: buffer.name().to_string(),
        };
        if !buffer.kind().is_device_memory() {
            return Err(not_device_memory());
        }
        if buffer.kind() == BufferKind::Borrowed {
            let origin = buffer.origin().ok_or_else(not_device_memory)?;
            return self.resolve(origin.kernel, &origin.argument);
        }
        let memory = buffer.memory().ok_or_else(not_device_memory)?;
        Ok(ResolvedBuffer {
            origin: BufferRef { kernel, argument: buffer.name().to_string() },
            memory,
            size: buffer.size(),
        })
    }

    /// Blocking host to device copy into argument `index` of a built kernel.
    ///
    /// The bytes go through the owning buffer's staging region. Writing a
    /// borrowed argument targets the owner's memory.
    pub(crate) fn write_argument(
        &mut self,
        ctx: &DeviceContext<B>,
        kernel: KernelId,
        index: usize,
        data: &[u8],
    ) -> Result<()> {
        let target = self.resolve_argument(kernel, index)?;
        if data.len() > target.size {
            return Err(KilnError::BufferTooSmall {
                buffer: target.origin.argument,
                requested: data.len(),
                capacity: target.size,
            });
        }
        if let Some(owner) = self.get_mut(target.origin.kernel).argument_named_mut(&target.origin.argument) {
            owner.stage(data);
        }
        ctx.backend()
            .write_buffer(ctx.queue(), target.memory, data)
            .map_err(|e| {
                error!("failed to write buffer {}: {}", target.origin.argument, e);
                e
            })
    }

    /// Blocking device to host copy of the first `len` bytes of argument `index`.
    pub(crate) fn read_argument(
        &self,
        ctx: &DeviceContext<B>,
        kernel: KernelId,
        index: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let source = self.resolve_argument(kernel, index)?;
        if len > source.size {
            return Err(KilnError::BufferTooSmall {
                buffer: source.origin.argument,
                requested: len,
                capacity: source.size,
            });
        }
        let mut out = vec![0u8; len];
        ctx.backend()
            .read_buffer(ctx.queue(), source.memory, &mut out)
            .map_err(|e| {
                error!("failed to read buffer {}: {}", source.origin.argument, e);
                e
            })?;
        Ok(out)
    }

    /// Release every kernel, most recently registered first, and empty the registry.
    pub fn release_all(&mut self, backend: &B) {
        while let Some(mut kernel) = self.kernels.pop() {
            if kernel.state() == BuildState::Building {
                warn!("releasing kernel {} while it is being built", kernel.name());
            }
            kernel.release(backend);
        }
        self.by_name.clear();
    }
}

impl<B: ComputeBackend> std::fmt::Debug for Registry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kernels.iter().map(|k| k.name())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind::*;
    use crate::host::{HostArg, HostBackend};
    use crate::source::InMemorySources;

    fn small_config() -> GpuConfig {
        GpuConfig {
            default_buffer_size: 64,
            signature_buffer_size: 128,
            ..Default::default()
        }
    }

    fn sources() -> InMemorySources {
        InMemorySources::new()
            .with("ctxInit", "__kernel void ctxInit(__global uchar* ctx) {}")
            .with("useCtx", "__kernel void useCtx(__global uchar* r, __global uchar* ctx) {}")
            .with("chained", "__kernel void chained(__global uchar* ctx) {}")
    }

    fn ctx_init() -> KernelDescriptor {
        KernelDescriptor::new("ctxInit").outputs(&["ctx"], &[Owned])
    }

    fn use_ctx() -> KernelDescriptor {
        KernelDescriptor::new("useCtx")
            .outputs(&["result"], &[Owned])
            .inputs(&["ctx"], &[Borrowed])
            .borrows("ctx", "ctxInit")
    }

    fn setup() -> (HostBackend, DeviceContext<HostBackend>, Registry<HostBackend>) {
        let backend = HostBackend::new();
        let ctx = DeviceContext::initialize(backend.clone(), &small_config()).unwrap();
        (backend, ctx, Registry::new())
    }

    #[test]
    fn test_register_rejects_unknown_owner() {
        let (backend, ctx, mut registry) = setup();
        let err = registry
            .register(&ctx, &sources(), use_ctx(), WorkSize::default())
            .unwrap_err();
        assert!(matches!(
            err,
            KilnError::Catalog(CatalogError::UnknownOwner { ref owner, .. }) if owner == "ctxInit"
        ));
        assert!(registry.is_empty());
        assert_eq!(backend.stats().programs_created, 0);
    }

    #[test]
    fn test_register_rejects_unknown_owner_argument() {
        let (_backend, ctx, mut registry) = setup();
        registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        let desc = KernelDescriptor::new("useCtx")
            .inputs(&["ctx"], &[Borrowed])
            .borrows("context", "ctxInit");
        let err = registry.register(&ctx, &sources(), desc, WorkSize::default()).unwrap_err();
        assert!(matches!(
            err,
            KilnError::Catalog(CatalogError::UnknownOwnerArgument { ref buffer, .. }) if buffer == "context"
        ));
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let (_backend, ctx, mut registry) = setup();
        registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        let err = registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap_err();
        assert!(matches!(err, KilnError::Catalog(CatalogError::DuplicateKernel(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_build_resolves_borrowed_buffer() {
        let (backend, ctx, mut registry) = setup();
        let config = small_config();
        let owner = registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        let user = registry.register(&ctx, &sources(), use_ctx(), WorkSize::default()).unwrap();

        registry.build(&ctx, &config, user).unwrap();
        assert!(registry.get(owner).is_built());
        assert!(registry.get(user).is_built());

        let owner_mem = registry.get(owner).outputs()[0].memory().unwrap();
        let native = *registry.get(user).native().unwrap();
        assert_eq!(backend.arg(native, 1), Some(HostArg::Memory(owner_mem)));
        assert_eq!(
            registry.get(user).inputs()[0].origin(),
            Some(&BufferRef { kernel: owner, argument: "ctx".into() })
        );
        assert_eq!(backend.stats().buffers_allocated, 2);
    }

    #[test]
    fn test_resolve_follows_borrow_chain() {
        let (_backend, ctx, mut registry) = setup();
        let config = small_config();
        let owner = registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        let user = registry.register(&ctx, &sources(), use_ctx(), WorkSize::default()).unwrap();
        let desc = KernelDescriptor::new("chained")
            .inputs(&["ctx"], &[Borrowed])
            .borrows("ctx", "useCtx");
        let chained = registry.register(&ctx, &sources(), desc, WorkSize::default()).unwrap();

        registry.build(&ctx, &config, chained).unwrap();
        assert!(registry.get(user).is_built());
        let resolved = registry.resolve(chained, "ctx").unwrap();
        assert_eq!(resolved.origin.kernel, owner);
        assert_eq!(Some(resolved.memory), registry.get(owner).outputs()[0].memory());
    }

    #[test]
    fn test_reentrant_build_is_a_cycle() {
        let (_backend, ctx, mut registry) = setup();
        let id = registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        registry.get_mut(id).set_state(BuildState::Building);
        let err = registry.build(&ctx, &small_config(), id).unwrap_err();
        assert!(matches!(err, KilnError::Catalog(CatalogError::DependencyCycle { .. })));
    }

    #[test]
    fn test_failed_build_can_be_retried() {
        let (backend, ctx, mut registry) = setup();
        let config = small_config();
        let id = registry.register(&ctx, &sources(), use_ctx_standalone(), WorkSize::default()).unwrap();
        backend.fail_allocations_after(0);
        assert!(registry.build(&ctx, &config, id).is_err());
        assert_eq!(registry.get(id).state(), BuildState::Registered);

        backend.fail_allocations_after(usize::MAX);
        registry.build(&ctx, &config, id).unwrap();
        assert!(registry.get(id).is_built());
        assert_eq!(backend.stats().compiles, 1);
    }

    fn use_ctx_standalone() -> KernelDescriptor {
        KernelDescriptor::new("useCtx").outputs(&["result"], &[Owned]).inputs(&["ctx"], &[Owned])
    }

    #[test]
    fn test_release_all() {
        let (backend, ctx, mut registry) = setup();
        let config = small_config();
        registry.register(&ctx, &sources(), ctx_init(), WorkSize::default()).unwrap();
        let user = registry.register(&ctx, &sources(), use_ctx(), WorkSize::default()).unwrap();
        registry.build(&ctx, &config, user).unwrap();

        registry.release_all(ctx.backend());
        let stats = backend.stats();
        assert!(registry.is_empty());
        assert_eq!(stats.buffers_released, 2);
        assert_eq!(stats.kernels_released, 2);
        assert_eq!(stats.programs_released, 2);
        assert_eq!(backend.live_buffers(), 0);
    }
}
