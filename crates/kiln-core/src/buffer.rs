//! Buffer objects: one per declared kernel argument.
//!
//! Every buffer carries an explicit ownership tag. An owned buffer holds a
//! device allocation that its kernel releases exactly once at teardown. A
//! borrowed buffer holds no allocation, only the key of the owner's buffer it
//! was resolved to. A message-index buffer holds a scalar.

use crate::registry::KernelId;

/// Semantic type of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Device memory allocated and released by the declaring kernel.
    Owned,
    /// Device memory owned by another kernel.
    Borrowed,
    /// Per-invocation scalar, bound as four single-byte slots.
    MessageIndex,
}

impl BufferKind {
    pub fn is_device_memory(&self) -> bool {
        !matches!(self, BufferKind::MessageIndex)
    }
}

/// Lookup key of a buffer: owning kernel plus argument name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferRef {
    pub kernel: KernelId,
    pub argument: String,
}

/// An owner's buffer as seen by a kernel borrowing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBuffer<M> {
    pub origin: BufferRef,
    pub memory: M,
    pub size: usize,
}

/// A typed handle to device memory or a scalar value.
#[derive(Debug)]
pub struct BufferObject<M> {
    name: String,
    kind: BufferKind,
    memory: Option<M>,
    size: usize,
    staging: Vec<u8>,
    origin: Option<BufferRef>,
    index_value: u32,
}

impl<M: Copy> BufferObject<M> {
    pub(crate) fn owned(name: &str, memory: M, size: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: BufferKind::Owned,
            memory: Some(memory),
            size,
            staging: vec![0; size],
            origin: None,
            index_value: 0,
        }
    }

    /// An unresolved borrowed buffer; [`resolve`](Self::resolve) attaches its origin.
    pub(crate) fn borrowed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: BufferKind::Borrowed,
            memory: None,
            size: 0,
            staging: Vec::new(),
            origin: None,
            index_value: 0,
        }
    }

    pub(crate) fn message_index(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: BufferKind::MessageIndex,
            memory: None,
            size: 0,
            staging: Vec::new(),
            origin: None,
            index_value: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Device allocation owned by this buffer. `None` for borrowed and scalar buffers.
    pub fn memory(&self) -> Option<M> {
        self.memory
    }

    /// Size in bytes of the device memory this buffer addresses.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The owner buffer a borrowed buffer resolved to.
    pub fn origin(&self) -> Option<&BufferRef> {
        self.origin.as_ref()
    }

    /// Host staging region of an owned buffer.
    pub fn staging(&self) -> &[u8] {
        &self.staging
    }

    /// Current scalar value of a message-index buffer.
    pub fn message_index_value(&self) -> Option<u32> {
        match self.kind {
            BufferKind::MessageIndex => Some(self.index_value),
            _ => None,
        }
    }

    pub(crate) fn resolve(&mut self, origin: BufferRef, size: usize) {
        self.origin = Some(origin);
        self.size = size;
    }

    pub(crate) fn set_index_value(&mut self, value: u32) {
        self.index_value = value;
    }

    /// Copy `data` into the staging region. Borrowed buffers stage nothing.
    pub(crate) fn stage(&mut self, data: &[u8]) {
        if self.kind == BufferKind::Owned {
            self.staging[..data.len()].copy_from_slice(data);
        }
    }

    pub(crate) fn take_memory(&mut self) -> Option<M> {
        self.staging = Vec::new();
        self.memory.take()
    }
}
