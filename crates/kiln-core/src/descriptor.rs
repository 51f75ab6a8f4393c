//! Kernel descriptors: a kernel's declared argument layout.

use crate::buffer::BufferKind;
use crate::error::{ArgRole, CatalogError};

/// A buffer borrowed from another kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBuffer {
    /// Argument name on the owner kernel.
    pub buffer: String,
    /// Registry name of the owner kernel.
    pub owner: String,
}

/// Declared arguments of one kernel.
///
/// Names and types are kept as separate, parallel lists; their lengths are
/// checked at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub name: String,
    pub output_names: Vec<String>,
    pub output_types: Vec<BufferKind>,
    pub input_names: Vec<String>,
    pub input_types: Vec<BufferKind>,
    pub external: Vec<ExternalBuffer>,
}

impl KernelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_names: Vec::new(),
            output_types: Vec::new(),
            input_names: Vec::new(),
            input_types: Vec::new(),
            external: Vec::new(),
        }
    }

    pub fn outputs(mut self, names: &[&str], types: &[BufferKind]) -> Self {
        self.output_names = names.iter().map(|s| s.to_string()).collect();
        self.output_types = types.to_vec();
        self
    }

    pub fn inputs(mut self, names: &[&str], types: &[BufferKind]) -> Self {
        self.input_names = names.iter().map(|s| s.to_string()).collect();
        self.input_types = types.to_vec();
        self
    }

    /// Declare that this kernel reads `buffer` from kernel `owner`.
    pub fn borrows(mut self, buffer: &str, owner: &str) -> Self {
        self.external.push(ExternalBuffer {
            buffer: buffer.to_string(),
            owner: owner.to_string(),
        });
        self
    }

    pub fn num_outputs(&self) -> usize {
        self.output_names.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.input_names.len()
    }

    /// Whether an output or input with this name is declared.
    pub fn has_argument(&self, name: &str) -> bool {
        self.output_names.iter().chain(&self.input_names).any(|n| n == name)
    }

    /// Whether the last declared input is a message index.
    pub fn has_message_index(&self) -> bool {
        self.input_types.last() == Some(&BufferKind::MessageIndex)
    }

    /// Check list lengths and message-index placement.
    pub fn validate_layout(&self) -> Result<(), CatalogError> {
        if self.output_names.len() != self.output_types.len() {
            return Err(CatalogError::ArityMismatch {
                kernel: self.name.clone(),
                role: ArgRole::Output,
                names: self.output_names.len(),
                types: self.output_types.len(),
            });
        }
        if self.input_names.len() != self.input_types.len() {
            return Err(CatalogError::ArityMismatch {
                kernel: self.name.clone(),
                role: ArgRole::Input,
                names: self.input_names.len(),
                types: self.input_types.len(),
            });
        }
        if let Some(pos) = self.output_types.iter().position(|&t| t == BufferKind::MessageIndex) {
            return Err(CatalogError::MisplacedMessageIndex {
                kernel: self.name.clone(),
                argument: self.output_names[pos].clone(),
            });
        }
        let last = self.input_types.len().saturating_sub(1);
        if let Some(pos) = self
            .input_types
            .iter()
            .enumerate()
            .position(|(i, &t)| t == BufferKind::MessageIndex && i != last)
        {
            return Err(CatalogError::MisplacedMessageIndex {
                kernel: self.name.clone(),
                argument: self.input_names[pos].clone(),
            });
        }
        Ok(())
    }
}
