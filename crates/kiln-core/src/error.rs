//! Error types for kernel registration, build and transfer.
//!
//! Two classes are kept apart: [`CatalogError`] covers defects in the kernel
//! catalog itself (a programming error, never expected at run time), while the
//! remaining [`KilnError`] variants are environmental failures a caller can
//! react to.

use std::path::PathBuf;

use crate::backend::DeviceClass;

/// Which half of a kernel's argument list a descriptor entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRole {
    Output,
    Input,
}

impl std::fmt::Display for ArgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgRole::Output => write!(f, "output"),
            ArgRole::Input => write!(f, "input"),
        }
    }
}

/// Defects in the kernel catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("kernel '{kernel}': {names} {role} names but {types} {role} types")]
    ArityMismatch {
        kernel: String,
        role: ArgRole,
        names: usize,
        types: usize,
    },

    #[error("kernel '{kernel}' depends on kernel '{owner}' which has not been registered")]
    UnknownOwner { kernel: String, owner: String },

    #[error("kernel '{kernel}' depends on buffer '{buffer}' of kernel '{owner}', which declares no such argument")]
    UnknownOwnerArgument {
        kernel: String,
        owner: String,
        buffer: String,
    },

    #[error("kernel '{0}' is already registered")]
    DuplicateKernel(String),

    #[error("'{0}' is not a known kernel name")]
    UnknownKernel(String),

    #[error("kernel '{kernel}': message index '{argument}' must be the single, last declared input")]
    MisplacedMessageIndex { kernel: String, argument: String },

    #[error("kernel '{kernel}' declares no message index argument")]
    NoMessageIndex { kernel: String },

    #[error("program '{kernel}' has no entry point of the same name")]
    EntryPointMismatch { kernel: String },

    #[error("kernel '{kernel}' was reached again while it was being built")]
    DependencyCycle { kernel: String },
}

/// Errors surfaced by the kernel subsystem.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error("no compute platform is available")]
    NoPlatform,

    #[error("no {class} device found on any platform")]
    NoDevice { class: DeviceClass },

    #[error("{call} failed with status {code}")]
    Native { call: String, code: i32 },

    #[error("compute runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("device context is not initialized")]
    NotInitialized,

    #[error("source for kernel '{kernel}' not found at {}", path.display())]
    SourceNotFound { kernel: String, path: PathBuf },

    #[error("failed to build program '{kernel}':\n{log}")]
    Compile { kernel: String, log: String },

    #[error("kernel '{kernel}' binds more borrowed buffers than its {declared} declared dependencies")]
    ExternalBufferOverflow { kernel: String, declared: usize },

    #[error("buffer '{buffer}' of kernel '{kernel}' is not backed by device memory")]
    NotDeviceMemory { kernel: String, buffer: String },

    #[error("transfer of {requested} bytes does not fit buffer '{buffer}' ({capacity} bytes)")]
    BufferTooSmall {
        buffer: String,
        requested: usize,
        capacity: usize,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KilnError {
    /// Create an error for a native call that returned a failure status.
    #[inline]
    pub fn native(call: impl Into<String>, code: i32) -> Self {
        Self::Native { call: call.into(), code }
    }

    /// Native status code, if this error came from the compute runtime.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error points at a defect in the kernel catalog.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::Catalog(_))
    }

    /// Whether a caller can reasonably react to this error and carry on.
    pub fn is_recoverable(&self) -> bool {
        !self.is_programming_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let catalog: KilnError = CatalogError::UnknownOwner {
            kernel: "useCtx".into(),
            owner: "ctxInit".into(),
        }
        .into();
        assert!(catalog.is_programming_error());
        assert!(!catalog.is_recoverable());

        let native = KilnError::native("clCreateBuffer", -4);
        assert!(native.is_recoverable());
        assert_eq!(native.status(), Some(-4));
        assert_eq!(KilnError::NoPlatform.status(), None);
    }

    #[test]
    fn test_error_display() {
        let err = CatalogError::ArityMismatch {
            kernel: "sha256GPU".into(),
            role: ArgRole::Input,
            names: 4,
            types: 3,
        };
        assert_eq!(
            err.to_string(),
            "kernel 'sha256GPU': 4 input names but 3 input types"
        );
        let err = KilnError::native("clFinish", -36);
        assert_eq!(err.to_string(), "clFinish failed with status -36");
        let err = KilnError::NoDevice { class: DeviceClass::Cpu };
        assert_eq!(err.to_string(), "no cpu device found on any platform");
    }
}
