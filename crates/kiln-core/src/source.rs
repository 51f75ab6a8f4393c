//! Kernel program sources.
//!
//! Sources are opaque text blobs looked up by kernel name: kernel `foo` is
//! compiled from a unit called `foo.cl`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{KilnError, Result};

/// File extension of kernel program sources.
pub const SOURCE_EXTENSION: &str = "cl";

/// Where kernel program sources come from.
pub trait SourceRepository {
    /// Load the program source for `kernel`.
    fn load(&self, kernel: &str) -> Result<String>;
}

/// Sources read from `<dir>/<kernel>.cl`.
#[derive(Debug, Clone)]
pub struct DirectorySources {
    dir: PathBuf,
}

impl DirectorySources {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kernel: &str) -> PathBuf {
        self.dir.join(format!("{kernel}.{SOURCE_EXTENSION}"))
    }
}

impl SourceRepository for DirectorySources {
    fn load(&self, kernel: &str) -> Result<String> {
        let path = self.path_for(kernel);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!("source file read: {}", path.display());
                Ok(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KilnError::SourceNotFound { kernel: kernel.to_string(), path })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Sources held in memory, keyed by kernel name.
#[derive(Debug, Clone, Default)]
pub struct InMemorySources {
    sources: HashMap<String, String>,
}

impl InMemorySources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.sources.insert(kernel.into(), source.into());
        self
    }

    pub fn with(mut self, kernel: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(kernel, source);
        self
    }
}

impl SourceRepository for InMemorySources {
    fn load(&self, kernel: &str) -> Result<String> {
        self.sources
            .get(kernel)
            .cloned()
            .ok_or_else(|| KilnError::SourceNotFound {
                kernel: kernel.to_string(),
                path: PathBuf::from(format!("{kernel}.{SOURCE_EXTENSION}")),
            })
    }
}
