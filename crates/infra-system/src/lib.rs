// jobwatch Infrastructure - System Adapters
// Implements: ProcessBackend (pipe, pty), DescriptorStore

pub mod fs_store;
pub mod manifest_probe;
pub mod pipe_backend;
pub mod pty_backend;

pub use fs_store::FsDescriptorStore;
pub use manifest_probe::{ConfiguredBrowser, ManifestProbe, DEFAULT_HOST_NAME};
pub use pipe_backend::PipeBackend;
pub use pty_backend::PtyBackend;

use jobwatch_core::port::ProcessBackend;
use std::sync::Arc;

/// Backend selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Pipe,
    Pty,
}

impl BackendKind {
    /// Pseudo-terminal on Unix, pipes on Windows
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            BackendKind::Pty
        } else {
            BackendKind::Pipe
        }
    }

    pub fn build(self) -> Arc<dyn ProcessBackend> {
        match self {
            BackendKind::Pipe => Arc::new(PipeBackend::new()),
            BackendKind::Pty => Arc::new(PtyBackend::new()),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pipe" => Ok(BackendKind::Pipe),
            "pty" => Ok(BackendKind::Pty),
            other => Err(format!("unknown backend '{other}' (expected pipe or pty)")),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Pipe => write!(f, "pipe"),
            BackendKind::Pty => write!(f, "pty"),
        }
    }
}
