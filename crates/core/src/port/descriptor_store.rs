// Descriptor Store Port (Interface)
// Access to the watched directory and the descriptor files in it

use crate::domain::DescriptorFlags;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Cannot list {path}: {reason}")]
    List { path: PathBuf, reason: String },

    #[error("Cannot read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Cannot remove {path}: {reason}")]
    Remove { path: PathBuf, reason: String },
}

#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Create `dir` if absent and return its absolute form
    async fn ensure_dir(&self, dir: &Path) -> Result<PathBuf, DescriptorError>;

    /// Absolute paths of the files in `dir` with `extension`, sorted by name
    async fn list(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DescriptorError>;

    /// Read the supervisor-interpreted flags of one descriptor
    async fn read_flags(&self, path: &Path) -> Result<DescriptorFlags, DescriptorError>;

    async fn exists(&self, path: &Path) -> bool;

    async fn remove(&self, path: &Path) -> Result<(), DescriptorError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory directory tree of descriptor files
    #[derive(Default)]
    pub struct InMemoryDescriptorStore {
        files: Mutex<BTreeMap<PathBuf, String>>,
        failing_lists: AtomicUsize,
        list_calls: AtomicUsize,
        fail_removals: AtomicBool,
    }

    impl InMemoryDescriptorStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, path: impl Into<PathBuf>, contents: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(path.into(), contents.to_string());
        }

        pub fn contains(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }

        /// Delete a file behind the supervisor's back
        pub fn remove_externally(&self, path: &Path) {
            self.files.lock().unwrap().remove(path);
        }

        /// The next `count` list calls fail
        pub fn fail_next_lists(&self, count: usize) {
            self.failing_lists.store(count, Ordering::SeqCst);
        }

        pub fn fail_removals(&self, fail: bool) {
            self.fail_removals.store(fail, Ordering::SeqCst);
        }

        pub fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DescriptorStore for InMemoryDescriptorStore {
        async fn ensure_dir(&self, dir: &Path) -> Result<PathBuf, DescriptorError> {
            Ok(dir.to_path_buf())
        }

        async fn list(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DescriptorError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_lists.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_lists.store(failing - 1, Ordering::SeqCst);
                return Err(DescriptorError::List {
                    path: dir.to_path_buf(),
                    reason: "simulated I/O error".to_string(),
                });
            }

            Ok(self
                .files
                .lock()
                .unwrap()
                .keys()
                .filter(|p| p.parent() == Some(dir))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
                .cloned()
                .collect())
        }

        async fn read_flags(&self, path: &Path) -> Result<DescriptorFlags, DescriptorError> {
            let contents = self.files.lock().unwrap().get(path).cloned().ok_or_else(|| {
                DescriptorError::Read {
                    path: path.to_path_buf(),
                    reason: "No such file or directory".to_string(),
                }
            })?;
            DescriptorFlags::from_json(contents.as_bytes()).map_err(|e| DescriptorError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }

        async fn exists(&self, path: &Path) -> bool {
            self.contains(path)
        }

        async fn remove(&self, path: &Path) -> Result<(), DescriptorError> {
            if self.fail_removals.load(Ordering::SeqCst) {
                return Err(DescriptorError::Remove {
                    path: path.to_path_buf(),
                    reason: "Permission denied".to_string(),
                });
            }
            match self.files.lock().unwrap().remove(path) {
                Some(_) => Ok(()),
                None => Err(DescriptorError::Remove {
                    path: path.to_path_buf(),
                    reason: "No such file or directory".to_string(),
                }),
            }
        }
    }
}
