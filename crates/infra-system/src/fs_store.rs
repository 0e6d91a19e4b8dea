// Filesystem descriptor store
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use jobwatch_core::domain::DescriptorFlags;
use jobwatch_core::port::{DescriptorError, DescriptorStore};

/// Descriptor files on the local filesystem (tokio::fs)
#[derive(Debug, Default, Clone)]
pub struct FsDescriptorStore;

impl FsDescriptorStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DescriptorStore for FsDescriptorStore {
    async fn ensure_dir(&self, dir: &Path) -> Result<PathBuf, DescriptorError> {
        let list_error = |e: std::io::Error| DescriptorError::List {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(dir).await.map_err(list_error)?;
        tokio::fs::canonicalize(dir).await.map_err(list_error)
    }

    async fn list(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DescriptorError> {
        let list_error = |e: std::io::Error| DescriptorError::List {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(list_error)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            match entry.file_type().await {
                Ok(kind) if kind.is_file() => files.push(path),
                // a symlink to a file counts as a file
                Ok(kind) if kind.is_symlink() => {
                    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
                        files.push(path);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    async fn read_flags(&self, path: &Path) -> Result<DescriptorFlags, DescriptorError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DescriptorError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        DescriptorFlags::from_json(&bytes).map_err(|e| DescriptorError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove(&self, path: &Path) -> Result<(), DescriptorError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| DescriptorError::Remove {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}
