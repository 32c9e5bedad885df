//! Filesystem File Store
//!
//! [`FileStorePort`] rooted at a local directory. Writes land in a
//! temporary sibling first and are renamed into place, so readers never
//! observe a partially written file.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;

use crate::application::ports::{FileStoreError, FileStorePort};

/// Local-directory file store.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    root: PathBuf,
}

impl FsFileStore {
    /// Store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root.
    ///
    /// Absolute paths and `..` components are rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(FileStoreError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> FileStoreError {
    FileStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl FileStorePort for FsFileStore {
    async fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&full, e)),
        }
    }

    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        let full = self.resolve(path)?;
        let Some(parent) = full.parent() else {
            return Err(FileStoreError::InvalidPath {
                path: path.to_string(),
            });
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;

        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix: u64 = rand::rng().random();
        let temp = parent.join(format!(".{file_name}.{suffix:016x}.tmp"));

        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&temp, e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &full).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&full, e));
        }
        Ok(())
    }
}
