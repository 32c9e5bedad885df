//! File Store Port (Driven Port)
//!
//! Whole-file byte storage addressed by relative path.

use async_trait::async_trait;

/// File store error.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    /// The path escapes the store root or is otherwise unusable.
    #[error("invalid path '{path}'")]
    InvalidPath {
        /// Offending path.
        path: String,
    },

    /// An I/O operation failed.
    #[error("I/O error on '{path}'")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Port for reading and writing whole files.
#[async_trait]
pub trait FileStorePort: Send + Sync {
    /// Read a file. `Ok(None)` when it does not exist.
    async fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, FileStoreError>;

    /// Replace a file's contents, creating parent directories as needed.
    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError>;
}
