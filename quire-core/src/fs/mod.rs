//! Filesystem capability and the sync-aware decorator.
//!
//! ```text
//!        callers (editor, importer, SyncEngine)
//!                    │
//!            ┌───────▼────────┐  events, CRDT mutation,
//!            │ SyncFileSystem │  sync-write suppression,
//!            └───────┬────────┘  safe-write swap recovery
//!                    │ dyn FileSystem
//!          ┌─────────┴─────────┐
//!      ┌───▼────┐          ┌───▼───┐
//!      │ DiskFs │          │MemoryFs│
//!      └────────┘          └───────┘
//! ```

mod disk;
mod memory;
mod sync_fs;

pub use disk::DiskFs;
pub use memory::MemoryFs;
pub use sync_fs::{SyncFileSystem, SyncWriteGuard};
pub(crate) use sync_fs::classify;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(String),
}

impl FsError {
    pub fn io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            std::io::ErrorKind::InvalidData => FsError::InvalidUtf8(path.to_string()),
            _ => FsError::Io {
                path: path.to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

/// Raw storage consumed by [`SyncFileSystem`]. Paths are workspace-relative.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, FsError>;

    /// Create or overwrite, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<(), FsError>;

    /// Move `from` to `to`, replacing `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    async fn delete(&self, path: &str) -> Result<(), FsError>;

    async fn exists(&self, path: &str) -> Result<bool, FsError>;

    /// Every file in the workspace, sorted.
    async fn enumerate(&self) -> Result<Vec<String>, FsError>;
}
