//! Local disk backend rooted at the workspace directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{FileSystem, FsError};
use crate::path::normalize_path;

/// Directory under the root holding engine state; never enumerated.
pub const STATE_DIR: &str = ".quire";

pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(normalize_path(path))
    }

    async fn ensure_parent(&self, full: &Path, path: &str) -> Result<(), FsError> {
        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| FsError::io(path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for DiskFs {
    async fn read(&self, path: &str) -> Result<String, FsError> {
        tokio::fs::read_to_string(self.resolve(path))
            .await
            .map_err(|e| FsError::io(path, e))
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), FsError> {
        let full = self.resolve(path);
        self.ensure_parent(&full, path).await?;
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| FsError::io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let target = self.resolve(to);
        self.ensure_parent(&target, to).await?;
        tokio::fs::rename(self.resolve(from), &target)
            .await
            .map_err(|e| FsError::io(from, e))
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| FsError::io(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool, FsError> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| FsError::io(path, e))
    }

    async fn enumerate(&self) -> Result<Vec<String>, FsError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::io(&dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| FsError::io(&dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| FsError::io(&path.display().to_string(), e))?;
                if file_type.is_dir() {
                    if entry.file_name() != STATE_DIR {
                        pending.push(path);
                    }
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(normalize_path(&relative.to_string_lossy()));
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
