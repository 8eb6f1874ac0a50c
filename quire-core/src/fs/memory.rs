//! In-memory backend: guest sessions, tests, and eventually-consistent
//! storage simulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FileSystem, FsError};
use crate::path::normalize_path;

#[derive(Default)]
pub struct MemoryFs {
    files: RwLock<BTreeMap<String, String>>,
    /// Injected rename failures keyed by source path.
    rename_faults: Mutex<HashMap<String, Vec<FsError>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let fs = Self::new();
        {
            let mut map = fs.files.write().await;
            for (path, content) in files {
                map.insert(normalize_path(path), content.to_string());
            }
        }
        fs
    }

    /// Make the next renames of `from` fail with `errors`, in order, while
    /// the file still reports as existing.
    pub fn inject_rename_failures(&self, from: &str, errors: Vec<FsError>) {
        let mut faults = self.rename_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(normalize_path(from), errors);
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.read().await.clone()
    }

    fn take_fault(&self, from: &str) -> Option<FsError> {
        let mut faults = self.rename_faults.lock().unwrap_or_else(|e| e.into_inner());
        let queue = faults.get_mut(from)?;
        let err = (!queue.is_empty()).then(|| queue.remove(0));
        if queue.is_empty() {
            faults.remove(from);
        }
        err
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn read(&self, path: &str) -> Result<String, FsError> {
        let key = normalize_path(path);
        self.files
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(FsError::NotFound(key))
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), FsError> {
        self.files
            .write()
            .await
            .insert(normalize_path(path), content.to_string());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from = normalize_path(from);
        if let Some(err) = self.take_fault(&from) {
            return Err(err);
        }
        let mut files = self.files.write().await;
        let content = files
            .remove(&from)
            .ok_or_else(|| FsError::NotFound(from.clone()))?;
        files.insert(normalize_path(to), content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        let key = normalize_path(path);
        self.files
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or(FsError::NotFound(key))
    }

    async fn exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.files.read().await.contains_key(&normalize_path(path)))
    }

    async fn enumerate(&self) -> Result<Vec<String>, FsError> {
        Ok(self.files.read().await.keys().cloned().collect())
    }
}
