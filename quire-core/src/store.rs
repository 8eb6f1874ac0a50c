//! MetadataStore: typed access to the workspace CRDT.
//!
//! No concurrency control beyond what the CRDT itself provides. Callers that
//! read-modify-write go through [`crate::bridge::HierarchyBridge`], which
//! serializes per path.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::crdt::{CrdtError, WorkspaceCrdt};
use crate::path::normalize_path;
use crate::types::FileMetadata;

/// A record changed, locally or through a remote merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataChange {
    pub path: String,
    /// New value (None if the record vanished, which a tombstoning CRDT never does).
    pub metadata: Option<FileMetadata>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Before/after pair for one path touched by a remote update.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub path: String,
    pub before: Option<FileMetadata>,
    pub after: Option<FileMetadata>,
}

pub struct MetadataStore {
    crdt: Arc<dyn WorkspaceCrdt>,
    changes: broadcast::Sender<MetadataChange>,
    local_updates: broadcast::Sender<Vec<u8>>,
}

impl MetadataStore {
    pub fn new(crdt: Arc<dyn WorkspaceCrdt>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (changes, _) = broadcast::channel(capacity);
        let (local_updates, _) = broadcast::channel(capacity);
        Self {
            crdt,
            changes,
            local_updates,
        }
    }

    pub fn crdt(&self) -> &Arc<dyn WorkspaceCrdt> {
        &self.crdt
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataChange> {
        self.changes.subscribe()
    }

    /// Encoded updates produced by local writes, for forwarding to peers.
    pub fn subscribe_local_updates(&self) -> broadcast::Receiver<Vec<u8>> {
        self.local_updates.subscribe()
    }

    pub fn get(&self, path: &str) -> Option<FileMetadata> {
        self.crdt.get_file(&normalize_path(path))
    }

    /// Overwrite the record and notify subscribers.
    pub fn set(&self, path: &str, metadata: &FileMetadata) -> Result<(), CrdtError> {
        let path = normalize_path(path);
        let update = self.crdt.set_file(&path, metadata)?;
        log::trace!("metadata set {path} ({} byte update)", update.len());

        let _ = self.local_updates.send(update);
        let _ = self.changes.send(MetadataChange {
            path,
            metadata: Some(metadata.clone()),
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    pub fn list(&self, include_deleted: bool) -> Vec<(String, FileMetadata)> {
        self.crdt.list_files(include_deleted)
    }

    /// Merge a remote update and report every path whose record changed.
    pub fn apply_remote(&self, update: &[u8]) -> Result<Vec<RemoteChange>, CrdtError> {
        let snapshot: std::collections::HashMap<String, FileMetadata> =
            self.crdt.list_files(true).into_iter().collect();

        let changed = self.crdt.apply_remote_update(update)?;
        let mut out = Vec::with_capacity(changed.len());
        for path in changed {
            let after = self.crdt.get_file(&path);
            let _ = self.changes.send(MetadataChange {
                path: path.clone(),
                metadata: after.clone(),
                origin: ChangeOrigin::Remote,
            });
            out.push(RemoteChange {
                before: snapshot.get(&path).cloned(),
                after,
                path,
            });
        }
        Ok(out)
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.crdt.get_full_state()
    }

    pub fn save(&self) -> Result<(), CrdtError> {
        self.crdt.save_crdt_state()
    }

    pub fn create_sync_step1(&self) -> Vec<u8> {
        self.crdt.create_sync_step1()
    }

    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        self.crdt.encode_diff(state_vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsWorkspace;

    fn store() -> MetadataStore {
        MetadataStore::new(Arc::new(YrsWorkspace::new()), 16)
    }

    #[test]
    fn test_paths_are_normalized() {
        let store = store();
        store
            .set("./README.md", &FileMetadata::with_title("Readme"))
            .unwrap();
        assert!(store.get("README.md").is_some());
        assert!(store.get("/README.md").is_some());
    }

    #[test]
    fn test_local_set_notifies() {
        let store = store();
        let mut changes = store.subscribe();
        let mut updates = store.subscribe_local_updates();

        store.set("a.md", &FileMetadata::with_title("A")).unwrap();

        let change = changes.try_recv().unwrap();
        assert_eq!(change.path, "a.md");
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert!(!updates.try_recv().unwrap().is_empty());
    }

    #[test]
    fn test_apply_remote_reports_before_and_after() {
        let a = store();
        let b = store();
        b.set("x.md", &FileMetadata::with_title("old")).unwrap();
        a.apply_remote(&b.full_state()).unwrap();

        let mut updates = b.subscribe_local_updates();
        b.set("x.md", &FileMetadata::with_title("new")).unwrap();
        let update = updates.try_recv().unwrap();

        let mut changes = a.subscribe();
        let applied = a.apply_remote(&update).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].before.as_ref().unwrap().title.as_deref(), Some("old"));
        assert_eq!(applied[0].after.as_ref().unwrap().title.as_deref(), Some("new"));
        assert_eq!(changes.try_recv().unwrap().origin, ChangeOrigin::Remote);
    }
}
