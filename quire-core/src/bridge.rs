//! HierarchyBridge: hierarchy-aware metadata operations.
//!
//! Every read-modify-write of a record happens under that record's path
//! lock, so two local callers never interleave on the same path:
//!
//! ```text
//! update_file_metadata("a.md", patch)
//!   lock("a.md") ─► get ─► patch.apply_to ─► stamp modified_at ─► set ─► unlock
//! ```
//!
//! Composite operations (move, rename) are sequences of such single-path
//! steps. Only one lock is held at a time, so they cannot deadlock against
//! each other, but a concurrent peer can observe an intermediate state.
//! `contents` and `part_of` live in different records and are kept in step
//! by these operations only; [`HierarchyBridge::audit_hierarchy`] reports
//! where they have drifted apart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::lock::PathLocks;
use crate::path::normalize_path;
use crate::store::MetadataStore;
use crate::types::{now_millis, FileMetadata, MetadataPatch};

/// A `contents`/`part_of` inconsistency found by the audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyIssue {
    /// Listed in the contents of more than one live parent.
    MultipleParents { path: String, parents: Vec<String> },
    /// Claims a parent that does not list it.
    NotListedByParent { path: String, parent: String },
    /// Listed by `listed_by` but its `part_of` says otherwise.
    ParentMismatch {
        path: String,
        listed_by: String,
        part_of: Option<String>,
    },
    /// A contents entry pointing at a missing or deleted record.
    DanglingChild { parent: String, child: String },
}

pub struct HierarchyBridge {
    store: Arc<MetadataStore>,
    locks: PathLocks,
    initialized: AtomicBool,
}

impl HierarchyBridge {
    /// New bridge; unusable until [`HierarchyBridge::initialize`].
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            locks: PathLocks::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn initialize(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Refuse further calls and drop the lock table.
    pub fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.locks.release_all();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CoreError::NotInitialized)
        }
    }

    pub async fn get_file_metadata(&self, path: &str) -> Result<Option<FileMetadata>> {
        self.ensure_initialized()?;
        Ok(self.store.get(path))
    }

    /// Full overwrite. `modified_at` is refreshed.
    pub async fn set_file_metadata(
        &self,
        path: &str,
        metadata: FileMetadata,
    ) -> Result<FileMetadata> {
        self.ensure_initialized()?;
        let _guard = self.locks.acquire(path).await;
        let mut metadata = metadata;
        metadata.modified_at = now_millis();
        self.store.set(path, &metadata)?;
        Ok(metadata)
    }

    /// Merge `patch` over the current record (empty if absent).
    pub async fn update_file_metadata(
        &self,
        path: &str,
        patch: MetadataPatch,
    ) -> Result<FileMetadata> {
        self.ensure_initialized()?;
        self.modify(path, |meta| patch.apply_to(meta)).await
    }

    /// Read-modify-write under the path lock.
    async fn modify(
        &self,
        path: &str,
        f: impl FnOnce(&mut FileMetadata),
    ) -> Result<FileMetadata> {
        let _guard = self.locks.acquire(path).await;
        let mut meta = self.store.get(path).unwrap_or_default();
        f(&mut meta);
        meta.modified_at = now_millis();
        self.store.set(path, &meta)?;
        Ok(meta)
    }

    /// Like `modify`, but skips the write when `f` reports no change.
    async fn modify_if(
        &self,
        path: &str,
        f: impl FnOnce(&mut FileMetadata) -> bool,
    ) -> Result<bool> {
        let _guard = self.locks.acquire(path).await;
        let mut meta = self.store.get(path).unwrap_or_default();
        if !f(&mut meta) {
            return Ok(false);
        }
        meta.modified_at = now_millis();
        self.store.set(path, &meta)?;
        Ok(true)
    }

    /// Append `child` to `parent`'s contents unless already present.
    pub async fn add_to_contents(&self, parent: &str, child: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let child = normalize_path(child);
        self.modify_if(parent, |meta| {
            if meta.contents.iter().any(|c| normalize_path(c) == child) {
                return false;
            }
            meta.contents.push(child);
            true
        })
        .await
    }

    /// Remove `child` from `parent`'s contents if present.
    pub async fn remove_from_contents(&self, parent: &str, child: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let child = normalize_path(child);
        self.modify_if(parent, |meta| {
            let before = meta.contents.len();
            meta.contents.retain(|c| normalize_path(c) != child);
            meta.contents.len() != before
        })
        .await
    }

    /// Set the back-reference only. Pair with add/remove_from_contents.
    pub async fn set_part_of(&self, child: &str, parent: Option<&str>) -> Result<()> {
        self.ensure_initialized()?;
        let parent = parent.map(normalize_path);
        self.modify(child, |meta| meta.part_of = parent).await?;
        Ok(())
    }

    /// Reparent `path` under `new_parent`, renaming it to `new_path` if that differs.
    pub async fn move_file(
        &self,
        path: &str,
        new_parent: Option<&str>,
        new_path: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let path = normalize_path(path);
        let new_path = normalize_path(new_path);
        let new_parent = new_parent.map(normalize_path);
        let existing = self
            .store
            .get(&path)
            .ok_or_else(|| CoreError::MissingFile(path.clone()))?;

        if let Some(old_parent) = &existing.part_of {
            self.remove_from_contents(old_parent, &path).await?;
        }

        if new_path == path {
            self.set_part_of(&path, new_parent.as_deref()).await?;
        } else {
            let parent = new_parent.clone();
            self.relocate(&path, &new_path, move |meta| meta.part_of = parent)
                .await?;
        }

        if let Some(parent) = &new_parent {
            self.add_to_contents(parent, &new_path).await?;
        }

        log::debug!("moved {path} -> {new_path} (parent {new_parent:?})");
        Ok(())
    }

    /// Give `old` a new identity in place: same parent, same position.
    pub async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        self.ensure_initialized()?;
        let old = normalize_path(old);
        let new = normalize_path(new);
        if old == new {
            return Ok(());
        }
        let existing = self
            .store
            .get(&old)
            .ok_or_else(|| CoreError::MissingFile(old.clone()))?;

        self.relocate(&old, &new, |_| {}).await?;

        if let Some(parent) = &existing.part_of {
            let (old, new) = (old.clone(), new.clone());
            self.modify_if(parent, move |meta| {
                match meta.contents.iter().position(|c| normalize_path(c) == old) {
                    Some(idx) => meta.contents[idx] = new,
                    None if !meta.contents.contains(&new) => meta.contents.push(new),
                    None => return false,
                }
                true
            })
            .await?;
        }

        log::debug!("renamed {old} -> {new}");
        Ok(())
    }

    /// Copy the record to `new`, repoint children, tombstone `old`.
    async fn relocate(
        &self,
        old: &str,
        new: &str,
        adjust: impl FnOnce(&mut FileMetadata),
    ) -> Result<()> {
        let Some(mut copied) = self.store.get(old) else {
            return Err(CoreError::MissingFile(old.to_string()));
        };
        copied.deleted = false;
        adjust(&mut copied);
        let children = copied.contents.clone();
        self.modify(new, move |meta| *meta = copied).await?;

        for child in children {
            let (old, new) = (old.to_string(), new.to_string());
            self.modify_if(&child, move |meta| {
                if meta.part_of.as_deref().map(normalize_path) == Some(old) {
                    meta.part_of = Some(new);
                    true
                } else {
                    false
                }
            })
            .await?;
        }

        self.modify(old, |meta| meta.deleted = true).await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.modify(path, |meta| meta.deleted = true).await?;
        Ok(())
    }

    pub async fn restore_file(&self, path: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.modify(path, |meta| meta.deleted = false).await?;
        Ok(())
    }

    /// Clear everything but the tombstone. The record itself stays.
    pub async fn purge_file(&self, path: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.modify(path, |meta| {
            *meta = FileMetadata {
                deleted: true,
                ..FileMetadata::default()
            };
        })
        .await?;
        Ok(())
    }

    pub async fn list_files(&self, include_deleted: bool) -> Result<Vec<(String, FileMetadata)>> {
        self.ensure_initialized()?;
        Ok(self.store.list(include_deleted))
    }

    /// Report `contents`/`part_of` drift. Detection only, nothing is repaired.
    pub async fn audit_hierarchy(&self) -> Result<Vec<HierarchyIssue>> {
        self.ensure_initialized()?;
        let all: BTreeMap<String, FileMetadata> = self.store.list(true).into_iter().collect();
        let live = |path: &str| all.get(path).is_some_and(FileMetadata::is_live);

        let mut listed_by: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut issues = Vec::new();

        for (parent, meta) in all.iter().filter(|(_, m)| m.is_live()) {
            for child in &meta.contents {
                let child = normalize_path(child);
                if !live(&child) {
                    issues.push(HierarchyIssue::DanglingChild {
                        parent: parent.clone(),
                        child,
                    });
                    continue;
                }
                listed_by.entry(child).or_default().push(parent.clone());
            }
        }

        for (path, parents) in &listed_by {
            if parents.len() > 1 {
                issues.push(HierarchyIssue::MultipleParents {
                    path: path.clone(),
                    parents: parents.clone(),
                });
            }
            let part_of = all
                .get(path)
                .and_then(|m| m.part_of.as_deref())
                .map(normalize_path);
            for parent in parents {
                if part_of.as_deref() != Some(parent.as_str()) {
                    issues.push(HierarchyIssue::ParentMismatch {
                        path: path.clone(),
                        listed_by: parent.clone(),
                        part_of: part_of.clone(),
                    });
                }
            }
        }

        for (path, meta) in all.iter().filter(|(_, m)| m.is_live()) {
            let Some(parent) = meta.part_of.as_deref().map(normalize_path) else {
                continue;
            };
            let listed = listed_by
                .get(path)
                .is_some_and(|parents| parents.contains(&parent));
            if !listed {
                issues.push(HierarchyIssue::NotListedByParent {
                    path: path.clone(),
                    parent,
                });
            }
        }

        if !issues.is_empty() {
            log::warn!("hierarchy audit found {} issue(s)", issues.len());
        }
        Ok(issues)
    }
}
