//! SyncFileSystem: the decorator that turns file operations into CRDT
//! mutations and change events, without echoing sync-originated writes.
//!
//! A write that comes from applying a remote update is bracketed:
//!
//! ```text
//! mark_sync_write_start("a.md")     ◄── SyncEngine applying a remote update
//!   write_file / move_file / delete_file on "a.md"
//!     → storage only: no CRDT mutation, no event
//! mark_sync_write_end("a.md")
//! ```
//!
//! The bracket is a counter per normalized path, so nested brackets on the
//! same path behave. [`SyncFileSystem::sync_write`] returns a guard that
//! closes the bracket on drop.
//!
//! Every note write goes through the safe-write swap
//! `path.tmp ─write─► path ─move─► path.bak, path.tmp ─move─► path`. A backup
//! move that fails with `NotFound` right after `exists` said yes is a storage
//! race and is retried, then falls back to a direct overwrite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bridge::HierarchyBridge;
use crate::crdt::BodyDocs;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, FileEvent};
use crate::frontmatter::{self, Frontmatter};
use crate::path::{file_name, is_markdown, is_temp_artifact, normalize_path, parent_dir};
use crate::types::FileMetadata;

use super::{FileSystem, FsError};

/// Names that mark a directory's index note, in preference order.
const INDEX_NAMES: &[&str] = &["index.md", "README.md", "_index.md"];

pub struct SyncFileSystem {
    inner: Arc<dyn FileSystem>,
    bridge: Arc<HierarchyBridge>,
    bodies: Arc<BodyDocs>,
    events: Arc<EventBus>,
    suppressed: Mutex<HashMap<String, usize>>,
}

impl SyncFileSystem {
    pub fn new(
        inner: Arc<dyn FileSystem>,
        bridge: Arc<HierarchyBridge>,
        bodies: Arc<BodyDocs>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner,
            bridge,
            bodies,
            events,
            suppressed: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn FileSystem> {
        &self.inner
    }

    pub fn mark_sync_write_start(&self, path: &str) {
        let mut suppressed = self.suppressed.lock().unwrap_or_else(|e| e.into_inner());
        *suppressed.entry(normalize_path(path)).or_insert(0) += 1;
    }

    pub fn mark_sync_write_end(&self, path: &str) {
        let key = normalize_path(path);
        let mut suppressed = self.suppressed.lock().unwrap_or_else(|e| e.into_inner());
        match suppressed.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                suppressed.remove(&key);
            }
            None => log::warn!("mark_sync_write_end without matching start for {key}"),
        }
    }

    pub fn is_sync_write(&self, path: &str) -> bool {
        let suppressed = self.suppressed.lock().unwrap_or_else(|e| e.into_inner());
        suppressed.contains_key(&normalize_path(path))
    }

    /// Open a sync-write bracket that closes when the guard drops.
    pub fn sync_write(self: &Arc<Self>, path: &str) -> SyncWriteGuard {
        self.mark_sync_write_start(path);
        SyncWriteGuard {
            fs: Arc::clone(self),
            path: normalize_path(path),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.bridge.is_initialized() {
            Ok(())
        } else {
            Err(CoreError::NotInitialized)
        }
    }

    /// Whether an operation on `path` should stay storage-only.
    fn storage_only(&self, path: &str) -> bool {
        is_temp_artifact(path) || self.is_sync_write(path)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        Ok(self.inner.read(path).await?)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.inner.exists(path).await?)
    }

    pub async fn enumerate(&self) -> Result<Vec<String>> {
        Ok(self.inner.enumerate().await?)
    }

    /// Write a note. Frontmatter becomes the record, the rest the body.
    ///
    /// Only markdown files carry a record. Anything else (attachment bytes,
    /// images) is stored untracked: no record, no event, and so no event on
    /// a later move or delete either.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.ensure_initialized()?;
        let path = normalize_path(path);
        if self.storage_only(&path) {
            return self.store_bytes(&path, content).await;
        }

        let parsed = if is_markdown(&path) {
            Some(frontmatter::parse(content)?)
        } else {
            None
        };
        self.store_bytes(&path, content).await?;

        let Some(parsed) = parsed else {
            return Ok(());
        };
        let existing = self.bridge.get_file_metadata(&path).await?;
        let patch = parsed.frontmatter.into_patch();

        let unchanged = existing.as_ref().is_some_and(|current| {
            let mut candidate = current.clone();
            patch.clone().apply_to(&mut candidate);
            candidate.same_content_as(current)
        });
        let updated = if unchanged {
            existing.clone()
        } else {
            Some(self.bridge.update_file_metadata(&path, patch).await?)
        };
        self.bodies.set_body(&path, &parsed.body);

        if let Some(updated) = updated {
            if let Some(event) = classify(&path, existing.as_ref(), &updated) {
                self.events.emit(event);
            }
        }
        Ok(())
    }

    /// Overwrite a note's frontmatter, keeping its body.
    pub async fn write_metadata(&self, path: &str, metadata: &FileMetadata) -> Result<()> {
        self.ensure_initialized()?;
        let path = normalize_path(path);

        let body = match self.inner.read(&path).await {
            Ok(content) => frontmatter::parse(&content)
                .map(|parsed| parsed.body)
                .unwrap_or(content),
            Err(FsError::NotFound(_)) => self.bodies.body(&path),
            Err(e) => return Err(e.into()),
        };
        let content = frontmatter::render(&Frontmatter::from_metadata(metadata), &body)?;
        self.store_bytes(&path, &content).await?;

        if self.storage_only(&path) {
            return Ok(());
        }
        let existing = self.bridge.get_file_metadata(&path).await?;
        let stored = self
            .bridge
            .set_file_metadata(&path, metadata.clone())
            .await?;
        if let Some(event) = classify(&path, existing.as_ref(), &stored) {
            self.events.emit(event);
        }
        Ok(())
    }

    /// Delete from storage and tombstone the record.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.ensure_initialized()?;
        let path = normalize_path(path);
        if self.storage_only(&path) {
            return Ok(self.inner.delete(&path).await?);
        }

        match self.inner.delete(&path).await {
            Ok(()) => {}
            // Tracked but already gone from storage: still tombstone it.
            Err(FsError::NotFound(_)) if self.bridge.store().get(&path).is_some() => {}
            Err(e) => return Err(e.into()),
        }

        let Some(existing) = self.bridge.get_file_metadata(&path).await? else {
            return Ok(());
        };
        if let Some(parent) = &existing.part_of {
            if self.bridge.remove_from_contents(parent, &path).await? {
                self.rewrite_from_record(parent).await?;
            }
        }
        self.bridge.delete_file(&path).await?;
        self.bodies.forget(&path);
        self.events.emit(FileEvent::FileDeleted { path });
        Ok(())
    }

    /// Move in storage; same directory is a rename, otherwise a reparent.
    pub async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_initialized()?;
        let from = normalize_path(from);
        let to = normalize_path(to);
        self.inner.rename(&from, &to).await?;

        if self.storage_only(&from) || self.storage_only(&to) {
            return Ok(());
        }
        let Some(existing) = self.bridge.get_file_metadata(&from).await? else {
            return Ok(());
        };

        let body = self.bodies.body(&from);
        if parent_dir(&from) == parent_dir(&to) {
            self.bridge.rename_file(&from, &to).await?;
            self.carry_body(&from, &to, &body);
            if let Some(parent) = &existing.part_of {
                self.rewrite_from_record(parent).await?;
            }
            for child in &existing.contents {
                self.rewrite_from_record(child).await?;
            }
            self.events.emit(FileEvent::FileRenamed {
                old_path: from,
                new_path: to,
            });
        } else {
            let new_parent = self.index_for(&parent_dir(&to), &to).await?;
            self.bridge
                .move_file(&from, new_parent.as_deref(), &to)
                .await?;
            self.carry_body(&from, &to, &body);
            let touched = existing
                .part_of
                .iter()
                .chain(new_parent.iter())
                .chain(existing.contents.iter())
                .cloned()
                .chain(std::iter::once(to.clone()));
            for path in touched.collect::<Vec<_>>() {
                self.rewrite_from_record(&path).await?;
            }
            self.events.emit(FileEvent::FileMoved {
                path: to,
                old_parent: existing.part_of,
                new_parent,
            });
        }
        Ok(())
    }

    /// Re-render a note's frontmatter from its record after a hierarchy
    /// change, storage-only.
    async fn rewrite_from_record(&self, path: &str) -> Result<()> {
        let Some(meta) = self.bridge.store().get(path) else {
            return Ok(());
        };
        if meta.deleted || !self.inner.exists(path).await? {
            return Ok(());
        }
        self.mark_sync_write_start(path);
        let result = self.write_metadata(path, &meta).await;
        self.mark_sync_write_end(path);
        result
    }

    fn carry_body(&self, from: &str, to: &str, body: &str) {
        if !body.is_empty() {
            self.bodies.set_body(to, body);
        }
        self.bodies.forget(from);
    }

    /// The index note of `dir`, if it has one (never `exclude` itself).
    async fn index_for(&self, dir: &str, exclude: &str) -> Result<Option<String>> {
        let candidates: Vec<(String, FileMetadata)> = self
            .bridge
            .list_files(false)
            .await?
            .into_iter()
            .filter(|(path, _)| path != exclude && parent_dir(path) == dir)
            .collect();

        let by_name = INDEX_NAMES.iter().find_map(|name| {
            candidates
                .iter()
                .find(|(path, _)| file_name(path) == *name)
                .map(|(path, _)| path.clone())
        });
        Ok(by_name.or_else(|| {
            candidates
                .iter()
                .find(|(_, meta)| !meta.contents.is_empty())
                .map(|(path, _)| path.clone())
        }))
    }

    /// Write bytes to storage, via the safe-write swap for regular paths.
    async fn store_bytes(&self, path: &str, content: &str) -> Result<()> {
        if is_temp_artifact(path) {
            return Ok(self.inner.write(path, content).await?);
        }
        self.safe_write(path, content).await
    }

    async fn safe_write(&self, path: &str, content: &str) -> Result<()> {
        let tmp = format!("{path}.tmp");
        let bak = format!("{path}.bak");

        self.inner.write(&tmp, content).await?;

        let mut attempts = 0;
        let backed_up = loop {
            if !self.inner.exists(path).await? {
                break false;
            }
            match self.inner.rename(path, &bak).await {
                Ok(()) => break true,
                Err(FsError::NotFound(_)) if attempts == 0 => {
                    log::warn!("backup move of {path} raced with storage, retrying");
                    attempts += 1;
                }
                Err(FsError::NotFound(_)) => {
                    log::warn!("backup move of {path} still racing, overwriting directly");
                    self.inner.write(path, content).await?;
                    self.discard(&tmp).await;
                    return Ok(());
                }
                Err(e) => {
                    self.discard(&tmp).await;
                    return Err(e.into());
                }
            }
        };

        self.inner.rename(&tmp, path).await?;
        if backed_up {
            self.discard(&bak).await;
        }
        Ok(())
    }

    async fn discard(&self, path: &str) {
        match self.inner.delete(path).await {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(e) => log::warn!("failed to remove swap artifact {path}: {e}"),
        }
    }
}

/// The single event describing how `before` became `after`.
pub(crate) fn classify(
    path: &str,
    before: Option<&FileMetadata>,
    after: &FileMetadata,
) -> Option<FileEvent> {
    let path = path.to_string();
    match before {
        None if after.deleted => None,
        None => Some(FileEvent::FileCreated {
            path,
            metadata: after.clone(),
        }),
        Some(before) if before.deleted && !after.deleted => Some(FileEvent::FileCreated {
            path,
            metadata: after.clone(),
        }),
        Some(before) if !before.deleted && after.deleted => Some(FileEvent::FileDeleted { path }),
        Some(before) if before.contents != after.contents => Some(FileEvent::ContentsChanged {
            path,
            contents: after.contents.clone(),
        }),
        Some(before) if !before.same_content_as(after) => Some(FileEvent::MetadataChanged {
            path,
            metadata: after.clone(),
        }),
        Some(_) => None,
    }
}

/// Open sync-write bracket; dropping it calls `mark_sync_write_end`.
pub struct SyncWriteGuard {
    fs: Arc<SyncFileSystem>,
    path: String,
}

impl SyncWriteGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for SyncWriteGuard {
    fn drop(&mut self) {
        self.fs.mark_sync_write_end(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsWorkspace;
    use crate::fs::MemoryFs;
    use crate::store::MetadataStore;

    struct Fixture {
        fs: Arc<SyncFileSystem>,
        raw: Arc<MemoryFs>,
        bridge: Arc<HierarchyBridge>,
        bodies: Arc<BodyDocs>,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let raw = Arc::new(MemoryFs::new());
        let store = Arc::new(MetadataStore::new(Arc::new(YrsWorkspace::new()), 64));
        let bridge = Arc::new(HierarchyBridge::new(store));
        bridge.initialize();
        let bodies = Arc::new(BodyDocs::new(64));
        let events = Arc::new(EventBus::new(64));
        let fs = Arc::new(SyncFileSystem::new(
            raw.clone(),
            Arc::clone(&bridge),
            Arc::clone(&bodies),
            Arc::clone(&events),
        ));
        Fixture {
            fs,
            raw,
            bridge,
            bodies,
            events,
        }
    }

    #[tokio::test]
    async fn test_unbracketed_write_mutates_and_emits() {
        let f = fixture();
        let mut sub = f.events.subscribe();
        let mut updates = f.bridge.store().subscribe_local_updates();

        f.fs
            .write_file("README.md", "+++\ntitle = \"Readme\"\n+++\nHello")
            .await
            .unwrap();

        assert!(updates.try_recv().is_ok());
        match sub.try_recv() {
            Some(FileEvent::FileCreated { path, metadata }) => {
                assert_eq!(path, "README.md");
                assert_eq!(metadata.title.as_deref(), Some("Readme"));
            }
            other => panic!("expected FileCreated, got {other:?}"),
        }
        assert_eq!(f.bodies.body("README.md"), "Hello");
    }

    #[tokio::test]
    async fn test_bracketed_write_is_silent() {
        let f = fixture();
        let mut sub = f.events.subscribe();
        let mut updates = f.bridge.store().subscribe_local_updates();

        f.fs.mark_sync_write_start("./README.md");
        f.fs
            .write_file("/README.md", "+++\ntitle = \"Readme\"\n+++\nHello")
            .await
            .unwrap();
        f.fs.mark_sync_write_end("README.md");

        assert!(updates.try_recv().is_err());
        assert!(sub.try_recv().is_none());
        assert!(f.bridge.store().get("README.md").is_none());
        assert!(f.raw.exists("README.md").await.unwrap());
        assert!(!f.fs.is_sync_write("README.md"));
    }

    #[tokio::test]
    async fn test_guard_brackets_move_and_delete() {
        let f = fixture();
        f.fs.write_file("a.md", "+++\ntitle = \"A\"\n+++\n").await.unwrap();
        let mut sub = f.events.subscribe();

        {
            let _a = f.fs.sync_write("a.md");
            let _b = f.fs.sync_write("b.md");
            f.fs.move_file("a.md", "b.md").await.unwrap();
            f.fs.delete_file("b.md").await.unwrap();
        }

        assert!(sub.try_recv().is_none());
        assert!(!f.bridge.store().get("a.md").unwrap().deleted);
        assert!(!f.fs.is_sync_write("a.md"));
    }

    #[tokio::test]
    async fn test_temp_artifacts_are_ignored() {
        let f = fixture();
        let mut sub = f.events.subscribe();
        f.fs.write_file("notes/a.md.tmp", "+++\ntitle = 1\n+++").await.unwrap();
        f.fs.move_file("notes/a.md.tmp", "notes/a.md.bak").await.unwrap();
        f.fs.delete_file("notes/a.md.bak").await.unwrap();
        assert!(sub.try_recv().is_none());
        assert!(f.bridge.store().list(true).is_empty());
    }

    #[tokio::test]
    async fn test_untracked_files_stay_silent_through_their_lifecycle() {
        let f = fixture();
        let mut sub = f.events.subscribe();
        f.fs.write_file("assets/photo.png", "bytes").await.unwrap();
        f.fs
            .move_file("assets/photo.png", "assets/cover.png")
            .await
            .unwrap();
        assert_eq!(f.fs.read_file("assets/cover.png").await.unwrap(), "bytes");
        f.fs.delete_file("assets/cover.png").await.unwrap();

        assert!(sub.try_recv().is_none());
        assert!(f.bridge.store().list(true).is_empty());
        assert!(!f.fs.exists("assets/cover.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_change_events_are_typed() {
        let f = fixture();
        f.fs.write_file("index.md", "+++\ntitle = \"I\"\n+++\n").await.unwrap();
        let mut sub = f.events.subscribe();

        f.fs
            .write_file("index.md", "+++\ntitle = \"I\"\ncontents = [\"a.md\"]\n+++\n")
            .await
            .unwrap();
        assert!(matches!(sub.try_recv(), Some(FileEvent::ContentsChanged { contents, .. }) if contents == vec!["a.md".to_string()]));

        f.fs
            .write_file("index.md", "+++\ntitle = \"Index\"\ncontents = [\"a.md\"]\n+++\n")
            .await
            .unwrap();
        assert!(matches!(sub.try_recv(), Some(FileEvent::MetadataChanged { .. })));

        // Body-only edit: no metadata event.
        f.fs
            .write_file("index.md", "+++\ntitle = \"Index\"\ncontents = [\"a.md\"]\n+++\nnew body")
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(f.bodies.body("index.md"), "new body");
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_unlists() {
        let f = fixture();
        f.fs
            .write_file("index.md", "+++\ncontents = [\"a.md\"]\n+++\n")
            .await
            .unwrap();
        f.fs
            .write_file("a.md", "+++\npart_of = \"index.md\"\n+++\n")
            .await
            .unwrap();
        let mut sub = f.events.subscribe();

        f.fs.delete_file("a.md").await.unwrap();

        assert_eq!(sub.try_recv(), Some(FileEvent::FileDeleted { path: "a.md".into() }));
        assert!(f.bridge.store().get("a.md").unwrap().deleted);
        assert!(f.bridge.store().get("index.md").unwrap().contents.is_empty());
        assert!(!f.raw.exists("a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_same_dir_is_rename() {
        let f = fixture();
        f.fs.write_file("notes/a.md", "+++\ntitle = \"A\"\n+++\nbody").await.unwrap();
        let mut sub = f.events.subscribe();

        f.fs.move_file("notes/a.md", "notes/b.md").await.unwrap();

        assert_eq!(
            sub.try_recv(),
            Some(FileEvent::FileRenamed {
                old_path: "notes/a.md".into(),
                new_path: "notes/b.md".into(),
            })
        );
        assert!(f.bridge.store().get("notes/a.md").unwrap().deleted);
        assert_eq!(f.bodies.body("notes/b.md"), "body");
    }

    #[tokio::test]
    async fn test_move_across_dirs_reparents_under_index() {
        let f = fixture();
        f.fs
            .write_file("archive/index.md", "+++\ntitle = \"Archive\"\n+++\n")
            .await
            .unwrap();
        f.fs.write_file("inbox/a.md", "+++\ntitle = \"A\"\n+++\n").await.unwrap();
        let mut sub = f.events.subscribe();

        f.fs.move_file("inbox/a.md", "archive/a.md").await.unwrap();

        assert_eq!(
            sub.try_recv(),
            Some(FileEvent::FileMoved {
                path: "archive/a.md".into(),
                old_parent: None,
                new_parent: Some("archive/index.md".into()),
            })
        );
        assert_eq!(
            f.bridge.store().get("archive/index.md").unwrap().contents,
            vec!["archive/a.md".to_string()]
        );
        // The index note on disk lists the moved file too.
        let index = frontmatter::parse(&f.raw.read("archive/index.md").await.unwrap()).unwrap();
        assert_eq!(index.frontmatter.contents, vec!["archive/a.md".to_string()]);
        let moved = frontmatter::parse(&f.raw.read("archive/a.md").await.unwrap()).unwrap();
        assert_eq!(moved.frontmatter.part_of.as_deref(), Some("archive/index.md"));
    }

    #[tokio::test]
    async fn test_safe_write_recovers_from_backup_race() {
        let f = fixture();
        f.raw.write("a.md", "old").await.unwrap();
        f.raw.inject_rename_failures(
            "a.md",
            vec![FsError::NotFound("a.md".into()), FsError::NotFound("a.md".into())],
        );

        f.fs.write_file("a.md", "new").await.unwrap();

        assert_eq!(f.raw.read("a.md").await.unwrap(), "new");
        assert_eq!(f.raw.enumerate().await.unwrap(), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_safe_write_single_race_retries_swap() {
        let f = fixture();
        f.raw.write("a.md", "old").await.unwrap();
        f.raw
            .inject_rename_failures("a.md", vec![FsError::NotFound("a.md".into())]);

        f.fs.write_file("a.md", "new").await.unwrap();

        assert_eq!(f.raw.read("a.md").await.unwrap(), "new");
        assert_eq!(f.raw.enumerate().await.unwrap(), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_safe_write_propagates_other_errors() {
        let f = fixture();
        f.raw.write("a.md", "old").await.unwrap();
        f.raw.inject_rename_failures(
            "a.md",
            vec![FsError::Io {
                path: "a.md".into(),
                message: "disk full".into(),
            }],
        );

        let err = f.fs.write_file("a.md", "new").await.unwrap_err();
        assert!(matches!(err, CoreError::Fs(FsError::Io { .. })));
        assert_eq!(f.raw.read("a.md").await.unwrap(), "old");
        assert!(!f.raw.exists("a.md.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let f = fixture();
        f.bridge.shutdown();
        assert!(matches!(
            f.fs.write_file("a.md", "x").await,
            Err(CoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_write_metadata_keeps_body() {
        let f = fixture();
        f.fs.write_file("a.md", "+++\ntitle = \"A\"\n+++\nkeep me").await.unwrap();

        f.fs
            .write_metadata("a.md", &FileMetadata::with_title("B"))
            .await
            .unwrap();

        let content = f.raw.read("a.md").await.unwrap();
        let parsed = frontmatter::parse(&content).unwrap();
        assert_eq!(parsed.frontmatter.title.as_deref(), Some("B"));
        assert_eq!(parsed.body, "keep me");
    }
}
