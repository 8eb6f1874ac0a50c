//! SyncEngine: the explicit context object for one open workspace.
//!
//! ```text
//!  init_workspace(options)
//!     ├─ WorkspaceCrdt (YrsWorkspace, loaded from .quire/workspace.crdt)
//!     ├─ MetadataStore ─► HierarchyBridge (path locks)
//!     ├─ BodyDocs
//!     ├─ EventBus
//!     └─ SyncFileSystem (DiskFs or MemoryFs)
//!  teardown()
//!     save CRDT ─► shut down bridge + drop locks ─► abort tasks ─► close events
//!     ─► signal watchers (sync sessions stop their sockets)
//! ```
//!
//! Nothing here is global. Several engines can be open at once (a guest
//! session runs against its own ephemeral engine).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bridge::HierarchyBridge;
use crate::crdt::{BodyDocs, BodyOutcome, WorkspaceCrdt, YrsWorkspace};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventSubscription, FileEvent};
use crate::frontmatter;
use crate::fs::{classify, DiskFs, FileSystem, FsError, MemoryFs, SyncFileSystem};
use crate::path::{is_markdown, is_temp_artifact, normalize_path};
use crate::store::MetadataStore;

/// Where the CRDT snapshot lives inside a disk workspace.
pub const CRDT_STATE_FILE: &str = ".quire/workspace.crdt";

/// Options for [`SyncEngine::init_workspace`].
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub workspace_id: String,
    /// Workspace directory. `None` keeps everything in memory.
    pub root: Option<PathBuf>,
    /// Overrides `<root>/.quire/workspace.crdt`.
    pub crdt_state_path: Option<PathBuf>,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            workspace_id: "default".to_string(),
            root: None,
            crdt_state_path: None,
            event_capacity: 1024,
        }
    }
}

impl WorkspaceOptions {
    pub fn for_disk(workspace_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// In-memory workspace with small buffers.
    pub fn for_testing() -> Self {
        Self {
            workspace_id: format!("test-{}", uuid::Uuid::new_v4()),
            event_capacity: 64,
            ..Self::default()
        }
    }

    fn state_path(&self) -> Option<PathBuf> {
        self.crdt_state_path
            .clone()
            .or_else(|| self.root.as_ref().map(|root| root.join(CRDT_STATE_FILE)))
    }
}

pub struct SyncEngine {
    options: WorkspaceOptions,
    store: Arc<MetadataStore>,
    bridge: Arc<HierarchyBridge>,
    bodies: Arc<BodyDocs>,
    events: Arc<EventBus>,
    fs: Arc<SyncFileSystem>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
    teardown_signal: watch::Sender<bool>,
}

impl SyncEngine {
    /// Open a workspace: load CRDT state and pick the storage backend.
    pub async fn init_workspace(options: WorkspaceOptions) -> Result<Arc<Self>> {
        let crdt: Arc<dyn WorkspaceCrdt> = match options.state_path() {
            Some(path) => Arc::new(YrsWorkspace::open(path)?),
            None => Arc::new(YrsWorkspace::new()),
        };
        let backend: Arc<dyn FileSystem> = match &options.root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(|e| FsError::io(&root.display().to_string(), e))?;
                Arc::new(DiskFs::new(root.clone()))
            }
            None => Arc::new(MemoryFs::new()),
        };

        log::info!(
            "Workspace {} initialized ({})",
            options.workspace_id,
            options
                .root
                .as_ref()
                .map_or("in memory".to_string(), |r| r.display().to_string())
        );
        Ok(Self::with_parts(options, crdt, backend))
    }

    /// Throwaway in-memory workspace.
    pub fn ephemeral(workspace_id: impl Into<String>) -> Arc<Self> {
        let options = WorkspaceOptions {
            workspace_id: workspace_id.into(),
            ..WorkspaceOptions::default()
        };
        Self::with_parts(
            options,
            Arc::new(YrsWorkspace::new()),
            Arc::new(MemoryFs::new()),
        )
    }

    /// Assemble an engine from an existing CRDT and backend.
    pub fn with_parts(
        options: WorkspaceOptions,
        crdt: Arc<dyn WorkspaceCrdt>,
        backend: Arc<dyn FileSystem>,
    ) -> Arc<Self> {
        let capacity = options.event_capacity;
        let store = Arc::new(MetadataStore::new(crdt, capacity));
        let bridge = Arc::new(HierarchyBridge::new(Arc::clone(&store)));
        let bodies = Arc::new(BodyDocs::new(capacity));
        let events = Arc::new(EventBus::new(capacity));
        let fs = Arc::new(SyncFileSystem::new(
            backend,
            Arc::clone(&bridge),
            Arc::clone(&bodies),
            Arc::clone(&events),
        ));
        bridge.initialize();

        Arc::new(Self {
            options,
            store,
            bridge,
            bodies,
            events,
            fs,
            tasks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            teardown_signal: watch::channel(false).0,
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.options.workspace_id
    }

    pub fn options(&self) -> &WorkspaceOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<HierarchyBridge> {
        &self.bridge
    }

    pub fn bodies(&self) -> &Arc<BodyDocs> {
        &self.bodies
    }

    pub fn fs(&self) -> &Arc<SyncFileSystem> {
        &self.fs
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::NotInitialized)
        }
    }

    /// Create records for markdown files in storage that have none yet.
    pub async fn discover_files(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        let mut created = Vec::new();

        for path in self.fs.enumerate().await? {
            if !is_markdown(&path) || is_temp_artifact(&path) || self.store.get(&path).is_some() {
                continue;
            }
            let content = self.fs.read_file(&path).await?;
            let parsed = match frontmatter::parse(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("Skipping {path} during discovery: {e}");
                    continue;
                }
            };
            let metadata = self
                .bridge
                .update_file_metadata(&path, parsed.frontmatter.into_patch())
                .await?;
            self.bodies.set_body(&path, &parsed.body);
            self.events.emit(FileEvent::FileCreated {
                path: path.clone(),
                metadata,
            });
            created.push(path);
        }

        if !created.is_empty() {
            log::info!("Discovered {} untracked file(s)", created.len());
        }
        Ok(created)
    }

    /// Apply a remote workspace update: storage follows the CRDT, one event
    /// per changed path, and nothing is echoed back as a local mutation.
    pub async fn apply_remote_metadata(&self, update: &[u8]) -> Result<Vec<FileEvent>> {
        self.ensure_active()?;
        let changes = self.store.apply_remote(update)?;
        let mut emitted = Vec::new();

        for change in changes {
            let Some(after) = change.after else {
                continue;
            };
            let path = change.path;

            {
                let _bracket = self.fs.sync_write(&path);
                if after.deleted {
                    match self.fs.delete_file(&path).await {
                        Ok(()) | Err(CoreError::Fs(FsError::NotFound(_))) => {}
                        Err(e) => return Err(e),
                    }
                } else {
                    self.fs.write_metadata(&path, &after).await?;
                }
            }

            if let Some(event) = classify(&path, change.before.as_ref(), &after) {
                self.events.emit(event.clone());
                emitted.push(event);
            }
        }
        Ok(emitted)
    }

    /// Apply a body sync message for `path`, returning the reply to send.
    pub async fn apply_remote_body(&self, path: &str, payload: &[u8]) -> Result<BodyOutcome> {
        self.ensure_active()?;
        let path = normalize_path(path);
        let outcome = self.bodies.handle_message(&path, payload)?;

        if outcome.changed {
            let metadata = self.store.get(&path).unwrap_or_default();
            if !metadata.deleted {
                let content = frontmatter::render_metadata(&metadata, &self.bodies.body(&path))?;
                let _bracket = self.fs.sync_write(&path);
                self.fs.write_file(&path, &content).await?;
            }
        }
        Ok(outcome)
    }

    /// Tie a background task to this workspace; aborted on teardown.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        if self.is_active() {
            tasks.push(handle);
        } else {
            handle.abort();
        }
    }

    /// Flips to `true` once [`Self::teardown`] runs. Components that own
    /// sockets or timers watch this to release them.
    pub fn subscribe_teardown(&self) -> watch::Receiver<bool> {
        self.teardown_signal.subscribe()
    }

    pub fn task_count(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.len()
    }

    pub fn save(&self) -> Result<()> {
        Ok(self.store.save()?)
    }

    /// Release everything this workspace holds. Idempotent.
    pub fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let saved = self.store.save();
        self.bridge.shutdown();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        self.events.close();
        self.bodies.clear();
        self.teardown_signal.send_replace(true);

        log::info!(
            "Workspace {} torn down ({} task(s) aborted)",
            self.options.workspace_id,
            tasks.len()
        );
        Ok(saved?)
    }
}
