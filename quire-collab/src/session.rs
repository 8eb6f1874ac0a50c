//! SyncSession: workspace metadata and note bodies over one multiplexed socket.
//!
//! ```text
//!   MetadataStore ── local updates ──┐
//!   BodyDocs ─────── local updates ──┤        ┌────────────────────┐
//!                                    ├─ pump ─┤ MultiplexedBodySync├─ ws
//!   SyncEngine ◄── apply_remote_* ───┤        └────────────────────┘
//!   TransferAssembler ◄─ @blob/* ────┘
//! ```
//!
//! The metadata document travels under [`WORKSPACE_KEY`]; every other key
//! is a note body or a blob chunk. Incoming frames are handled in arrival
//! order by a single pump task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quire_core::crdt::{BodyDocs, DocMessage};
use quire_core::{normalize_path, MetadataStore, SyncEngine};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::body_sync::{
    BodySyncConfig, ConnectionState, MessageHandler, MultiplexedBodySync, SyncStepSource,
};
use crate::protocol::{ControlMessage, ProtocolError, WORKSPACE_KEY};
use crate::transfer::{blob_hash, chunk_blob, TransferAssembler, DEFAULT_CHUNK_SIZE};

/// Routes SyncStep1 creation to the metadata store or the body documents.
struct WorkspaceSource {
    store: Arc<MetadataStore>,
    bodies: Arc<BodyDocs>,
}

impl SyncStepSource for WorkspaceSource {
    fn create_sync_step1(&self, path: &str) -> Vec<u8> {
        if path == WORKSPACE_KEY {
            self.store.create_sync_step1()
        } else {
            self.bodies.create_sync_step1(path)
        }
    }
}

/// A verified attachment received from a peer.
#[derive(Debug, Clone)]
pub struct ReceivedBlob {
    pub hash: String,
    pub bytes: Arc<Vec<u8>>,
}

/// Which side of the exchange this session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Pushes full state first and answers server handshakes.
    Host,
    /// Pulls state; never answers SyncStep1 for the workspace document.
    Guest,
}

pub struct SyncSession {
    engine: Arc<SyncEngine>,
    sync: Arc<MultiplexedBodySync>,
    role: SessionRole,
    read_only: Arc<AtomicBool>,
    blobs: broadcast::Sender<ReceivedBlob>,
    assembler: Mutex<TransferAssembler>,
    handler: Mutex<Option<MessageHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SyncSession {
    pub fn new(engine: Arc<SyncEngine>, config: BodySyncConfig, role: SessionRole) -> Arc<Self> {
        let source = Arc::new(WorkspaceSource {
            store: Arc::clone(engine.store()),
            bodies: Arc::clone(engine.bodies()),
        });
        let (blobs, _) = broadcast::channel(64);
        Arc::new(Self {
            engine,
            sync: Arc::new(MultiplexedBodySync::new(config, source)),
            role,
            read_only: Arc::new(AtomicBool::new(false)),
            blobs,
            assembler: Mutex::new(TransferAssembler::new()),
            handler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn body_sync(&self) -> &Arc<MultiplexedBodySync> {
        &self.sync
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// While read-only, a guest drops its own edits instead of sending them.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn subscribe_blobs(&self) -> broadcast::Receiver<ReceivedBlob> {
        self.blobs.subscribe()
    }

    /// Subscribe the workspace document, start the pump and connect.
    pub fn start(self: &Arc<Self>) -> Result<(), ProtocolError> {
        if !self.engine.is_active() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        let handler: MessageHandler = Arc::new(move |path, payload| {
            let _ = tx.send((path.to_string(), payload.to_vec()));
        });

        if self.role == SessionRole::Host {
            let full = self.engine.store().full_state();
            self.sync
                .send(WORKSPACE_KEY, DocMessage::Update(full).encode())?;
        }
        self.sync
            .subscribe(WORKSPACE_KEY, Arc::clone(&handler), None)?;
        self.sync.set_fallback_handler(Some(Arc::clone(&handler)));
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);

        let pump = tokio::spawn(Arc::clone(self).pump(rx));
        self.lock_tasks().push(pump);

        self.sync.connect()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drops_local_edits(&self) -> bool {
        self.role == SessionRole::Guest && self.is_read_only()
    }

    async fn pump(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let mut metadata_updates = self.engine.store().subscribe_local_updates();
        let mut body_updates = self.engine.bodies().subscribe_updates();
        let mut teardown = self.engine.subscribe_teardown();

        loop {
            tokio::select! {
                _ = async {
                    // An error means the engine is gone, which also ends the session.
                    let _ = teardown.wait_for(|down| *down).await;
                } => {
                    log::info!(
                        "Workspace {} torn down, stopping sync session",
                        self.engine.workspace_id()
                    );
                    // stop() aborts this task only after its last await.
                    self.stop().await;
                    return;
                }
                message = incoming.recv() => match message {
                    Some((path, payload)) => self.handle_incoming(&path, &payload).await,
                    None => break,
                },
                update = metadata_updates.recv() => match update {
                    Ok(update) => self.forward_metadata(update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The next handshake carries whatever was skipped.
                        log::warn!("Skipped {n} local metadata updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                update = body_updates.recv() => match update {
                    Ok(update) => self.forward_body(&update.path, update.update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Skipped {n} local body updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("Sync session pump stopped");
    }

    fn forward_metadata(&self, update: Vec<u8>) {
        if self.drops_local_edits() {
            log::debug!("Read-only session, dropping local metadata update");
            return;
        }
        // Offline edits are covered by the reconnect handshake diff.
        if self.sync.state() != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self
            .sync
            .send(WORKSPACE_KEY, DocMessage::Update(update).encode())
        {
            log::warn!("Failed to forward metadata update: {e}");
        }
    }

    fn forward_body(&self, path: &str, update: Vec<u8>) {
        if !self.sync.is_subscribed(path) {
            return;
        }
        if self.drops_local_edits() {
            log::debug!("Read-only session, dropping local edit to {path}");
            return;
        }
        if let Err(e) = self.sync.send(path, DocMessage::Update(update).encode()) {
            log::warn!("Failed to send body update for {path}: {e}");
        }
    }

    async fn handle_incoming(&self, path: &str, payload: &[u8]) {
        if path == WORKSPACE_KEY {
            self.handle_workspace(payload).await;
        } else if let Some(hash) = blob_hash(path) {
            self.handle_blob_chunk(hash, payload);
        } else {
            match self.engine.apply_remote_body(path, payload).await {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        let _ = self.sync.send(path, reply);
                    }
                }
                Err(e) => log::warn!("Failed to apply body update for {path}: {e}"),
            }
        }
    }

    async fn handle_workspace(&self, payload: &[u8]) {
        let message = match DocMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed workspace sync message: {e}");
                return;
            }
        };
        match message {
            DocMessage::SyncStep1(state_vector) => {
                if self.role == SessionRole::Guest {
                    return;
                }
                match self.engine.store().encode_diff(&state_vector) {
                    Ok(diff) => {
                        let reply = DocMessage::SyncStep2(diff).encode();
                        let _ = self.sync.send(WORKSPACE_KEY, reply);
                    }
                    Err(e) => log::warn!("Cannot answer workspace handshake: {e}"),
                }
            }
            DocMessage::SyncStep2(update) | DocMessage::Update(update) => {
                match self.engine.apply_remote_metadata(&update).await {
                    Ok(events) if !events.is_empty() => {
                        log::debug!("Applied remote metadata, {} event(s)", events.len());
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Failed to apply remote metadata: {e}"),
                }
            }
        }
    }

    fn handle_blob_chunk(&self, hash: &str, payload: &[u8]) {
        let result = self
            .assembler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .accept(hash, payload);
        match result {
            Ok(None) => {}
            Ok(Some(bytes)) => {
                log::info!("Received blob {hash} ({} bytes)", bytes.len());
                let _ = self.blobs.send(ReceivedBlob {
                    hash: hash.to_string(),
                    bytes: Arc::new(bytes),
                });
                self.ack_blob(hash, true);
            }
            Err(e) => {
                log::warn!("Blob transfer {hash} failed: {e}");
                self.ack_blob(hash, false);
            }
        }
    }

    fn ack_blob(&self, hash: &str, ok: bool) {
        self.sync.send_control(&ControlMessage::BlobAck {
            hash: hash.to_string(),
            ok,
        });
    }

    /// Chunk and send an attachment, returning its hash.
    pub fn send_blob(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        let (key, chunks) = chunk_blob(bytes, DEFAULT_CHUNK_SIZE);
        for chunk in chunks {
            self.sync.send(&key, chunk)?;
        }
        Ok(blob_hash(&key).unwrap_or_default().to_string())
    }

    /// Start syncing a note body and mark it focused.
    pub fn open_file(&self, path: &str) -> Result<(), ProtocolError> {
        let path = normalize_path(path);
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        self.sync.subscribe(&path, handler, None)?;
        self.sync.focus(&[path]);
        Ok(())
    }

    pub fn close_file(&self, path: &str) {
        let path = normalize_path(path);
        self.sync.unsubscribe(&path);
        self.sync.unfocus(&[path]);
    }

    pub async fn wait_for_sync(&self, path: &str, timeout: Duration) -> bool {
        self.sync.wait_for_sync(&normalize_path(path), timeout).await
    }

    pub async fn wait_for_workspace(&self, timeout: Duration) -> bool {
        self.sync.wait_for_sync(WORKSPACE_KEY, timeout).await
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.sync.wait_connected(timeout).await
    }

    /// Tear down the socket and the pump. Terminal.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sync.destroy().await;
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{FileEvent, FileMetadata};

    fn offline(role: SessionRole) -> Arc<SyncSession> {
        SyncSession::new(
            SyncEngine::ephemeral("ws"),
            BodySyncConfig::for_testing("ws://127.0.0.1:1", "ws"),
            role,
        )
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_: &str, _: &[u8]| {})
    }

    #[tokio::test]
    async fn test_host_queues_full_state_then_handshake() {
        let session = offline(SessionRole::Host);
        session
            .engine()
            .store()
            .set("a.md", &FileMetadata::with_title("A"))
            .unwrap();
        session.start().unwrap();
        assert_eq!(session.body_sync().queued_len(), 2);
        assert!(session.body_sync().is_subscribed(WORKSPACE_KEY));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_guest_only_queues_handshake() {
        let session = offline(SessionRole::Guest);
        session.start().unwrap();
        assert_eq!(session.body_sync().queued_len(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_remote_workspace_update_reaches_engine() {
        let remote = SyncEngine::ephemeral("ws");
        remote
            .store()
            .set("a.md", &FileMetadata::with_title("Remote"))
            .unwrap();
        let update = DocMessage::Update(remote.store().full_state()).encode();

        let session = offline(SessionRole::Host);
        let mut events = session.engine().subscribe();
        session.handle_incoming(WORKSPACE_KEY, &update).await;

        let stored = session.engine().store().get("a.md").unwrap();
        assert_eq!(stored.title.as_deref(), Some("Remote"));
        assert!(matches!(
            events.try_recv(),
            Some(FileEvent::FileCreated { path, .. }) if path == "a.md"
        ));
        // Nothing is echoed back.
        assert_eq!(session.body_sync().queued_len(), 0);
    }

    #[tokio::test]
    async fn test_only_host_answers_workspace_handshake() {
        let step1 = SyncEngine::ephemeral("other").store().create_sync_step1();

        let host = offline(SessionRole::Host);
        host.handle_incoming(WORKSPACE_KEY, &step1).await;
        assert_eq!(host.body_sync().queued_len(), 1);

        let guest = offline(SessionRole::Guest);
        guest.handle_incoming(WORKSPACE_KEY, &step1).await;
        assert_eq!(guest.body_sync().queued_len(), 0);
    }

    #[tokio::test]
    async fn test_read_only_guest_drops_local_edits() {
        let session = offline(SessionRole::Guest);
        session
            .body_sync()
            .subscribe("a.md", noop_handler(), None)
            .unwrap();
        assert_eq!(session.body_sync().queued_len(), 1);

        session.set_read_only(true);
        session.forward_body("a.md", vec![1, 2, 3]);
        assert_eq!(session.body_sync().queued_len(), 1);

        session.set_read_only(false);
        session.forward_body("a.md", vec![1, 2, 3]);
        assert_eq!(session.body_sync().queued_len(), 2);

        // Unsubscribed paths are never forwarded.
        session.forward_body("b.md", vec![4]);
        assert_eq!(session.body_sync().queued_len(), 2);
    }

    #[tokio::test]
    async fn test_blob_chunks_reassemble() {
        let session = offline(SessionRole::Host);
        let mut blobs = session.subscribe_blobs();
        let (key, chunks) = chunk_blob(b"an attachment of some length", 5);
        for chunk in &chunks {
            session.handle_incoming(&key, chunk).await;
        }

        let blob = blobs.try_recv().unwrap();
        assert_eq!(Some(blob.hash.as_str()), blob_hash(&key));
        assert_eq!(blob.bytes.as_slice(), b"an attachment of some length");
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let session = offline(SessionRole::Host);
        session.start().unwrap();
        session.stop().await;
        assert!(session.is_stopped());
        assert_eq!(session.body_sync().state(), ConnectionState::Destroyed);
        assert!(session.open_file("a.md").is_err());
        // Second stop is a no-op.
        session.stop().await;
    }

    #[tokio::test]
    async fn test_engine_teardown_stops_session() {
        let session = offline(SessionRole::Host);
        session.start().unwrap();
        assert_ne!(session.body_sync().state(), ConnectionState::Destroyed);

        session.engine().teardown().unwrap();

        let mut state = session.body_sync().subscribe_state();
        let destroyed = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Destroyed),
        )
        .await;
        assert!(destroyed.is_ok());
        assert!(session.is_stopped());
        assert_eq!(session.body_sync().queued_len(), 0);
        assert!(session.start().is_err());
    }
}
