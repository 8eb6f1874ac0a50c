//! Relay server: multiplexed document rooms plus the share control endpoint.
//!
//! ```text
//!   ?doc=ws&multiplexed=true[&session=CODE]        ?action=create|join
//!              │                                          │
//!              ▼                                          ▼
//!   RelayRoom (room = session code or doc)       ShareRoom (join code)
//!     ├─ yrs Doc per frame key                     ├─ host channel
//!     ├─ BroadcastGroup (fan-out)                  ├─ guest channels
//!     ├─ focus sets per peer                       └─ read-only flag
//!     └─ SnapshotStore (doc rooms only)
//! ```
//!
//! The relay is a peer like any other: it answers every SyncStep1 with a
//! SyncStep2 and its own SyncStep1, applies every update it receives and
//! forwards it to the rest of the room.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quire_core::crdt::{self, CrdtError, DocMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::Doc;

use crate::broadcast::{BroadcastGroup, PeerInfo, RelayFrame, RelayPayload};
use crate::protocol::{
    frame_message, unframe_message, validate_join_code, ControlMessage, ShareMessage,
    BLOB_PREFIX, JOIN_CODE_HALF, WORKSPACE_KEY,
};
use crate::storage::{SnapshotStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

const JOIN_CODE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Quiet period after the last handshake before `sync_complete` is sent
    pub sync_complete_debounce: Duration,
    /// Snapshot storage (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 1024,
            sync_complete_debounce: Duration::from_millis(100),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 256,
            sync_complete_debounce: Duration::from_millis(20),
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub active_sessions: usize,
    pub persisted_snapshots: u64,
}

/// Eight `[A-Z0-9]` characters, a dash, eight more.
pub fn generate_join_code() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let mut code = String::with_capacity(JOIN_CODE_HALF * 2 + 1);
    for (i, byte) in bytes.iter().take(JOIN_CODE_HALF * 2).enumerate() {
        if i == JOIN_CODE_HALF {
            code.push('-');
        }
        code.push(char::from(JOIN_CODE_ALPHABET[usize::from(*byte) % JOIN_CODE_ALPHABET.len()]));
    }
    code
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What the relay does with one document sync message.
#[derive(Debug, PartialEq, Eq)]
enum SyncReply {
    /// Answer to a SyncStep1: our diff, then our own state vector.
    Handshake { step2: Vec<u8>, step1: Vec<u8> },
    /// Update merged; forward it to the room.
    Applied(Vec<u8>),
    /// Update carried nothing.
    Empty,
}

struct RelayRoom {
    id: String,
    /// Doc rooms are snapshotted; share session rooms are not.
    persistent: bool,
    broadcast: BroadcastGroup,
    docs: Mutex<HashMap<String, Doc>>,
    focus: Mutex<HashMap<Uuid, BTreeSet<String>>>,
}

impl RelayRoom {
    fn new(id: &str, persistent: bool, capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            persistent,
            broadcast: BroadcastGroup::new(capacity),
            docs: Mutex::new(HashMap::new()),
            focus: Mutex::new(HashMap::new()),
        }
    }

    fn handle_sync(&self, key: &str, message: DocMessage) -> Result<SyncReply, CrdtError> {
        let mut docs = lock(&self.docs);
        let doc = docs.entry(key.to_string()).or_insert_with(Doc::new);
        match message {
            DocMessage::SyncStep1(remote_sv) => Ok(SyncReply::Handshake {
                step2: DocMessage::SyncStep2(crdt::encode_diff(doc, &remote_sv)?).encode(),
                step1: DocMessage::SyncStep1(crdt::state_vector(doc)).encode(),
            }),
            DocMessage::SyncStep2(update) | DocMessage::Update(update) => {
                if crdt::is_empty_update(&update) {
                    return Ok(SyncReply::Empty);
                }
                crdt::apply_update(doc, &update)?;
                Ok(SyncReply::Applied(update))
            }
        }
    }

    fn load(&self, snapshots: Vec<(String, Vec<u8>)>) -> usize {
        let mut docs = lock(&self.docs);
        let mut loaded = 0;
        for (key, snapshot) in snapshots {
            let doc = docs.entry(key.clone()).or_insert_with(Doc::new);
            match crdt::apply_update(doc, &snapshot) {
                Ok(()) => loaded += 1,
                Err(e) => log::warn!("Discarding unreadable snapshot {}/{key}: {e}", self.id),
            }
        }
        loaded
    }

    fn snapshots(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.docs)
            .iter()
            .map(|(key, doc)| (key.clone(), crdt::full_state(doc)))
            .collect()
    }

    /// Add or remove focused files for a peer; true if the room union changed.
    fn update_focus(&self, peer: Uuid, files: &[String], add: bool) -> bool {
        let mut focus = lock(&self.focus);
        let before = union(&focus);
        let set = focus.entry(peer).or_default();
        for file in files {
            if add {
                set.insert(file.clone());
            } else {
                set.remove(file);
            }
        }
        if set.is_empty() {
            focus.remove(&peer);
        }
        union(&focus) != before
    }

    fn drop_focus(&self, peer: Uuid) -> bool {
        lock(&self.focus)
            .remove(&peer)
            .is_some_and(|files| !files.is_empty())
    }

    fn focus_union(&self) -> Vec<String> {
        union(&lock(&self.focus)).into_iter().collect()
    }

    fn peer_focuses(&self, peer: Uuid, key: &str) -> bool {
        lock(&self.focus)
            .get(&peer)
            .is_some_and(|files| files.contains(key))
    }
}

fn union(focus: &HashMap<Uuid, BTreeSet<String>>) -> BTreeSet<String> {
    focus.values().flatten().cloned().collect()
}

/// A live share session on the control endpoint.
struct ShareRoom {
    join_code: String,
    workspace_id: String,
    read_only: AtomicBool,
    host: mpsc::UnboundedSender<ShareMessage>,
    guests: Mutex<HashMap<String, mpsc::UnboundedSender<ShareMessage>>>,
}

impl ShareRoom {
    fn notify_guests(&self, message: &ShareMessage) {
        for tx in lock(&self.guests).values() {
            let _ = tx.send(message.clone());
        }
    }
}

struct RelayState {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    sessions: RwLock<HashMap<String, Arc<ShareRoom>>>,
    store: Option<SnapshotStore>,
    stats: RwLock<ServerStats>,
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(SnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => None,
        };
        Ok(Self {
            state: Arc::new(RelayState {
                config,
                rooms: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                store,
                stats: RwLock::new(ServerStats::default()),
            }),
        })
    }

    /// In-memory relay with default settings.
    pub fn with_defaults() -> Self {
        Self {
            state: Arc::new(RelayState {
                config: ServerConfig::default(),
                rooms: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                store: None,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn has_storage(&self) -> bool {
        self.state.store.is_some()
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.state.rooms.read().await.len()
    }

    pub async fn session_codes(&self) -> Vec<String> {
        self.state.sessions.read().await.keys().cloned().collect()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), BoxError> {
    let mut query = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().unwrap_or_default().to_string();
            Ok(response)
        },
    )
    .await?;
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    {
        let mut stats = state.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let (mut sink, source) = ws.split();
    let result = if params.contains_key("action") {
        handle_control(&state, &params, &mut sink, source).await
    } else if let Some(doc) = params.get("doc") {
        handle_multiplexed(&state, doc, params.get("session"), &mut sink, source).await
    } else {
        log::warn!("Rejecting {addr}: no doc or action in query");
        send_share(&mut sink, &ShareMessage::Error {
            message: "missing doc or action".into(),
        })
        .await
    };
    let _ = sink.send(Message::Close(None)).await;

    state.stats.write().await.active_connections -= 1;
    log::debug!("Connection from {addr} closed");
    result
}

async fn send_share(sink: &mut WsSink, message: &ShareMessage) -> Result<(), BoxError> {
    sink.send(Message::Text(message.to_json()?.into())).await?;
    Ok(())
}

async fn send_control(sink: &mut WsSink, message: &ControlMessage) -> Result<(), BoxError> {
    sink.send(Message::Text(message.to_json()?.into())).await?;
    Ok(())
}

async fn send_frame(sink: &mut WsSink, key: &str, payload: &[u8]) -> Result<(), BoxError> {
    sink.send(Message::Binary(frame_message(key, payload).into()))
        .await?;
    Ok(())
}

// ─── Multiplexed endpoint ────────────────────────────────────────────

/// Join (creating if needed) a room. The peer is registered under the room
/// map lock so a concurrent close cannot drop the room underneath it.
async fn join_room(
    state: &RelayState,
    id: &str,
    persistent: bool,
    peer: PeerInfo,
) -> Option<(Arc<RelayRoom>, broadcast::Receiver<Arc<RelayFrame>>)> {
    let mut rooms = state.rooms.write().await;
    if let Some(room) = rooms.get(id) {
        if room.broadcast.peer_count().await >= state.config.max_peers_per_room {
            return None;
        }
        let rx = room.broadcast.add_peer(peer).await;
        return Some((Arc::clone(room), rx));
    }

    let room = Arc::new(RelayRoom::new(id, persistent, state.config.broadcast_capacity));
    if persistent {
        if let Some(store) = &state.store {
            match store.load_room(id) {
                Ok(snapshots) if !snapshots.is_empty() => {
                    let loaded = room.load(snapshots);
                    log::info!("Loaded {loaded} persisted document(s) for room {id}");
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to load room {id}: {e}"),
            }
        }
    }
    let rx = room.broadcast.add_peer(peer).await;
    rooms.insert(id.to_string(), Arc::clone(&room));
    state.stats.write().await.active_rooms = rooms.len();
    Some((room, rx))
}

async fn close_room_if_empty(state: &RelayState, room: &RelayRoom) {
    let mut rooms = state.rooms.write().await;
    if room.broadcast.peer_count().await > 0 {
        return;
    }
    if room.persistent {
        if let Some(store) = &state.store {
            let mut saved = 0;
            for (key, snapshot) in room.snapshots() {
                match store.save_snapshot(&room.id, &key, &snapshot) {
                    Ok(_) => saved += 1,
                    Err(e) => log::error!("Failed to persist {}/{key}: {e}", room.id),
                }
            }
            state.stats.write().await.persisted_snapshots += saved;
            log::info!("Persisted {saved} document(s) for room {} (room closing)", room.id);
        }
    }
    rooms.remove(&room.id);
    state.stats.write().await.active_rooms = rooms.len();
    log::info!("Room {} removed (empty)", room.id);
}

/// Per-connection handshake bookkeeping for `sync_progress` / `sync_complete`.
#[derive(Default)]
struct Handshakes {
    requested: usize,
    answered: usize,
    subscribed: HashSet<String>,
    deadline: Option<Instant>,
}

async fn handle_multiplexed(
    state: &RelayState,
    doc: &str,
    session: Option<&String>,
    sink: &mut WsSink,
    source: WsSource,
) -> Result<(), BoxError> {
    let (room_id, persistent) = match session {
        Some(code) => {
            let code = validate_join_code(code)?;
            if !state.sessions.read().await.contains_key(&code) {
                log::warn!("Multiplexed connect for unknown session {code}");
                return Ok(());
            }
            (code, false)
        }
        None => (doc.to_string(), true),
    };

    let peer = PeerInfo::new(if persistent { "client" } else { "session" });
    let peer_id = peer.peer_id;
    let Some((room, rx)) = join_room(state, &room_id, persistent, peer).await else {
        log::warn!("Room {room_id} is full");
        return Ok(());
    };
    log::info!("Peer {peer_id} joined room {room_id}");

    let result = drive_multiplexed(state, &room, peer_id, rx, sink, source).await;

    room.broadcast.remove_peer(&peer_id).await;
    if room.drop_focus(peer_id) {
        broadcast_focus(&room);
    }
    close_room_if_empty(state, &room).await;
    log::info!("Peer {peer_id} left room {room_id}");
    result
}

fn broadcast_focus(room: &RelayRoom) {
    let message = ControlMessage::FocusListChanged {
        files: room.focus_union(),
    };
    if let Ok(json) = message.to_json() {
        room.broadcast
            .broadcast(RelayFrame::from_relay(RelayPayload::Text(json)));
    }
}

async fn drive_multiplexed(
    state: &RelayState,
    room: &RelayRoom,
    peer_id: Uuid,
    mut rx: broadcast::Receiver<Arc<RelayFrame>>,
    sink: &mut WsSink,
    mut source: WsSource,
) -> Result<(), BoxError> {
    let debounce = state.config.sync_complete_debounce;
    let mut handshakes = Handshakes::default();

    loop {
        let deadline = handshakes.deadline;
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    {
                        let mut stats = state.stats.write().await;
                        stats.total_messages += 1;
                        stats.total_bytes += data.len() as u64;
                    }
                    let (key, payload) = match unframe_message(&data) {
                        Ok(parts) => parts,
                        Err(e) => {
                            log::warn!("Unframeable message from {peer_id}: {e}");
                            continue;
                        }
                    };
                    if key.starts_with(BLOB_PREFIX) {
                        room.broadcast.broadcast(RelayFrame::binary(peer_id, data.to_vec()));
                        continue;
                    }
                    let message = match DocMessage::decode(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("Bad sync message for {key} from {peer_id}: {e}");
                            continue;
                        }
                    };
                    match room.handle_sync(&key, message) {
                        Ok(SyncReply::Handshake { step2, step1 }) => {
                            handshakes.requested += 1;
                            handshakes.subscribed.insert(key.clone());
                            send_frame(sink, &key, &step2).await?;
                            send_frame(sink, &key, &step1).await?;
                            handshakes.answered += 1;
                            handshakes.deadline = Some(Instant::now() + debounce);
                        }
                        Ok(SyncReply::Applied(update)) => {
                            let forward = frame_message(&key, &DocMessage::Update(update).encode());
                            room.broadcast.broadcast(RelayFrame::binary(peer_id, forward));
                        }
                        Ok(SyncReply::Empty) => {}
                        Err(e) => log::warn!("Rejected update for {key} from {peer_id}: {e}"),
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match ControlMessage::from_json(text.as_str()) {
                        Ok(ControlMessage::Focus { files }) => {
                            if room.update_focus(peer_id, &files, true) {
                                broadcast_focus(room);
                            }
                        }
                        Ok(ControlMessage::Unfocus { files }) => {
                            if room.update_focus(peer_id, &files, false) {
                                broadcast_focus(room);
                            }
                        }
                        Ok(ack @ ControlMessage::BlobAck { .. }) => {
                            room.broadcast.broadcast(RelayFrame::text(peer_id, ack.to_json()?));
                        }
                        Ok(other) => log::debug!("Ignoring {other:?} from {peer_id}"),
                        Err(e) => log::warn!("Bad control message from {peer_id}: {e}"),
                    }
                }
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {peer_id}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            frame = rx.recv() => match frame {
                Ok(frame) if frame.is_for(peer_id) => {
                    match &frame.payload {
                        RelayPayload::Binary(bytes) => {
                            if wants_frame(room, peer_id, &handshakes, bytes) {
                                sink.send(Message::Binary(bytes.clone().into())).await?;
                            }
                        }
                        RelayPayload::Text(text) => {
                            sink.send(Message::Text(text.clone().into())).await?;
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer {peer_id} lagged by {n} frames");
                    room.broadcast.record_lag(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                handshakes.deadline = None;
                send_control(sink, &ControlMessage::SyncProgress {
                    completed: handshakes.answered,
                    total: handshakes.requested,
                }).await?;
                send_control(sink, &ControlMessage::SyncComplete {
                    files_synced: handshakes.answered,
                }).await?;
            }
        }
    }
    Ok(())
}

/// Workspace and blob frames go to everyone; body frames only to peers that
/// opened or focus that file.
fn wants_frame(room: &RelayRoom, peer: Uuid, handshakes: &Handshakes, frame: &[u8]) -> bool {
    match unframe_message(frame) {
        Ok((key, _)) => {
            key == WORKSPACE_KEY
                || key.starts_with(BLOB_PREFIX)
                || handshakes.subscribed.contains(&key)
                || room.peer_focuses(peer, &key)
        }
        Err(_) => false,
    }
}

// ─── Share control endpoint ──────────────────────────────────────────

async fn handle_control(
    state: &RelayState,
    params: &HashMap<String, String>,
    sink: &mut WsSink,
    source: WsSource,
) -> Result<(), BoxError> {
    match params.get("action").map(String::as_str) {
        Some("create") => host_session(state, params, sink, source).await,
        Some("join") => join_session(state, params, sink, source).await,
        other => {
            send_share(sink, &ShareMessage::Error {
                message: format!("unknown action {other:?}"),
            })
            .await
        }
    }
}

async fn host_session(
    state: &RelayState,
    params: &HashMap<String, String>,
    sink: &mut WsSink,
    mut source: WsSource,
) -> Result<(), BoxError> {
    let workspace_id = params.get("workspaceId").cloned().unwrap_or_default();
    let read_only = params.get("readOnly").is_some_and(|v| v == "true");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let session = {
        let mut sessions = state.sessions.write().await;
        let mut code = generate_join_code();
        while sessions.contains_key(&code) {
            code = generate_join_code();
        }
        let session = Arc::new(ShareRoom {
            join_code: code.clone(),
            workspace_id: workspace_id.clone(),
            read_only: AtomicBool::new(read_only),
            host: tx,
            guests: Mutex::new(HashMap::new()),
        });
        sessions.insert(code, Arc::clone(&session));
        state.stats.write().await.active_sessions = sessions.len();
        session
    };
    log::info!(
        "Session {} created for workspace {workspace_id} by {}",
        session.join_code,
        params.get("ownerId").map_or("unknown", String::as_str)
    );

    let result = async {
        send_share(sink, &ShareMessage::SessionCreated {
            join_code: session.join_code.clone(),
            workspace_id: session.workspace_id.clone(),
            read_only,
        })
        .await?;

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match ShareMessage::from_json(text.as_str()) {
                        Ok(ShareMessage::SetReadOnly { read_only }) => {
                            session.read_only.store(read_only, Ordering::SeqCst);
                            let changed = ShareMessage::ReadOnlyChanged { read_only };
                            session.notify_guests(&changed);
                            send_share(sink, &changed).await?;
                        }
                        Ok(other) => log::debug!("Ignoring {other:?} from host"),
                        Err(e) => log::warn!("Bad message from host: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("Host socket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                outgoing = rx.recv() => match outgoing {
                    Some(message) => send_share(sink, &message).await?,
                    None => break,
                },
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    {
        let mut sessions = state.sessions.write().await;
        sessions.remove(&session.join_code);
        state.stats.write().await.active_sessions = sessions.len();
    }
    session.notify_guests(&ShareMessage::SessionEnded);
    log::info!("Session {} ended", session.join_code);
    result
}

async fn join_session(
    state: &RelayState,
    params: &HashMap<String, String>,
    sink: &mut WsSink,
    mut source: WsSource,
) -> Result<(), BoxError> {
    let code = params.get("code").map(String::as_str).unwrap_or_default();
    let session = match validate_join_code(code) {
        Ok(code) => state.sessions.read().await.get(&code).cloned(),
        Err(_) => None,
    };
    let Some(session) = session else {
        log::info!("Join attempt with unknown code {code:?}");
        return send_share(sink, &ShareMessage::Error {
            message: "session not found".into(),
        })
        .await;
    };

    let guest_id = params
        .get("guestId")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let (tx, mut rx) = mpsc::unbounded_channel();
    lock(&session.guests).insert(guest_id.clone(), tx);
    let _ = session.host.send(ShareMessage::PeerJoined {
        guest_id: guest_id.clone(),
    });
    log::info!("Guest {guest_id} joined session {}", session.join_code);

    let result = async {
        send_share(sink, &ShareMessage::SessionJoined {
            join_code: session.join_code.clone(),
            workspace_id: session.workspace_id.clone(),
            read_only: session.read_only.load(Ordering::SeqCst),
        })
        .await?;

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("Guest socket error: {e}");
                        break;
                    }
                    // Guests cannot change session settings.
                    Some(Ok(_)) => {}
                },
                outgoing = rx.recv() => match outgoing {
                    Some(ShareMessage::SessionEnded) | None => {
                        send_share(sink, &ShareMessage::SessionEnded).await?;
                        break;
                    }
                    Some(message) => send_share(sink, &message).await?,
                },
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    lock(&session.guests).remove(&guest_id);
    let _ = session.host.send(ShareMessage::PeerLeft {
        guest_id: guest_id.clone(),
    });
    log::info!("Guest {guest_id} left session {}", session.join_code);
    result
}
