//! ShareSession: live host/guest collaboration over a control socket.
//!
//! ```text
//! Idle ─ create_session ─► Connecting ─ session_created ─► Hosting ─┐
//!   ▲                          │                                    │
//!   │                          └─ join_session ─ session_joined ─► Guest
//!   └──────────────── end_session / session_ended / socket loss ─────┘
//! ```
//!
//! The control socket only carries session lifecycle. Documents travel over a
//! [`SyncSession`] keyed by the join code. A guest runs against an ephemeral
//! in-memory engine so nothing it receives touches the caller's files.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quire_core::{CoreError, SyncEngine};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::body_sync::BodySyncConfig;
use crate::protocol::{validate_join_code, ProtocolError, ShareMessage};
use crate::session::{SessionRole, SyncSession};

type ControlSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type ControlStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub auth_token: Option<String>,
    /// How long to wait for `session_created` / `session_joined`.
    pub connect_timeout: Duration,
    /// Reconnect settings for the document socket.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ShareConfig {
    fn default() -> Self {
        let body = BodySyncConfig::default();
        Self {
            server_url: body.server_url,
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: body.initial_backoff,
            max_backoff: body.max_backoff,
            max_reconnect_attempts: body.max_reconnect_attempts,
        }
    }
}

impl ShareConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(server_url: impl Into<String>) -> Self {
        let body = BodySyncConfig::for_testing("", "");
        Self {
            server_url: server_url.into(),
            auth_token: None,
            connect_timeout: Duration::from_secs(2),
            initial_backoff: body.initial_backoff,
            max_backoff: body.max_backoff,
            max_reconnect_attempts: body.max_reconnect_attempts,
        }
    }

    fn control_url(&self, params: &[(&str, &str)]) -> Result<String, ShareError> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| ShareError::Connection(format!("bad server URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token);
            }
        }
        Ok(url.to_string())
    }

    fn body_sync(&self, workspace_id: &str, join_code: &str) -> BodySyncConfig {
        BodySyncConfig {
            auth_token: self.auth_token.clone(),
            session_code: Some(join_code.to_string()),
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..BodySyncConfig::new(self.server_url.clone(), workspace_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Idle,
    Connecting,
    Hosting,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub join_code: String,
    pub workspace_id: String,
    pub read_only: bool,
}

/// Session activity reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    PeerJoined(String),
    PeerLeft(String),
    ReadOnlyChanged(bool),
    /// The session is over (host left, or the control socket dropped).
    SessionEnded,
    Error(String),
}

#[derive(Debug)]
pub enum ShareError {
    /// Rejected before any network traffic.
    InvalidJoinCode(String),
    /// A session is already connecting or running.
    AlreadyActive,
    NotHosting,
    /// No terminal reply within the connect timeout.
    Timeout,
    /// The relay answered with `error`.
    Server(String),
    Connection(String),
    Protocol(ProtocolError),
    Core(CoreError),
}

impl std::fmt::Display for ShareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJoinCode(code) => write!(f, "Invalid join code: {code:?}"),
            Self::AlreadyActive => write!(f, "A share session is already active"),
            Self::NotHosting => write!(f, "Not hosting a session"),
            Self::Timeout => write!(f, "Timed out waiting for the share server"),
            Self::Server(message) => write!(f, "Share server error: {message}"),
            Self::Connection(e) => write!(f, "Connection failed: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Core(e) => write!(f, "Workspace error: {e}"),
        }
    }
}

impl std::error::Error for ShareError {}

impl From<ProtocolError> for ShareError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidJoinCode(code) => ShareError::InvalidJoinCode(code),
            ProtocolError::Timeout => ShareError::Timeout,
            other => ShareError::Protocol(other),
        }
    }
}

impl From<CoreError> for ShareError {
    fn from(e: CoreError) -> Self {
        ShareError::Core(e)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ShareSession {
    config: ShareConfig,
    state: watch::Sender<ShareState>,
    /// Engine the UI should read from; the ephemeral one while a guest.
    engine: Mutex<Arc<SyncEngine>>,
    /// Caller's engine, parked while a guest session runs.
    parked: Mutex<Option<Arc<SyncEngine>>>,
    info: Mutex<Option<SessionInfo>>,
    /// Side of the active session; only the host keeps a roster.
    role: Mutex<Option<SessionRole>>,
    roster: Mutex<BTreeSet<String>>,
    sync: Mutex<Option<Arc<SyncSession>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ShareMessage>>>,
    control_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ShareEvent>,
}

impl ShareSession {
    pub fn new(config: ShareConfig, engine: Arc<SyncEngine>) -> Arc<Self> {
        let (state, _) = watch::channel(ShareState::Idle);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            state,
            engine: Mutex::new(engine),
            parked: Mutex::new(None),
            info: Mutex::new(None),
            role: Mutex::new(None),
            roster: Mutex::new(BTreeSet::new()),
            sync: Mutex::new(None),
            outgoing: Mutex::new(None),
            control_task: Mutex::new(None),
            events,
        })
    }

    pub fn state(&self) -> ShareState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ShareState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// The workspace currently in use.
    pub fn active_engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&lock(&self.engine))
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        lock(&self.info).clone()
    }

    /// Guests currently connected (host side only).
    pub fn roster(&self) -> Vec<String> {
        lock(&self.roster).iter().cloned().collect()
    }

    pub fn sync_session(&self) -> Option<Arc<SyncSession>> {
        lock(&self.sync).clone()
    }

    fn begin_connecting(&self) -> Result<(), ShareError> {
        let mut began = false;
        self.state.send_if_modified(|state| {
            if *state == ShareState::Idle {
                *state = ShareState::Connecting;
                began = true;
                true
            } else {
                false
            }
        });
        if began {
            Ok(())
        } else {
            Err(ShareError::AlreadyActive)
        }
    }

    /// Host the active workspace. Resolves once the relay assigned a join code.
    pub async fn create_session(
        self: &Arc<Self>,
        owner_id: &str,
        read_only: bool,
    ) -> Result<SessionInfo, ShareError> {
        self.begin_connecting()?;
        let engine = self.active_engine();
        let workspace_id = engine.workspace_id().to_string();
        let read_only_param = read_only.to_string();

        let connected = self
            .open_control(&[
                ("action", "create"),
                ("workspaceId", &workspace_id),
                ("ownerId", owner_id),
                ("readOnly", &read_only_param),
            ])
            .await;
        let (sink, stream, reply) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                self.state.send_replace(ShareState::Idle);
                return Err(e);
            }
        };
        let info = match reply {
            ShareMessage::SessionCreated {
                join_code,
                workspace_id,
                read_only,
            } => SessionInfo {
                join_code,
                workspace_id,
                read_only,
            },
            other => {
                self.state.send_replace(ShareState::Idle);
                return Err(ShareError::Server(format!("unexpected reply {other:?}")));
            }
        };
        if let Err(e) = self.start_sync(engine, &info, SessionRole::Host) {
            self.state.send_replace(ShareState::Idle);
            return Err(e);
        }
        *lock(&self.role) = Some(SessionRole::Host);
        self.spawn_control(sink, stream);
        *lock(&self.info) = Some(info.clone());
        self.state.send_replace(ShareState::Hosting);
        log::info!("Hosting session {}", info.join_code);
        Ok(info)
    }

    /// Join someone else's session. The code is checked before connecting.
    pub async fn join_session(
        self: &Arc<Self>,
        code: &str,
        guest_id: &str,
    ) -> Result<SessionInfo, ShareError> {
        let code = validate_join_code(code)?;
        self.begin_connecting()?;

        let connected = self
            .open_control(&[("action", "join"), ("code", &code), ("guestId", guest_id)])
            .await;
        let (sink, stream, reply) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                self.state.send_replace(ShareState::Idle);
                return Err(e);
            }
        };
        let info = match reply {
            ShareMessage::SessionJoined {
                join_code,
                workspace_id,
                read_only,
            } => SessionInfo {
                join_code,
                workspace_id,
                read_only,
            },
            other => {
                self.state.send_replace(ShareState::Idle);
                return Err(ShareError::Server(format!("unexpected reply {other:?}")));
            }
        };
        let ephemeral = SyncEngine::ephemeral(info.workspace_id.clone());
        if let Err(e) = self.start_sync(Arc::clone(&ephemeral), &info, SessionRole::Guest) {
            let _ = ephemeral.teardown();
            self.state.send_replace(ShareState::Idle);
            return Err(e);
        }
        {
            let mut engine = lock(&self.engine);
            let original = std::mem::replace(&mut *engine, ephemeral);
            *lock(&self.parked) = Some(original);
        }
        *lock(&self.role) = Some(SessionRole::Guest);
        self.spawn_control(sink, stream);
        *lock(&self.info) = Some(info.clone());
        self.state.send_replace(ShareState::Guest);
        log::info!("Joined session {} as {guest_id}", info.join_code);
        Ok(info)
    }

    fn start_sync(
        &self,
        engine: Arc<SyncEngine>,
        info: &SessionInfo,
        role: SessionRole,
    ) -> Result<(), ShareError> {
        let config = self.config.body_sync(&info.workspace_id, &info.join_code);
        let session = SyncSession::new(engine, config, role);
        session.set_read_only(info.read_only);
        session.start()?;
        *lock(&self.sync) = Some(session);
        Ok(())
    }

    /// Toggle read-only for every participant. Host only.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), ShareError> {
        if self.state() != ShareState::Hosting {
            return Err(ShareError::NotHosting);
        }
        let outgoing = lock(&self.outgoing);
        let tx = outgoing.as_ref().ok_or(ShareError::NotHosting)?;
        tx.send(ShareMessage::SetReadOnly { read_only })
            .map_err(|_| ShareError::Connection("control socket closed".into()))
    }

    /// Leave (or, for the host, close) the session and return to Idle.
    pub async fn end_session(&self) {
        // Dropping the sender makes the control task close the socket.
        lock(&self.outgoing).take();
        let task = lock(&self.control_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.finish().await;
    }

    /// Shared teardown. Safe to call more than once.
    async fn finish(&self) {
        let sync = lock(&self.sync).take();
        if let Some(sync) = sync {
            sync.stop().await;
        }
        lock(&self.outgoing).take();

        let parked = lock(&self.parked).take();
        if let Some(original) = parked {
            let ephemeral = std::mem::replace(&mut *lock(&self.engine), original);
            if let Err(e) = ephemeral.teardown() {
                log::warn!("Failed to tear down guest workspace: {e}");
            }
        }
        lock(&self.info).take();
        lock(&self.role).take();
        lock(&self.roster).clear();
        if self.state.send_replace(ShareState::Idle) != ShareState::Idle {
            log::info!("Share session ended");
        }
    }

    async fn open_control(
        &self,
        params: &[(&str, &str)],
    ) -> Result<(ControlSink, ControlStream, ShareMessage), ShareError> {
        let url = self.config.control_url(params)?;
        let attempt = async {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ShareError::Connection(e.to_string()))?;
            let (sink, mut stream) = ws.split();
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match ShareMessage::from_json(text.as_str()) {
                        Ok(
                            reply @ (ShareMessage::SessionCreated { .. }
                            | ShareMessage::SessionJoined { .. }),
                        ) => return Ok((sink, stream, reply)),
                        Ok(ShareMessage::Error { message }) => {
                            return Err(ShareError::Server(message))
                        }
                        Ok(other) => log::debug!("Ignoring {other:?} before session start"),
                        Err(e) => log::warn!("Bad control message: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(ShareError::Connection(e.to_string())),
                }
            }
            Err(ShareError::Connection(
                "control socket closed before the session started".into(),
            ))
        };
        // On timeout the attempt is dropped, which closes the socket.
        tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .unwrap_or(Err(ShareError::Timeout))
    }

    fn spawn_control(self: &Arc<Self>, sink: ControlSink, stream: ControlStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outgoing) = Some(tx);
        let task = tokio::spawn(run_control(Arc::downgrade(self), sink, stream, rx));
        *lock(&self.control_task) = Some(task);
    }

    fn handle_control(&self, message: ShareMessage) -> bool {
        let hosting = *lock(&self.role) == Some(SessionRole::Host);
        match message {
            ShareMessage::PeerJoined { guest_id } if hosting => {
                lock(&self.roster).insert(guest_id.clone());
                let _ = self.events.send(ShareEvent::PeerJoined(guest_id));
            }
            ShareMessage::PeerLeft { guest_id } if hosting => {
                lock(&self.roster).remove(&guest_id);
                let _ = self.events.send(ShareEvent::PeerLeft(guest_id));
            }
            ShareMessage::ReadOnlyChanged { read_only } => {
                if let Some(info) = lock(&self.info).as_mut() {
                    info.read_only = read_only;
                }
                if let Some(sync) = lock(&self.sync).as_ref() {
                    sync.set_read_only(read_only);
                }
                let _ = self.events.send(ShareEvent::ReadOnlyChanged(read_only));
            }
            ShareMessage::SessionEnded => return false,
            ShareMessage::Error { message } => {
                log::warn!("Share server error: {message}");
                let _ = self.events.send(ShareEvent::Error(message));
            }
            other => log::debug!("Ignoring {other:?}"),
        }
        true
    }
}

async fn run_control(
    share: Weak<ShareSession>,
    mut sink: ControlSink,
    mut stream: ControlStream,
    mut outgoing: mpsc::UnboundedReceiver<ShareMessage>,
) {
    let ended_remotely = loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    let Ok(json) = message.to_json() else { continue };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        log::warn!("Control send failed: {e}");
                        break true;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break false;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Some(share) = share.upgrade() else { break false };
                    match ShareMessage::from_json(text.as_str()) {
                        Ok(message) => {
                            if !share.handle_control(message) {
                                break true;
                            }
                        }
                        Err(e) => log::warn!("Bad control message: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break true,
                Some(Err(e)) => {
                    log::warn!("Control socket error: {e}");
                    break true;
                }
                Some(Ok(_)) => {}
            },
        }
    };

    if ended_remotely {
        if let Some(share) = share.upgrade() {
            lock(&share.control_task).take();
            share.finish().await;
            let _ = share.events.send(ShareEvent::SessionEnded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share() -> Arc<ShareSession> {
        ShareSession::new(
            ShareConfig::for_testing("ws://127.0.0.1:1"),
            SyncEngine::ephemeral("ws"),
        )
    }

    #[tokio::test]
    async fn test_invalid_code_rejected_before_connecting() {
        let share = share();
        let err = share.join_session("not-a-code", "g1").await.unwrap_err();
        assert!(matches!(err, ShareError::InvalidJoinCode(_)));
        // Never left Idle, so no socket was opened.
        assert_eq!(share.state(), ShareState::Idle);
    }

    #[tokio::test]
    async fn test_connection_failure_returns_to_idle() {
        let share = share();
        let err = share.create_session("owner", false).await.unwrap_err();
        assert!(matches!(err, ShareError::Connection(_) | ShareError::Timeout));
        assert_eq!(share.state(), ShareState::Idle);
        assert!(share.session_info().is_none());
    }

    #[tokio::test]
    async fn test_set_read_only_requires_hosting() {
        let share = share();
        assert!(matches!(
            share.set_read_only(true),
            Err(ShareError::NotHosting)
        ));
    }

    #[tokio::test]
    async fn test_end_session_when_idle_is_noop() {
        let share = share();
        let engine = share.active_engine();
        share.end_session().await;
        assert_eq!(share.state(), ShareState::Idle);
        assert!(Arc::ptr_eq(&engine, &share.active_engine()));
        assert!(engine.is_active());
    }

    #[test]
    fn test_control_url() {
        let mut config = ShareConfig::new("ws://relay.example:9090");
        config.auth_token = Some("tok".into());
        let url = config
            .control_url(&[("action", "join"), ("code", "ABCD1234-EFGH5678")])
            .unwrap();
        assert_eq!(
            url,
            "ws://relay.example:9090/?action=join&code=ABCD1234-EFGH5678&token=tok"
        );
    }

    #[test]
    fn test_roster_tracks_peers() {
        let share = share();
        *lock(&share.role) = Some(SessionRole::Host);
        assert!(share.handle_control(ShareMessage::PeerJoined {
            guest_id: "g1".into()
        }));
        share.handle_control(ShareMessage::PeerJoined {
            guest_id: "g2".into(),
        });
        share.handle_control(ShareMessage::PeerLeft {
            guest_id: "g1".into(),
        });
        assert_eq!(share.roster(), vec!["g2".to_string()]);
        assert!(!share.handle_control(ShareMessage::SessionEnded));
    }

    #[test]
    fn test_guest_keeps_no_roster() {
        let share = share();
        *lock(&share.role) = Some(SessionRole::Guest);
        let mut events = share.subscribe_events();
        assert!(share.handle_control(ShareMessage::PeerJoined {
            guest_id: "g2".into()
        }));
        assert!(share.roster().is_empty());
        assert!(events.try_recv().is_err());

        // Nor does an idle session.
        lock(&share.role).take();
        share.handle_control(ShareMessage::PeerJoined {
            guest_id: "g3".into(),
        });
        assert!(share.roster().is_empty());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ShareError::from(ProtocolError::InvalidJoinCode("x".into())).to_string(),
            "Invalid join code: \"x\""
        );
        assert_eq!(
            ShareError::Timeout.to_string(),
            "Timed out waiting for the share server"
        );
    }
}
