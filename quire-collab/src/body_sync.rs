//! MultiplexedBodySync: one WebSocket carrying many per-file sync streams.
//!
//! ```text
//!            subscribe / send / focus            connection task (owns socket)
//!  callers ─────────────────────────┐        ┌──────────────────────────────┐
//!                                   ▼        │ select!                      │
//!                    ┌─ outgoing tx ─────────┼─► rx ──► ws sink             │
//!  Shared ───────────┤                       │   ws stream ──► handle_*     │
//!                    └─ SendQueue (offline)  │   stop signal               │
//!                                            └──────────────────────────────┘
//! ```
//!
//! State machine:
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Disconnected ─(backoff)─► Connecting ...
//!        any state ── destroy() ──► Destroyed (terminal)
//! ```
//!
//! Lock order is always `queue` then `outgoing`; no lock is held while a
//! user callback runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quire_core::BodyDocs;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{frame_message, unframe_message, ControlMessage, ProtocolError};
use crate::queue::{QueuedMessage, SendQueue};

/// Connection state of a [`MultiplexedBodySync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: no further reconnects.
    Destroyed,
}

/// Handler for binary payloads: `(path, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Called once when a subscription becomes synced.
pub type SyncedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Produces the SyncStep1 that opens a stream for a path.
pub trait SyncStepSource: Send + Sync {
    fn create_sync_step1(&self, path: &str) -> Vec<u8>;
}

impl SyncStepSource for BodyDocs {
    fn create_sync_step1(&self, path: &str) -> Vec<u8> {
        BodyDocs::create_sync_step1(self, path)
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct BodySyncConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub workspace_id: String,
    pub auth_token: Option<String>,
    /// Share session code; routes the socket into that session's room.
    pub session_code: Option<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub queue_capacity: usize,
}

impl Default for BodySyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            workspace_id: "default".to_string(),
            auth_token: None,
            session_code: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            max_reconnect_attempts: 10,
            queue_capacity: 10_000,
        }
    }
}

impl BodySyncConfig {
    pub fn new(server_url: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            workspace_id: workspace_id.into(),
            ..Self::default()
        }
    }

    /// Short backoff for tests.
    pub fn for_testing(server_url: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            max_reconnect_attempts: 5,
            queue_capacity: 1_000,
            ..Self::new(server_url, workspace_id)
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): 1s, 2s, 4s, ... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// `?doc=..&multiplexed=true[&token=..][&session=..]`.
    pub fn connect_url(&self) -> Result<String, ProtocolError> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| ProtocolError::SerializationError(format!("bad server URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("doc", &self.workspace_id);
            query.append_pair("multiplexed", "true");
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token);
            }
            if let Some(session) = &self.session_code {
                query.append_pair("session", session);
            }
        }
        Ok(url.to_string())
    }
}

struct Subscription {
    on_message: MessageHandler,
    on_synced: Option<SyncedHandler>,
    received_data: bool,
    synced: watch::Sender<bool>,
}

enum Outgoing {
    Frame { path: String, payload: Vec<u8> },
    Text(String),
}

/// Snapshot of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub received_data: bool,
    pub synced: bool,
}

struct Shared {
    config: BodySyncConfig,
    source: Arc<dyn SyncStepSource>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    queue: Mutex<SendQueue>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    focus: Mutex<BTreeSet<String>>,
    fallback: Mutex<Option<MessageHandler>>,
    control: broadcast::Sender<ControlMessage>,
    progress: watch::Sender<(usize, usize)>,
    destroyed: AtomicBool,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Destroyed is terminal.
            if *current == state || *current == ConnectionState::Destroyed {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Install the outgoing channel and replay offline state, in order:
    /// queued messages, focus set, then SyncStep1 for every subscription
    /// whose handshake was not already in the queue.
    fn attach(&self, tx: mpsc::UnboundedSender<Outgoing>) {
        let mut queue = lock(&self.queue);
        let mut outgoing = lock(&self.outgoing);

        let flushed = queue.drain();
        if !flushed.is_empty() {
            log::info!("Flushing {} queued body sync messages", flushed.len());
        }
        let flushed_paths: HashSet<String> = flushed.iter().map(|m| m.path.clone()).collect();
        for message in flushed {
            let _ = tx.send(Outgoing::Frame {
                path: message.path,
                payload: message.payload,
            });
        }

        let focus: Vec<String> = lock(&self.focus).iter().cloned().collect();
        if !focus.is_empty() {
            if let Ok(json) = (ControlMessage::Focus { files: focus }).to_json() {
                let _ = tx.send(Outgoing::Text(json));
            }
        }

        let mut resubscribe: Vec<String> = lock(&self.subscriptions)
            .keys()
            .filter(|path| !flushed_paths.contains(*path))
            .cloned()
            .collect();
        resubscribe.sort();
        for path in resubscribe {
            let payload = self.source.create_sync_step1(&path);
            let _ = tx.send(Outgoing::Frame { path, payload });
        }

        *outgoing = Some(tx);
        self.set_state(ConnectionState::Connected);
    }

    /// Drop the outgoing channel; undelivered frames go back to the queue.
    fn detach(&self, rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
        let mut queue = lock(&self.queue);
        let mut outgoing = lock(&self.outgoing);
        *outgoing = None;

        let mut undelivered = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outgoing::Frame { path, payload } = item {
                undelivered.push(QueuedMessage { path, payload });
            }
        }
        if !undelivered.is_empty() {
            log::debug!("Requeueing {} undelivered frames", undelivered.len());
            queue.requeue_front(undelivered);
        }
    }

    fn send(&self, path: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut queue = lock(&self.queue);
        let outgoing = lock(&self.outgoing);

        let payload = match outgoing.as_ref() {
            Some(tx) => match tx.send(Outgoing::Frame {
                path: path.to_string(),
                payload,
            }) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(Outgoing::Frame { payload, .. })) => payload,
                Err(_) => return Err(ProtocolError::ConnectionClosed),
            },
            None => payload,
        };

        if queue.enqueue(path, payload) {
            Ok(())
        } else {
            log::warn!("Body sync queue full, dropping message for {path}");
            Err(ProtocolError::ConnectionClosed)
        }
    }

    fn send_control(&self, message: &ControlMessage) -> bool {
        let Ok(json) = message.to_json() else {
            return false;
        };
        let outgoing = lock(&self.outgoing);
        outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(Outgoing::Text(json)).is_ok())
    }

    fn handle_binary(&self, data: &[u8]) {
        let (path, payload) = match unframe_message(data) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Dropping unframeable body sync message: {e}");
                return;
            }
        };

        let handler = {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.get_mut(&path).map(|sub| {
                sub.received_data = true;
                Arc::clone(&sub.on_message)
            })
        };
        match handler.or_else(|| lock(&self.fallback).clone()) {
            Some(handler) => handler(&path, &payload),
            None => log::debug!("No handler for body sync message on {path}"),
        }
    }

    fn handle_text(&self, text: &str) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring control message: {e}");
                return;
            }
        };

        match &message {
            ControlMessage::SyncProgress { completed, total } => {
                self.progress.send_replace((*completed, *total));
            }
            ControlMessage::SyncComplete { files_synced } => {
                let newly_synced = self.mark_all_synced();
                log::debug!(
                    "Server sync complete ({files_synced} files), {} subscriptions newly synced",
                    newly_synced.len()
                );
                for (path, handler) in newly_synced {
                    if let Some(handler) = handler {
                        handler(&path);
                    }
                }
            }
            _ => {}
        }
        let _ = self.control.send(message);
    }

    fn mark_all_synced(&self) -> Vec<(String, Option<SyncedHandler>)> {
        let subscriptions = lock(&self.subscriptions);
        subscriptions
            .iter()
            .filter(|(_, sub)| !*sub.synced.borrow())
            .map(|(path, sub)| {
                sub.synced.send_replace(true);
                (path.clone(), sub.on_synced.clone())
            })
            .collect()
    }
}

/// Client side of the multiplexed body protocol.
pub struct MultiplexedBodySync {
    shared: Arc<Shared>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MultiplexedBodySync {
    pub fn new(config: BodySyncConfig, source: Arc<dyn SyncStepSource>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (control, _) = broadcast::channel(256);
        let (progress, _) = watch::channel((0, 0));
        let queue = SendQueue::new(config.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                state,
                subscriptions: Mutex::new(HashMap::new()),
                queue: Mutex::new(queue),
                outgoing: Mutex::new(None),
                focus: Mutex::new(BTreeSet::new()),
                fallback: Mutex::new(None),
                control,
                progress,
                destroyed: AtomicBool::new(false),
            }),
            stop: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BodySyncConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Control frames as they arrive (progress, completion, focus lists, acks).
    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlMessage> {
        self.shared.control.subscribe()
    }

    /// Last `sync_progress` received: `(completed, total)`.
    pub fn sync_progress(&self) -> (usize, usize) {
        *self.shared.progress.borrow()
    }

    /// Start the connection task. Returns immediately; see [`Self::wait_connected`].
    pub fn connect(&self) -> Result<(), ProtocolError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let url = self.shared.config.connect_url()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        *lock(&self.stop) = Some(stop_tx);
        *task = Some(tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            url,
            stop_rx,
        )));
        Ok(())
    }

    /// Wait until connected; false on timeout or terminal state.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        let result = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Destroyed)),
        )
        .await;
        matches!(result, Ok(Ok(ref s)) if **s == ConnectionState::Connected)
    }

    /// Close the socket without reconnecting. `connect` may be called again.
    pub async fn disconnect(&self) {
        let stop = lock(&self.stop).take();
        if let Some(stop) = stop {
            let _ = stop.send(true);
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                log::warn!("Body sync connection task did not stop in time");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Terminal shutdown: close, drop every subscription, stop reconnecting.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect().await;
        lock(&self.shared.subscriptions).clear();
        lock(&self.shared.fallback).take();
        let dropped = lock(&self.shared.queue).discard();
        if dropped > 0 {
            log::debug!("Dropped {dropped} queued messages on destroy");
        }
        self.shared.set_state(ConnectionState::Destroyed);
    }

    /// Register a stream for `path` and send (or queue) its SyncStep1.
    pub fn subscribe(
        &self,
        path: &str,
        on_message: MessageHandler,
        on_synced: Option<SyncedHandler>,
    ) -> Result<(), ProtocolError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let (synced, _) = watch::channel(false);
        lock(&self.shared.subscriptions).insert(
            path.to_string(),
            Subscription {
                on_message,
                on_synced,
                received_data: false,
                synced,
            },
        );
        let step1 = self.shared.source.create_sync_step1(path);
        self.shared.send(path, step1)
    }

    pub fn unsubscribe(&self, path: &str) -> bool {
        lock(&self.shared.subscriptions).remove(path).is_some()
    }

    pub fn is_subscribed(&self, path: &str) -> bool {
        lock(&self.shared.subscriptions).contains_key(path)
    }

    pub fn subscribed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.shared.subscriptions).keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn subscription_status(&self, path: &str) -> Option<SubscriptionStatus> {
        lock(&self.shared.subscriptions)
            .get(path)
            .map(|sub| SubscriptionStatus {
                received_data: sub.received_data,
                synced: *sub.synced.borrow(),
            })
    }

    /// Handler for binary messages on paths nobody is subscribed to.
    pub fn set_fallback_handler(&self, handler: Option<MessageHandler>) {
        *lock(&self.shared.fallback) = handler;
    }

    /// Send a framed message now, or queue it until connected.
    pub fn send(&self, path: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.shared.send(path, payload)
    }

    /// Send a control frame if connected. Not queued.
    pub fn send_control(&self, message: &ControlMessage) -> bool {
        self.shared.send_control(message)
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Drop everything waiting for a connection; returns how many were dropped.
    pub fn discard_queued_local_sync_updates(&self) -> usize {
        let dropped = lock(&self.shared.queue).discard();
        if dropped > 0 {
            log::info!("Discarded {dropped} queued local sync updates");
        }
        dropped
    }

    pub fn focus(&self, paths: &[String]) {
        let added: Vec<String> = {
            let mut focus = lock(&self.shared.focus);
            paths
                .iter()
                .filter(|p| focus.insert((*p).clone()))
                .cloned()
                .collect()
        };
        if !added.is_empty() {
            self.shared
                .send_control(&ControlMessage::Focus { files: added });
        }
    }

    pub fn unfocus(&self, paths: &[String]) {
        let removed: Vec<String> = {
            let mut focus = lock(&self.shared.focus);
            paths.iter().filter(|p| focus.remove(*p)).cloned().collect()
        };
        if !removed.is_empty() {
            self.shared
                .send_control(&ControlMessage::Unfocus { files: removed });
        }
    }

    pub fn focused(&self) -> Vec<String> {
        lock(&self.shared.focus).iter().cloned().collect()
    }

    /// Wait for `path` to be marked synced. False on timeout or if the path
    /// is not subscribed.
    pub async fn wait_for_sync(&self, path: &str, timeout: Duration) -> bool {
        let rx = lock(&self.shared.subscriptions)
            .get(path)
            .map(|sub| sub.synced.subscribe());
        match rx {
            Some(rx) => wait_synced(rx, timeout).await,
            None => false,
        }
    }

    /// Wait for every current subscription. False on timeout.
    pub async fn wait_for_all_syncs(&self, timeout: Duration) -> bool {
        let receivers: Vec<watch::Receiver<bool>> = lock(&self.shared.subscriptions)
            .values()
            .map(|sub| sub.synced.subscribe())
            .collect();
        let waits = receivers.into_iter().map(|mut rx| async move {
            rx.wait_for(|synced| *synced).await.is_ok()
        });
        match tokio::time::timeout(timeout, futures_util::future::join_all(waits)).await {
            Ok(results) => results.into_iter().all(|ok| ok),
            Err(_) => false,
        }
    }
}

impl Drop for MultiplexedBodySync {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn wait_synced(mut rx: watch::Receiver<bool>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
        Ok(Ok(_))
    )
}

/// Connect, drive, and reconnect with backoff until stopped or out of attempts.
async fn run_connection(shared: Arc<Shared>, url: String, mut stop: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = stop.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                log::info!("Body sync connected to {url}");
                attempt = 0;
                drive(&shared, ws, &mut stop).await;
                shared.set_state(ConnectionState::Disconnected);
                if *stop.borrow() {
                    break;
                }
                log::info!("Body sync connection lost");
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                log::warn!("Body sync connect attempt {} failed: {e}", attempt + 1);
            }
        }

        if attempt >= shared.config.max_reconnect_attempts {
            log::error!(
                "Body sync giving up after {} reconnect attempts",
                shared.config.max_reconnect_attempts
            );
            break;
        }
        let delay = shared.config.backoff(attempt);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
}

async fn drive(shared: &Shared, ws: WsStream, stop: &mut watch::Receiver<bool>) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.attach(tx);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let message = match outgoing {
                    Some(Outgoing::Frame { path, payload }) => {
                        Message::Binary(frame_message(&path, &payload).into())
                    }
                    Some(Outgoing::Text(json)) => Message::Text(json.into()),
                    None => break,
                };
                if let Err(e) = sink.send(message).await {
                    log::warn!("Body sync send failed: {e}");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => shared.handle_binary(&data),
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Body sync socket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = stop.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    shared.detach(&mut rx);
}
