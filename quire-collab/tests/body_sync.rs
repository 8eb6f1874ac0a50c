//! Multiplexed connection tests against a real relay.

use std::sync::Arc;

use quire_collab::body_sync::{
    BodySyncConfig, ConnectionState, MessageHandler, MultiplexedBodySync, SyncStepSource,
    SyncedHandler,
};
use quire_collab::protocol::{ControlMessage, ProtocolError};
use quire_collab::server::{RelayServer, ServerConfig};
use quire_core::crdt::{BodyDocs, DocMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its URL.
async fn start_relay() -> String {
    let port = free_port().await;
    let server = RelayServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn client(url: &str, workspace: &str) -> (MultiplexedBodySync, Arc<BodyDocs>) {
    let docs = Arc::new(BodyDocs::new(64));
    let source: Arc<dyn SyncStepSource> = Arc::clone(&docs) as Arc<dyn SyncStepSource>;
    let sync = MultiplexedBodySync::new(BodySyncConfig::for_testing(url, workspace), source);
    (sync, docs)
}

fn channel_handler() -> (MessageHandler, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |path: &str, payload: &[u8]| {
        let _ = tx.send((path.to_string(), payload.to_vec()));
    });
    (handler, rx)
}

/// Next `Update` message, skipping handshake traffic.
async fn next_update(
    rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    wait: Duration,
) -> Option<(String, Vec<u8>)> {
    timeout(wait, async {
        while let Some((path, payload)) = rx.recv().await {
            if matches!(DocMessage::decode(&payload), Ok(DocMessage::Update(_))) {
                return Some((path, payload));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn next_focus_list(rx: &mut broadcast::Receiver<ControlMessage>) -> Vec<String> {
    timeout(Duration::from_secs(2), async {
        loop {
            if let ControlMessage::FocusListChanged { files } = rx.recv().await.unwrap() {
                return files;
            }
        }
    })
    .await
    .expect("focus list should change")
}

#[tokio::test]
async fn test_queued_messages_flush_in_order() {
    let url = start_relay().await;

    let (reader, _) = client(&url, "ws-order");
    let (handler, mut rx) = channel_handler();
    reader.subscribe("a.md", handler, None).unwrap();
    reader.connect().unwrap();
    assert!(reader.wait_for_sync("a.md", Duration::from_secs(2)).await);

    // Writer edits while offline.
    let (writer, docs) = client(&url, "ws-order");
    let mut body = String::new();
    let mut expected = Vec::new();
    for i in 0..20 {
        body.push_str(&format!("{i},"));
        let update = docs.set_body("a.md", &body).unwrap();
        let payload = DocMessage::Update(update).encode();
        writer.send("a.md", payload.clone()).unwrap();
        expected.push(payload);
    }
    assert_eq!(writer.queued_len(), 20);

    writer.connect().unwrap();
    assert!(writer.wait_connected(Duration::from_secs(2)).await);

    for (i, payload) in expected.iter().enumerate() {
        let (path, received) = next_update(&mut rx, Duration::from_secs(2))
            .await
            .unwrap_or_else(|| panic!("update {i} never arrived"));
        assert_eq!(path, "a.md");
        assert_eq!(&received, payload, "update {i} out of order");
    }
    assert_eq!(writer.queued_len(), 0);
}

#[tokio::test]
async fn test_discarded_messages_are_never_sent() {
    let url = start_relay().await;

    let (reader, _) = client(&url, "ws-discard");
    let (handler, mut rx) = channel_handler();
    reader.subscribe("a.md", handler, None).unwrap();
    reader.connect().unwrap();
    assert!(reader.wait_for_sync("a.md", Duration::from_secs(2)).await);

    let (writer, docs) = client(&url, "ws-discard");
    for body in ["one", "one two", "one two three"] {
        let update = docs.set_body("a.md", body).unwrap();
        writer
            .send("a.md", DocMessage::Update(update).encode())
            .unwrap();
    }
    assert_eq!(writer.discard_queued_local_sync_updates(), 3);
    assert_eq!(writer.discard_queued_local_sync_updates(), 0);

    writer.connect().unwrap();
    assert!(writer.wait_connected(Duration::from_secs(2)).await);
    assert!(next_update(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_sync_complete_marks_subscriptions_synced() {
    let url = start_relay().await;
    let (sync, _) = client(&url, "ws-complete");
    let synced = Arc::new(std::sync::Mutex::new(Vec::new()));

    for path in ["a.md", "b.md"] {
        let (handler, _rx) = channel_handler();
        let synced = Arc::clone(&synced);
        let on_synced: SyncedHandler =
            Arc::new(move |path: &str| synced.lock().unwrap().push(path.to_string()));
        sync.subscribe(path, handler, Some(on_synced)).unwrap();
    }
    assert!(!sync.subscription_status("a.md").unwrap().synced);

    sync.connect().unwrap();
    assert!(sync.wait_for_all_syncs(Duration::from_secs(2)).await);

    let status = sync.subscription_status("b.md").unwrap();
    assert!(status.synced);
    assert!(status.received_data);
    let (completed, total) = sync.sync_progress();
    assert!(total >= 1);
    assert_eq!(completed, total);

    let mut seen = synced.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["a.md".to_string(), "b.md".to_string()]);
}

#[tokio::test]
async fn test_fallback_handler_receives_focused_paths() {
    let url = start_relay().await;

    let (writer, docs) = client(&url, "ws-fallback");
    let mut control = writer.subscribe_control();
    writer.connect().unwrap();
    assert!(writer.wait_connected(Duration::from_secs(2)).await);

    // The reader focuses a file it never subscribed to.
    let (reader, _) = client(&url, "ws-fallback");
    let (fallback, mut rx) = channel_handler();
    reader.set_fallback_handler(Some(fallback));
    reader.connect().unwrap();
    assert!(reader.wait_connected(Duration::from_secs(2)).await);
    reader.focus(&["b.md".to_string()]);
    assert_eq!(next_focus_list(&mut control).await, vec!["b.md".to_string()]);

    let update = docs.set_body("b.md", "hello").unwrap();
    writer
        .send("b.md", DocMessage::Update(update.clone()).encode())
        .unwrap();

    let (path, payload) = next_update(&mut rx, Duration::from_secs(2)).await.unwrap();
    assert_eq!(path, "b.md");
    assert_eq!(payload, DocMessage::Update(update).encode());
}

#[tokio::test]
async fn test_unfocused_unsubscribed_paths_are_filtered() {
    let url = start_relay().await;

    let (reader, _) = client(&url, "ws-filter");
    let (fallback, mut rx) = channel_handler();
    reader.set_fallback_handler(Some(fallback));
    reader.connect().unwrap();
    assert!(reader.wait_connected(Duration::from_secs(2)).await);

    let (writer, docs) = client(&url, "ws-filter");
    writer.connect().unwrap();
    assert!(writer.wait_connected(Duration::from_secs(2)).await);
    let update = docs.set_body("private.md", "not for you").unwrap();
    writer
        .send("private.md", DocMessage::Update(update).encode())
        .unwrap();

    assert!(next_update(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_focus_is_restored_after_reconnect() {
    let url = start_relay().await;

    let (observer, _) = client(&url, "ws-focus");
    let mut control = observer.subscribe_control();
    observer.connect().unwrap();
    assert!(observer.wait_connected(Duration::from_secs(2)).await);

    let (peer, _) = client(&url, "ws-focus");
    // Focus set offline is sent on connect.
    peer.focus(&["x.md".to_string()]);
    peer.connect().unwrap();
    assert_eq!(next_focus_list(&mut control).await, vec!["x.md".to_string()]);

    peer.disconnect().await;
    assert_eq!(peer.state(), ConnectionState::Disconnected);
    assert!(next_focus_list(&mut control).await.is_empty());

    peer.connect().unwrap();
    assert_eq!(next_focus_list(&mut control).await, vec!["x.md".to_string()]);
    assert_eq!(peer.focused(), vec!["x.md".to_string()]);
}

#[tokio::test]
async fn test_destroy_is_terminal() {
    let url = start_relay().await;
    let (sync, _) = client(&url, "ws-destroy");
    let (handler, _rx) = channel_handler();
    sync.subscribe("a.md", handler.clone(), None).unwrap();
    sync.connect().unwrap();
    assert!(sync.wait_connected(Duration::from_secs(2)).await);

    sync.destroy().await;
    assert_eq!(sync.state(), ConnectionState::Destroyed);
    assert!(sync.subscribed_paths().is_empty());
    assert_eq!(sync.connect(), Err(ProtocolError::ConnectionClosed));
    assert_eq!(
        sync.subscribe("b.md", handler, None),
        Err(ProtocolError::ConnectionClosed)
    );
    assert_eq!(
        sync.send("a.md", vec![2, 0, 0]),
        Err(ProtocolError::ConnectionClosed)
    );
    assert!(!sync.wait_connected(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_wait_for_sync_times_out_without_server() {
    let port = free_port().await;
    let (sync, _) = client(&format!("ws://127.0.0.1:{port}"), "ws-offline");
    let (handler, _rx) = channel_handler();
    sync.subscribe("a.md", handler, None).unwrap();
    sync.connect().unwrap();

    assert!(!sync.wait_for_sync("a.md", Duration::from_millis(150)).await);
    // The handshake stays queued for when a server shows up.
    assert_eq!(sync.queued_len(), 1);
    sync.destroy().await;
}
