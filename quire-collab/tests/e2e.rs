//! End-to-end tests: two workspaces syncing through a real relay, and live
//! share sessions on the control endpoint.

use std::sync::Arc;

use quire_collab::body_sync::BodySyncConfig;
use quire_collab::protocol::ControlMessage;
use quire_collab::server::{RelayServer, ServerConfig};
use quire_collab::session::{SessionRole, SyncSession};
use quire_collab::share::{ShareConfig, ShareError, ShareEvent, ShareSession, ShareState};
use quire_core::{EventSubscription, FileEvent, SyncEngine, WorkspaceOptions};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> (String, Arc<RelayServer>) {
    let port = free_port().await;
    let server = Arc::new(
        RelayServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap(),
    );
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn workspace(id: &str) -> Arc<SyncEngine> {
    SyncEngine::init_workspace(WorkspaceOptions {
        workspace_id: id.to_string(),
        ..WorkspaceOptions::for_testing()
    })
    .await
    .unwrap()
}

async fn connect(engine: &Arc<SyncEngine>, url: &str) -> Arc<SyncSession> {
    let config = BodySyncConfig::for_testing(url, engine.workspace_id());
    let session = SyncSession::new(Arc::clone(engine), config, SessionRole::Host);
    session.start().unwrap();
    assert!(session.wait_for_workspace(Duration::from_secs(2)).await);
    session
}

async fn next_event(sub: &mut EventSubscription) -> FileEvent {
    timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("event should arrive")
        .expect("bus open")
}

async fn next_share_event(rx: &mut broadcast::Receiver<ShareEvent>) -> ShareEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("share event should arrive")
        .unwrap()
}

/// Poll until `check` passes or two seconds elapse.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

const NOTE: &str = "+++\ntitle = \"Note\"\n+++\nHello";

// ─── Multi-device sync ──────────────────────────────────────────────

#[tokio::test]
async fn test_note_created_on_one_device_appears_on_the_other() {
    let (url, _server) = start_relay().await;
    let a = workspace("journal").await;
    let b = workspace("journal").await;
    let _sa = connect(&a, &url).await;
    let _sb = connect(&b, &url).await;
    let mut events = b.subscribe();

    a.fs().write_file("note.md", NOTE).await.unwrap();

    match next_event(&mut events).await {
        FileEvent::FileCreated { path, metadata } => {
            assert_eq!(path, "note.md");
            assert_eq!(metadata.title.as_deref(), Some("Note"));
        }
        other => panic!("expected FileCreated, got {other:?}"),
    }
    let written = b.fs().read_file("note.md").await.unwrap();
    assert!(written.contains("title = \"Note\""));
}

#[tokio::test]
async fn test_existing_state_reaches_late_joiner() {
    let (url, _server) = start_relay().await;
    let a = workspace("journal").await;
    a.fs().write_file("note.md", NOTE).await.unwrap();
    a.fs()
        .write_file("other.md", "+++\ntitle = \"Other\"\n+++\n")
        .await
        .unwrap();
    let _sa = connect(&a, &url).await;

    let b = workspace("journal").await;
    let _sb = connect(&b, &url).await;
    assert!(eventually(|| {
        b.store().get("note.md").is_some() && b.store().get("other.md").is_some()
    })
    .await);
    assert_eq!(
        b.store().get("other.md").unwrap().title.as_deref(),
        Some("Other")
    );
}

#[tokio::test]
async fn test_offline_edit_yields_exactly_one_change() {
    let (url, _server) = start_relay().await;
    let a = workspace("journal").await;
    let b = workspace("journal").await;
    let sa = connect(&a, &url).await;
    let _sb = connect(&b, &url).await;

    let mut events = b.subscribe();
    a.fs().write_file("note.md", NOTE).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        FileEvent::FileCreated { .. }
    ));

    sa.body_sync().disconnect().await;
    a.fs()
        .write_file("note.md", "+++\ntitle = \"Renamed\"\n+++\nHello")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_none());

    sa.body_sync().connect().unwrap();
    match next_event(&mut events).await {
        FileEvent::MetadataChanged { path, metadata } => {
            assert_eq!(path, "note.md");
            assert_eq!(metadata.title.as_deref(), Some("Renamed"));
        }
        other => panic!("expected MetadataChanged, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(300), events.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_body_edits_reach_peers_with_the_file_open() {
    let (url, _server) = start_relay().await;
    let a = workspace("journal").await;
    let b = workspace("journal").await;
    let sa = connect(&a, &url).await;
    let sb = connect(&b, &url).await;

    a.fs().write_file("note.md", NOTE).await.unwrap();
    assert!(eventually(|| b.store().get("note.md").is_some()).await);

    sa.open_file("note.md").unwrap();
    sb.open_file("note.md").unwrap();
    assert!(sa.wait_for_sync("note.md", Duration::from_secs(2)).await);
    assert!(sb.wait_for_sync("note.md", Duration::from_secs(2)).await);
    assert!(eventually(|| b.bodies().body("note.md") == "Hello").await);

    a.fs()
        .write_file("note.md", "+++\ntitle = \"Note\"\n+++\nHello again")
        .await
        .unwrap();
    assert!(eventually(|| b.bodies().body("note.md") == "Hello again").await);
    let written = b.fs().read_file("note.md").await.unwrap();
    assert!(written.contains("Hello again"));
}

#[tokio::test]
async fn test_blob_transfer_is_verified_and_acknowledged() {
    let (url, _server) = start_relay().await;
    let a = workspace("journal").await;
    let b = workspace("journal").await;
    let sa = connect(&a, &url).await;
    let sb = connect(&b, &url).await;
    let mut acks = sa.body_sync().subscribe_control();
    let mut blobs = sb.subscribe_blobs();

    let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let hash = sa.send_blob(&bytes).unwrap();

    let received = timeout(Duration::from_secs(2), blobs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.hash, hash);
    assert_eq!(received.bytes.as_slice(), bytes.as_slice());

    let ack = timeout(Duration::from_secs(2), async {
        loop {
            if let ControlMessage::BlobAck { hash, ok } = acks.recv().await.unwrap() {
                return (hash, ok);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ack, (hash, true));
}

// ─── Share sessions ─────────────────────────────────────────────────

fn is_join_code(code: &str) -> bool {
    code.len() == 17
        && code.char_indices().all(|(i, c)| {
            if i == 8 {
                c == '-'
            } else {
                c.is_ascii_uppercase() || c.is_ascii_digit()
            }
        })
}

#[tokio::test]
async fn test_host_receives_join_code() {
    let (url, server) = start_relay().await;
    let engine = workspace("shared").await;
    let host = ShareSession::new(ShareConfig::for_testing(&url), engine);

    let info = host.create_session("owner-1", false).await.unwrap();
    assert!(is_join_code(&info.join_code), "bad code {}", info.join_code);
    assert_eq!(info.workspace_id, "shared");
    assert!(!info.read_only);
    assert_eq!(host.state(), ShareState::Hosting);
    assert_eq!(server.session_codes().await, vec![info.join_code.clone()]);

    assert!(matches!(
        host.create_session("owner-1", false).await,
        Err(ShareError::AlreadyActive)
    ));

    host.end_session().await;
    assert_eq!(host.state(), ShareState::Idle);
    assert!(eventually(|| host.session_info().is_none()).await);
}

#[tokio::test]
async fn test_guest_joins_with_lowercase_code_and_leaves_cleanly() {
    let (url, _server) = start_relay().await;
    let host_engine = workspace("shared").await;
    host_engine.fs().write_file("note.md", NOTE).await.unwrap();
    let host = ShareSession::new(ShareConfig::for_testing(&url), Arc::clone(&host_engine));
    let mut host_events = host.subscribe_events();
    let info = host.create_session("owner-1", false).await.unwrap();

    let local = workspace("mine").await;
    let guest = ShareSession::new(ShareConfig::for_testing(&url), Arc::clone(&local));
    let mut guest_events = guest.subscribe_events();
    let joined = guest
        .join_session(&info.join_code.to_lowercase(), "guest-1")
        .await
        .unwrap();
    assert_eq!(joined.join_code, info.join_code);
    assert_eq!(joined.workspace_id, "shared");
    assert_eq!(guest.state(), ShareState::Guest);

    assert_eq!(
        next_share_event(&mut host_events).await,
        ShareEvent::PeerJoined("guest-1".into())
    );
    assert_eq!(host.roster(), vec!["guest-1".to_string()]);

    // The guest works on a throwaway copy of the host's workspace.
    let ephemeral = guest.active_engine();
    assert!(!Arc::ptr_eq(&ephemeral, &local));
    assert_eq!(ephemeral.workspace_id(), "shared");
    assert!(eventually(|| ephemeral.store().get("note.md").is_some()).await);
    assert!(local.store().get("note.md").is_none());

    host.end_session().await;
    assert_eq!(
        next_share_event(&mut guest_events).await,
        ShareEvent::SessionEnded
    );
    assert_eq!(guest.state(), ShareState::Idle);
    assert!(Arc::ptr_eq(&guest.active_engine(), &local));
    assert!(!ephemeral.is_active());
    assert!(local.is_active());
}

#[tokio::test]
async fn test_guest_leaving_updates_host_roster() {
    let (url, _server) = start_relay().await;
    let host = ShareSession::new(ShareConfig::for_testing(&url), workspace("shared").await);
    let mut host_events = host.subscribe_events();
    let info = host.create_session("owner-1", false).await.unwrap();

    let guest = ShareSession::new(ShareConfig::for_testing(&url), workspace("mine").await);
    guest.join_session(&info.join_code, "guest-2").await.unwrap();
    assert_eq!(
        next_share_event(&mut host_events).await,
        ShareEvent::PeerJoined("guest-2".into())
    );

    guest.end_session().await;
    assert_eq!(guest.state(), ShareState::Idle);
    assert_eq!(
        next_share_event(&mut host_events).await,
        ShareEvent::PeerLeft("guest-2".into())
    );
    assert!(host.roster().is_empty());
    assert_eq!(host.state(), ShareState::Hosting);
}

#[tokio::test]
async fn test_read_only_toggle_reaches_guest() {
    let (url, _server) = start_relay().await;
    let host = ShareSession::new(ShareConfig::for_testing(&url), workspace("shared").await);
    let info = host.create_session("owner-1", false).await.unwrap();

    let guest = ShareSession::new(ShareConfig::for_testing(&url), workspace("mine").await);
    let mut guest_events = guest.subscribe_events();
    let joined = guest.join_session(&info.join_code, "guest-1").await.unwrap();
    assert!(!joined.read_only);
    assert!(!guest.sync_session().unwrap().is_read_only());

    host.set_read_only(true).unwrap();
    assert_eq!(
        next_share_event(&mut guest_events).await,
        ShareEvent::ReadOnlyChanged(true)
    );
    assert!(guest.sync_session().unwrap().is_read_only());
    assert!(guest.session_info().unwrap().read_only);

    assert!(matches!(
        guest.set_read_only(false),
        Err(ShareError::NotHosting)
    ));
}

#[tokio::test]
async fn test_unknown_code_is_rejected_by_server() {
    let (url, _server) = start_relay().await;
    let guest = ShareSession::new(ShareConfig::for_testing(&url), workspace("mine").await);

    let err = guest
        .join_session("ABCDEFGH-12345678", "guest-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ShareError::Server(_)), "got {err:?}");
    assert_eq!(guest.state(), ShareState::Idle);
}

#[tokio::test]
async fn test_malformed_code_never_reaches_server() {
    let (url, server) = start_relay().await;
    let guest = ShareSession::new(ShareConfig::for_testing(&url), workspace("mine").await);

    for code in ["", "ABCDEFGH12345678", "ABCDEFG-12345678", "ABCDEFGH-1234567!"] {
        let err = guest.join_session(code, "guest-1").await.unwrap_err();
        assert!(matches!(err, ShareError::InvalidJoinCode(_)), "{code:?}");
    }
    assert_eq!(server.stats().await.total_connections, 0);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                // Complete the handshake, then say nothing.
                let _ws = tokio_tungstenite::accept_async(stream).await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
        }
    });

    let mut config = ShareConfig::for_testing(format!("ws://127.0.0.1:{port}"));
    config.connect_timeout = Duration::from_millis(200);
    let host = ShareSession::new(config, workspace("shared").await);

    let started = tokio::time::Instant::now();
    let err = host.create_session("owner-1", false).await.unwrap_err();
    assert!(matches!(err, ShareError::Timeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(host.state(), ShareState::Idle);
}
