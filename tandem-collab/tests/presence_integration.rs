//! Integration tests for real-time presence and cursor synchronization.
//!
//! These tests start a real server and connect clients, verifying cursor
//! broadcast, roster delivery on join, and carets following remote edits.

use std::sync::Arc;

use tandem_collab::client::{ClientConfig, ConnectionManager, ConnectionState, SyncEvent};
use tandem_collab::protocol::ParticipantInfo;
use tandem_collab::server::{ServerConfig, SyncServer};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout, Duration, Instant};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> (u16, Arc<SyncServer>) {
    let port = free_port().await;
    let config = ServerConfig { bind_addr: format!("127.0.0.1:{port}"), ..ServerConfig::for_testing() };
    let server = Arc::new(SyncServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (port, server)
}

/// Connect a client and wait for its Connected event.
async fn connect_client(name: &str, doc_id: Uuid, port: u16) -> (ConnectionManager, Receiver<SyncEvent>) {
    let mut client = ConnectionManager::new(
        ParticipantInfo::random(name),
        doc_id,
        format!("ws://127.0.0.1:{port}"),
        ClientConfig::for_testing(),
    );
    let mut events = client.take_event_rx().unwrap();
    client.connect().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    (client, events)
}

async fn wait_for(events: &mut Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_cursor_broadcast_to_peer() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connect_client("Alice", doc_id, port).await;
    let (_bob, mut bob_events) = connect_client("Bob", doc_id, port).await;

    alice.insert(0, "hello world").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(alice.update_cursor(6, Some((6, 11))).await);

    let alice_id = alice.participant().participant_id;
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, SyncEvent::PresenceChanged(p) if p.participant_id == alice_id && p.cursor_offset == 6)
    })
    .await;
    match event {
        SyncEvent::PresenceChanged(presence) => {
            assert_eq!(presence.selection, Some((6, 11)));
            assert!(presence.updated_at > 0, "server should stamp presence");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_joiner_receives_roster_and_presence() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connect_client("Alice", doc_id, port).await;
    alice.insert(0, "abcdef").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(alice.update_cursor(4, None).await);
    sleep(Duration::from_millis(50)).await;

    let (bob, _bob_events) = connect_client("Bob", doc_id, port).await;
    let peers = bob.peers().await;
    let alice_peer = peers
        .iter()
        .find(|p| p.info.participant_id == alice.participant().participant_id)
        .expect("Alice missing from roster");
    assert_eq!(alice_peer.info.display_name, "Alice");
    assert_eq!(alice_peer.cursor_offset(), Some(4));
}

#[tokio::test]
async fn test_join_and_leave_announced() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (_alice, mut alice_events) = connect_client("Alice", doc_id, port).await;
    let (mut bob, _bob_events) = connect_client("Bob", doc_id, port).await;
    let bob_id = bob.participant().participant_id;

    let joined = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantJoined(_))).await;
    assert!(matches!(joined, SyncEvent::ParticipantJoined(info) if info.participant_id == bob_id));

    bob.close().await;
    let left = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantLeft(_))).await;
    assert!(matches!(left, SyncEvent::ParticipantLeft(id) if id == bob_id));
}

#[tokio::test]
async fn test_remote_caret_follows_edits() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connect_client("Alice", doc_id, port).await;
    let (bob, mut bob_events) = connect_client("Bob", doc_id, port).await;

    alice.insert(0, "world").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteOp(_))).await;

    // Alice's caret sits inside "wo|rld".
    assert!(alice.update_cursor(2, None).await);
    let alice_id = alice.participant().participant_id;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PresenceChanged(p) if p.participant_id == alice_id)).await;

    // Bob types in front of it; Alice's caret as seen by Bob moves right.
    bob.insert(0, "hello ").await.unwrap();
    let peers = bob.peers().await;
    let alice_peer = peers.iter().find(|p| p.info.participant_id == alice_id).unwrap();
    assert_eq!(alice_peer.cursor_offset(), Some(8));
}

#[tokio::test]
async fn test_cursor_dropped_after_close() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (mut alice, _events) = connect_client("Alice", doc_id, port).await;
    assert_eq!(alice.state().await, ConnectionState::Connected);
    alice.close().await;
    assert!(!alice.update_cursor(1, None).await);
}

#[tokio::test]
async fn test_presence_rate_limited_per_client() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let mut alice = ConnectionManager::new(
        ParticipantInfo::random("Alice"),
        doc_id,
        format!("ws://127.0.0.1:{port}"),
        ClientConfig { presence_interval: Duration::from_secs(60), ..ClientConfig::for_testing() },
    );
    alice.connect().unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while alice.state().await != ConnectionState::Connected {
        assert!(Instant::now() < deadline);
        sleep(Duration::from_millis(10)).await;
    }

    // Joining published presence, so the next minute is throttled.
    assert!(!alice.update_cursor(1, None).await);
    assert!(!alice.update_cursor(2, None).await);
    assert_eq!(alice.local_presence().await.cursor_offset, 2);
}

#[tokio::test]
async fn test_active_file_reaches_peer() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connect_client("Alice", doc_id, port).await;
    let (_bob, mut bob_events) = connect_client("Bob", doc_id, port).await;

    assert!(alice.set_active_file(Some("src/main.rs".into())).await);
    let alice_id = alice.participant().participant_id;
    wait_for(&mut bob_events, |e| {
        matches!(e, SyncEvent::PresenceChanged(p)
            if p.participant_id == alice_id && p.active_file.as_deref() == Some("src/main.rs"))
    })
    .await;
}

#[tokio::test]
async fn test_idle_cursor_dropped() {
    let (port, _server) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let (alice, _alice_events) = connect_client("Alice", doc_id, port).await;
    let mut bob = ConnectionManager::new(
        ParticipantInfo::random("Bob"),
        doc_id,
        format!("ws://127.0.0.1:{port}"),
        ClientConfig { presence_idle_timeout: Duration::from_millis(300), ..ClientConfig::for_testing() },
    );
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Connected { .. })).await;

    let alice_id = alice.participant().participant_id;
    assert!(alice.update_cursor(0, None).await);
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PresenceChanged(p) if p.participant_id == alice_id)).await;

    // Alice stays connected but stops moving her caret.
    let expired = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PresenceExpired(_))).await;
    assert!(matches!(expired, SyncEvent::PresenceExpired(id) if id == alice_id));

    let peers = bob.peers().await;
    let alice_peer = peers.iter().find(|p| p.info.participant_id == alice_id).expect("Alice left the roster");
    assert_eq!(alice_peer.cursor_offset(), None);

    // The next update brings the cursor back.
    assert!(alice.update_cursor(0, None).await);
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PresenceChanged(p) if p.participant_id == alice_id)).await;
    let peers = bob.peers().await;
    assert_eq!(peers.iter().find(|p| p.info.participant_id == alice_id).unwrap().cursor_offset(), Some(0));
}
