//! Persistence integration tests.
//!
//! Verifies:
//! - Accepted operations survive a restart and are replayed on recovery
//! - Recovery resumes from the last snapshot plus the log after it
//! - Duplicate detection survives a restart
//! - The WebSocket server writes through to RocksDB

use std::sync::Arc;

use tandem_collab::protocol::ParticipantInfo;
use tandem_collab::registry::{RegistryConfig, SessionRegistry};
use tandem_collab::retry::RetryPolicy;
use tandem_collab::sequencer::Sequenced;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::{OperationStore, RocksStore, StoreConfig};
use tandem_collab::client::{ClientConfig, ConnectionManager, ConnectionState};
use tandem_core::{OpId, Operation};
use tempfile::tempdir;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn registry(store: Arc<RocksStore>) -> SessionRegistry {
    let config = RegistryConfig { append_retry: RetryPolicy::for_testing(), ..RegistryConfig::default() };
    SessionRegistry::new(store, config)
}

/// Join and append `texts` one after another at the end of the document.
async fn write_texts(registry: &SessionRegistry, doc_id: Uuid, texts: &[&str]) -> ParticipantInfo {
    let info = ParticipantInfo::random("writer");
    let outcome = registry.join(doc_id, info.clone(), None).await.unwrap();
    let mut revision = outcome.snapshot.revision;
    let mut len = outcome.snapshot.content.chars().count();
    for (i, text) in texts.iter().enumerate() {
        let op = Operation::insert(OpId::new(info.participant_id, i as u64 + 1), doc_id, revision, len, *text);
        let sequenced = registry.submit(outcome.token, op, revision).await.unwrap();
        revision = sequenced.accepted().revision;
        len += text.chars().count();
    }
    info
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_crash_recovery_replays_log() {
    let dir = tempdir().unwrap();
    let doc_id = Uuid::new_v4();

    {
        let store = open_store(dir.path());
        let registry = registry(store);
        write_texts(&registry, doc_id, &["Hello", ", ", "world"]).await;
        // Dropped without anyone leaving: no snapshot was written.
    }

    let store = open_store(dir.path());
    assert!(store.load_snapshot(doc_id).unwrap().is_none());
    assert_eq!(store.read_from(doc_id, 0).unwrap().len(), 3);

    let server = SyncServer::with_store(ServerConfig::for_testing(), store);
    assert_eq!(server.recover().await.unwrap(), 1);
    let snapshot = server.registry().snapshot(doc_id).await.unwrap();
    assert_eq!(snapshot.content, "Hello, world");
    assert_eq!(snapshot.revision, 3);
}

#[tokio::test]
async fn test_recovery_from_snapshot_and_tail() {
    let dir = tempdir().unwrap();
    let doc_id = Uuid::new_v4();

    {
        let store = open_store(dir.path());
        let registry = registry(store.clone());
        let info = ParticipantInfo::random("first");
        let outcome = registry.join(doc_id, info.clone(), None).await.unwrap();
        let op = Operation::insert(OpId::new(info.participant_id, 1), doc_id, 0, 0, "base");
        registry.submit(outcome.token, op, 0).await.unwrap();
        registry.leave(outcome.token).await;
        assert_eq!(store.load_snapshot(doc_id).unwrap().unwrap().revision, 1);

        write_texts(&registry, doc_id, &[" plus", " tail"]).await;
    }

    let store = open_store(dir.path());
    let registry = registry(store);
    let info = ParticipantInfo::random("reader");
    let outcome = registry.join(doc_id, info, None).await.unwrap();
    assert_eq!(outcome.snapshot.content, "base plus tail");
    assert_eq!(outcome.snapshot.revision, 3);
}

#[tokio::test]
async fn test_duplicates_detected_after_restart() {
    let dir = tempdir().unwrap();
    let doc_id = Uuid::new_v4();

    let writer = {
        let store = open_store(dir.path());
        let registry = registry(store);
        write_texts(&registry, doc_id, &["once"]).await
    };

    let store = open_store(dir.path());
    let registry = registry(store.clone());
    let outcome = registry.join(doc_id, writer.clone(), None).await.unwrap();
    let replay = Operation::insert(OpId::new(writer.participant_id, 1), doc_id, 0, 0, "once");
    match registry.submit(outcome.token, replay, 0).await.unwrap() {
        Sequenced::Duplicate(original) => assert_eq!(original.revision, 1),
        Sequenced::Accepted(a) => panic!("re-accepted as revision {}", a.revision),
    }
    assert_eq!(store.read_from(doc_id, 0).unwrap().len(), 1);

    let next = Operation::insert(OpId::new(writer.participant_id, 2), doc_id, 1, 4, "!");
    let accepted = registry.submit(outcome.token, next, 1).await.unwrap();
    assert_eq!(accepted.accepted().revision, 2);
}

#[tokio::test]
async fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let docs: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

    {
        let store = open_store(dir.path());
        let registry = registry(store);
        for (i, doc_id) in docs.iter().enumerate() {
            let text = format!("document {i}");
            write_texts(&registry, *doc_id, &[text.as_str()]).await;
        }
    }

    let store = open_store(dir.path());
    let mut listed = store.list_documents().unwrap();
    listed.sort();
    let mut expected = docs.clone();
    expected.sort();
    assert_eq!(listed, expected);

    let server = SyncServer::with_store(ServerConfig::for_testing(), store);
    assert_eq!(server.recover().await.unwrap(), docs.len());
    for (i, doc_id) in docs.iter().enumerate() {
        let snapshot = server.registry().snapshot(*doc_id).await.unwrap();
        assert_eq!(snapshot.content, format!("document {i}"));
    }
}

#[tokio::test]
async fn test_server_writes_through_to_rocksdb() {
    let dir = tempdir().unwrap();
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::for_testing()
    };
    let server = Arc::new(SyncServer::open(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;

    let doc_id = Uuid::new_v4();
    let mut alice = ConnectionManager::new(
        ParticipantInfo::random("Alice"),
        doc_id,
        format!("ws://127.0.0.1:{port}"),
        ClientConfig::for_testing(),
    );
    alice.connect().unwrap();
    alice.insert(0, "persist me").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !(alice.is_synced().await && alice.state().await == ConnectionState::Connected) {
        assert!(Instant::now() < deadline, "edit never acknowledged");
        sleep(Duration::from_millis(20)).await;
    }

    let stored = server.registry().store().read_from(doc_id, 0).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].op.inserted_text(), "persist me");
}
