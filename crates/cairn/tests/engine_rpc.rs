//! End-to-end tests: client → framed transport → server → block
//! resolution manager, all over loopback. The manager handle is shared
//! with the test so reader-side visibility can be asserted directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cairn::{release_dead_txn, ServerHandle, WriteEngineClient, WriteEngineServer};
use cairn_brm::BlockResolutionManager;
use cairn_error::CairnError;
use cairn_lock::LockRegistry;
use cairn_net::{ConnectionPool, FramedListener, PoolConfig, ReadResult, TransportOptions};
use cairn_types::{BlockId, ExtentId, Hwm, SessionId, TableOid, TxnId, UniqueId, VersionId};

struct Harness {
    _tmp: tempfile::TempDir,
    manager: Arc<BlockResolutionManager>,
    pool: Arc<ConnectionPool>,
    endpoint: String,
    _server: ServerHandle,
}

impl Harness {
    fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let tmp = tempfile::tempdir().unwrap();
        let registry = LockRegistry::create(tmp.path()).unwrap();
        let manager = Arc::new(
            BlockResolutionManager::with_lock_timeout(&registry, Duration::from_secs(5)).unwrap(),
        );
        let opts = TransportOptions::default();
        let server =
            WriteEngineServer::bind("127.0.0.1:0", Arc::clone(&manager), opts).unwrap();
        let endpoint = server.local_addr().unwrap().to_string();
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            transport: opts,
            ..Default::default()
        }));
        Self {
            _tmp: tmp,
            manager,
            pool,
            endpoint,
            _server: server.spawn(),
        }
    }

    fn client(&self, session: u32) -> WriteEngineClient {
        WriteEngineClient::new(
            &self.endpoint,
            Arc::clone(&self.pool),
            SessionId(session),
            UniqueId(u64::from(session) * 100),
        )
        .with_reply_timeout(Duration::from_secs(5))
    }
}

#[test]
fn insert_commit_with_reader_isolation() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(10)).unwrap();
    let client = h.client(1);
    let txn = TxnId(100);

    let v = client
        .process_batch_insert(
            txn,
            TableOid(3001),
            ExtentId(1),
            Hwm(20),
            vec![11, 12, 13],
            b"three rows".to_vec(),
        )
        .unwrap();
    assert_eq!(v, VersionId(2));

    // Provisional state is invisible to readers until commit.
    assert_eq!(h.manager.committed_version(ExtentId(1)).unwrap(), VersionId(1));
    assert_eq!(h.manager.visible_version(ExtentId(1)), Some(VersionId(1)));

    client.batch_insert_end(txn, ExtentId(1), Hwm(23)).unwrap();
    let committed = client.commit_version(txn).unwrap();
    assert_eq!(committed, vec![ExtentId(1)]);

    assert_eq!(h.manager.committed_version(ExtentId(1)).unwrap(), VersionId(2));
    assert_eq!(h.manager.visible_version(ExtentId(1)), Some(VersionId(2)));
    assert_eq!(h.manager.snapshot(ExtentId(1)).unwrap().hwm, Hwm(23));
}

#[test]
fn written_lbids_track_inserts_and_updates() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(0)).unwrap();
    h.manager.create_extent(ExtentId(2), Hwm(0)).unwrap();
    let client = h.client(1);
    let txn = TxnId(200);

    client
        .process_batch_insert(txn, TableOid(1), ExtentId(1), Hwm(2), vec![0, 1], vec![])
        .unwrap();
    client
        .process_update(
            txn,
            TableOid(1),
            vec![BlockId {
                extent: ExtentId(2),
                offset: 5,
            }],
            b"new cell".to_vec(),
        )
        .unwrap();

    let mut written = client.get_written_lbids(txn).unwrap();
    written.sort();
    assert_eq!(
        written,
        vec![
            BlockId { extent: ExtentId(1), offset: 0 },
            BlockId { extent: ExtentId(1), offset: 1 },
            BlockId { extent: ExtentId(2), offset: 5 },
        ]
    );

    // Commit clears the tracking.
    client.commit_version(txn).unwrap();
    assert!(client.get_written_lbids(txn).unwrap().is_empty());
}

#[test]
fn rollback_blocks_after_simulated_crash() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(5)).unwrap();
    h.manager.create_extent(ExtentId(2), Hwm(5)).unwrap();
    let before = h.manager.snapshot(ExtentId(1)).unwrap();
    let client = h.client(1);
    let txn = TxnId(300);

    client
        .process_batch_insert(txn, TableOid(1), ExtentId(1), Hwm(9), vec![6, 7], vec![])
        .unwrap();
    client
        .process_batch_insert(txn, TableOid(1), ExtentId(2), Hwm(9), vec![6], vec![])
        .unwrap();

    // Recovery after a crash mid-batch: the recovered block list names only
    // extent 1; its prior committed state must come back exactly.
    let written = client.get_written_lbids(txn).unwrap();
    let extent1_blocks: Vec<BlockId> = written
        .iter()
        .copied()
        .filter(|b| b.extent == ExtentId(1))
        .collect();
    let discarded = client.rollback_blocks(txn, extent1_blocks).unwrap();
    assert_eq!(discarded, vec![ExtentId(1)]);
    assert_eq!(h.manager.snapshot(ExtentId(1)).unwrap(), before);

    // Extent 2 is still provisional under the open txn and can commit.
    assert_eq!(client.commit_version(txn).unwrap(), vec![ExtentId(2)]);
    assert_eq!(h.manager.committed_version(ExtentId(2)).unwrap(), VersionId(2));
}

#[test]
fn full_rollback_restores_snapshot() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(5)).unwrap();
    let before = h.manager.snapshot(ExtentId(1)).unwrap();
    let client = h.client(1);
    let txn = TxnId(400);

    client
        .process_batch_insert(txn, TableOid(1), ExtentId(1), Hwm(50), vec![6], vec![])
        .unwrap();
    assert_eq!(client.rollback_version(txn).unwrap(), vec![ExtentId(1)]);
    assert_eq!(h.manager.snapshot(ExtentId(1)).unwrap(), before);
    assert_eq!(h.manager.visible_version(ExtentId(1)), Some(VersionId(1)));
}

#[test]
fn busy_extent_surfaces_typed_error() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(0)).unwrap();
    let a = h.client(1);
    let b = h.client(2);

    a.process_batch_insert(TxnId(500), TableOid(1), ExtentId(1), Hwm(1), vec![0], vec![])
        .unwrap();
    let err = b
        .process_batch_insert(TxnId(501), TableOid(1), ExtentId(1), Hwm(1), vec![0], vec![])
        .unwrap_err();
    // Retryable by contract: the caller may back off and try again.
    assert!(err.is_transient());
    match err {
        CairnError::ExtentBusy { extent, holder } => {
            assert_eq!(extent, ExtentId(1));
            assert_eq!(holder, TxnId(500));
        }
        other => panic!("expected extent-busy, got {other}"),
    }
}

#[test]
fn unknown_extent_surfaces_not_found() {
    let h = Harness::start();
    let client = h.client(1);
    let err = client
        .process_batch_insert(TxnId(600), TableOid(1), ExtentId(404), Hwm(1), vec![], vec![])
        .unwrap_err();
    assert!(matches!(err, CairnError::NoSuchExtent(ExtentId(404))));
}

#[test]
fn concurrent_commit_and_rollback_over_rpc() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(0)).unwrap();
    h.manager.create_extent(ExtentId(2), Hwm(0)).unwrap();

    let a = h.client(1);
    let b = h.client(2);
    a.process_batch_insert(TxnId(700), TableOid(1), ExtentId(1), Hwm(3), vec![0], vec![])
        .unwrap();
    b.process_batch_insert(TxnId(701), TableOid(1), ExtentId(2), Hwm(3), vec![0], vec![])
        .unwrap();

    let ta = thread::spawn(move || a.commit_version(TxnId(700)).unwrap());
    let tb = thread::spawn(move || b.rollback_version(TxnId(701)).unwrap());
    assert_eq!(ta.join().unwrap(), vec![ExtentId(1)]);
    assert_eq!(tb.join().unwrap(), vec![ExtentId(2)]);

    assert_eq!(h.manager.committed_version(ExtentId(1)).unwrap(), VersionId(2));
    assert_eq!(h.manager.committed_version(ExtentId(2)).unwrap(), VersionId(1));
}

#[test]
fn dead_transaction_cleanup_releases_intents() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(0)).unwrap();
    let client = h.client(1);
    let txn = TxnId(800);

    client
        .process_batch_insert(txn, TableOid(1), ExtentId(1), Hwm(4), vec![0], vec![])
        .unwrap();
    // The session process dies; the watchdog cleans up by txn id.
    assert_eq!(release_dead_txn(&h.manager, txn).unwrap(), 1);
    assert_eq!(h.manager.snapshot(ExtentId(1)).unwrap().provisional_owner, None);

    // The extent is free for the next writer.
    let other = h.client(2);
    other
        .process_batch_insert(TxnId(801), TableOid(1), ExtentId(1), Hwm(4), vec![0], vec![])
        .unwrap();
}

#[test]
fn pooled_connection_is_reused_across_calls() {
    let h = Harness::start();
    h.manager.create_extent(ExtentId(1), Hwm(0)).unwrap();
    let client = h.client(1);

    client
        .process_batch_insert(TxnId(900), TableOid(1), ExtentId(1), Hwm(1), vec![0], vec![])
        .unwrap();
    client.commit_version(TxnId(900)).unwrap();
    assert_eq!(h.pool.total_count(&h.endpoint), 1);
    assert_eq!(h.pool.idle_count(&h.endpoint), 1);
}

#[test]
fn reply_timeout_is_surfaced_without_resend() {
    // An engine that reads requests but never answers. The commit may have
    // been processed with only the reply lost, so the client must report
    // the timeout rather than replay; a replay would bump the counter to
    // two.
    let listener = FramedListener::bind("127.0.0.1:0", TransportOptions::default()).unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let requests_seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&requests_seen);
    let engine = thread::spawn(move || {
        let mut sock = listener
            .accept(Some(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        while let Ok(ReadResult::Message(_)) = sock.read(Some(Duration::from_secs(5))) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let client = WriteEngineClient::new(&endpoint, pool, SessionId(1), UniqueId(1))
        .with_reply_timeout(Duration::from_millis(200));
    let err = client.commit_version(TxnId(5)).unwrap_err();
    assert!(
        matches!(err, CairnError::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut),
        "expected reply timeout, got {err:?}"
    );

    engine.join().unwrap();
    assert_eq!(requests_seen.load(Ordering::SeqCst), 1);
}
