//! End-to-end tests driving the store's public send path.

mod common;

use std::sync::atomic::Ordering;

use common::{batch_at, batch_of, bootstrapped_store, get_req, put_req, SECOND};
use quarry_store::batch::{
    BatchHeader, BatchRequest, ClientCmdId, Request, RequestHeader, Response,
};
use quarry_store::error::Error;
use quarry_store::txn::IsolationLevel;
use quarry_store::value::Value;
use quarry_store::{Timestamp, Transaction};

#[tokio::test]
async fn scan_and_reverse_scan_return_visible_rows() {
    let ts = bootstrapped_store().await;
    ts.put(b"aa", b"1").await;
    ts.put(b"ab", b"2").await;
    ts.put(b"bb", b"3").await;

    let br = ts
        .send(batch_of(vec![Request::Scan {
            header: RequestHeader::span(b"a", b"b"),
            max_results: 100,
        }]))
        .await
        .expect("scan");
    match &br.responses[0] {
        Response::Scan { rows } => {
            let keys: Vec<&[u8]> = rows.iter().map(|r| r.key.as_slice()).collect();
            assert_eq!(keys, vec![&b"aa"[..], b"ab"]);
            assert_eq!(rows[0].value.as_bytes(), b"1");
            assert_eq!(rows[1].value.as_bytes(), b"2");
        }
        other => panic!("unexpected response {other:?}"),
    }

    let br = ts
        .send(batch_of(vec![Request::ReverseScan {
            header: RequestHeader::span(b"ab", b"c"),
            max_results: 100,
        }]))
        .await
        .expect("reverse scan");
    match &br.responses[0] {
        Response::ReverseScan { rows } => {
            let keys: Vec<&[u8]> = rows.iter().map(|r| r.key.as_slice()).collect();
            assert_eq!(keys, vec![&b"bb"[..], b"ab"]);
            assert_eq!(rows[0].value.as_bytes(), b"3");
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn conditional_put_enforces_expectations() {
    let ts = bootstrapped_store().await;
    ts.put(b"aa", b"1").await;

    // Correct expectation succeeds.
    ts.send(batch_of(vec![Request::ConditionalPut {
        header: RequestHeader::point(b"aa"),
        value: Value::from_bytes(b"2".to_vec()),
        expected: Some(Value::from_bytes(b"1".to_vec())),
    }]))
    .await
    .expect("conditional put");

    // Stale expectation fails and leaves the stored value alone.
    let err = ts
        .send(batch_of(vec![Request::ConditionalPut {
            header: RequestHeader::point(b"aa"),
            value: Value::from_bytes(b"3".to_vec()),
            expected: Some(Value::from_bytes(b"1".to_vec())),
        }]))
        .await
        .expect_err("stale expectation");
    match err {
        Error::ConditionFailed { actual, index } => {
            assert_eq!(actual.expect("actual value").as_bytes(), b"2");
            assert_eq!(index, Some(0));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(ts.get(b"aa").await.expect("value"), b"2".to_vec());
}

#[tokio::test]
async fn mutating_commands_are_idempotent_by_command_id() {
    let ts = bootstrapped_store().await;
    let cmd_id = ClientCmdId::random(1);
    let make_batch = || BatchRequest {
        header: BatchHeader {
            cmd_id: Some(cmd_id),
            ..Default::default()
        },
        requests: vec![Request::Increment {
            header: RequestHeader::point(b"counter"),
            increment: 5,
        }],
    };

    let first = ts.send(make_batch()).await.expect("first increment");
    let second = ts.send(make_batch()).await.expect("replayed increment");
    assert_eq!(first.responses, second.responses);
    match &second.responses[0] {
        Response::Increment { new_value } => assert_eq!(*new_value, 5),
        other => panic!("unexpected response {other:?}"),
    }

    // A distinct command ID actually increments.
    let third = ts
        .send(batch_of(vec![Request::Increment {
            header: RequestHeader::point(b"counter"),
            increment: 5,
        }]))
        .await
        .expect("fresh increment");
    match &third.responses[0] {
        Response::Increment { new_value } => assert_eq!(*new_value, 10),
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn write_too_old_retries_above_existing_version() {
    let ts = bootstrapped_store().await;
    let high = Timestamp::new(5 * SECOND, 0);
    ts.send(batch_at(high, vec![put_req(b"k", b"newer")]))
        .await
        .expect("put at high timestamp");

    // A write below the existing version retries immediately above it.
    let low = Timestamp::new(1 * SECOND, 0);
    ts.send(batch_at(low, vec![put_req(b"k", b"later")]))
        .await
        .expect("retried write");

    let br = ts
        .send(batch_of(vec![get_req(b"k")]))
        .await
        .expect("get");
    match &br.responses[0] {
        Response::Get { value } => {
            let value = value.as_ref().expect("value");
            assert_eq!(value.as_bytes(), b"later");
            assert!(value.timestamp.expect("version ts") > high);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn future_timestamps_are_rejected_beyond_max_offset() {
    use quarry_raft::LocalTransport;
    use quarry_store::clock::Clock;
    use quarry_store::engine::MemEngine;
    use quarry_store::store::{Store, StoreConfig};
    use quarry_store::StoreIdent;
    use std::sync::Arc;
    use std::time::Duration;

    let engine = Arc::new(MemEngine::new());
    let max_offset = Duration::from_millis(250);
    let clock = Arc::new(Clock::with_source(max_offset, || 10 * SECOND));
    let cfg = StoreConfig::new(clock, Arc::new(LocalTransport::new()));
    let store = Arc::new(Store::new(cfg, engine).expect("store config"));
    store
        .bootstrap(StoreIdent {
            cluster_id: "test-cluster".to_string(),
            node_id: 1,
            store_id: 1,
        })
        .expect("bootstrap");
    store.bootstrap_range(Vec::new()).expect("bootstrap range");
    store.start().await.expect("start");

    // More than max_offset ahead of the local clock: rejected.
    let future = Timestamp::new(11 * SECOND, 0);
    let err = store
        .send(batch_at(future, vec![put_req(b"k", b"v")]))
        .await
        .expect_err("future write");
    assert!(matches!(err, Error::TimestampTooFar { .. }));

    // Within the offset: admitted.
    let near_future = Timestamp::new(10 * SECOND + 100_000_000, 0);
    store
        .send(batch_at(near_future, vec![put_req(b"k", b"v")]))
        .await
        .expect("near-future write");
}

#[tokio::test]
async fn reader_pushes_pending_writer_and_reads_beneath_intent() {
    let ts = bootstrapped_store().await;
    ts.put(b"k", b"orig").await;

    // A low-priority transaction leaves an intent on the key.
    ts.time.fetch_add(SECOND, Ordering::SeqCst);
    let now = ts.store.clock().now();
    let writer = Transaction::new(b"k", -1, IsolationLevel::Serializable, now, 0);
    let mut ba = batch_at(writer.timestamp, vec![put_req(b"k", b"provisional")]);
    ba.header.txn = Some(writer.clone());
    ts.send(ba).await.expect("intent write");

    // A higher-priority read at a later timestamp pushes the writer's
    // timestamp out of the way and sees the pre-intent value.
    ts.time.fetch_add(SECOND, Ordering::SeqCst);
    let read_ts = ts.store.clock().now();
    let mut read = batch_at(read_ts, vec![get_req(b"k")]);
    read.header.user_priority = -10;
    let br = ts.send(read).await.expect("read after push");
    match &br.responses[0] {
        Response::Get { value } => {
            assert_eq!(value.as_ref().expect("value").as_bytes(), b"orig");
        }
        other => panic!("unexpected response {other:?}"),
    }

    // The pushed writer's record now sits above the read timestamp.
    let ba = batch_of(vec![Request::PushTxn {
        header: RequestHeader::point(b"k"),
        pusher: None,
        pushee: writer,
        push_to: read_ts,
        now: ts.store.clock().now(),
        push_type: quarry_store::txn::PushTxnType::PushTimestamp,
    }]);
    let br = ts.send(ba).await.expect("inspect pushee");
    match &br.responses[0] {
        Response::PushTxn { pushee } => {
            let pushee = pushee.as_ref().expect("pushee record");
            assert!(pushee.timestamp > read_ts);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn uncertain_reads_surface_with_the_node_id() {
    let ts = bootstrapped_store().await;
    let write_ts = Timestamp::new(5 * SECOND, 0);
    ts.send(batch_at(write_ts, vec![put_req(b"k", b"future")]))
        .await
        .expect("put");

    let read_ts = Timestamp::new(2 * SECOND, 0);
    let mut reader = Transaction::new(b"r", -1, IsolationLevel::Serializable, read_ts, 0);
    reader.max_timestamp = Timestamp::new(8 * SECOND, 0);
    let mut ba = batch_at(read_ts, vec![get_req(b"k")]);
    ba.header.txn = Some(reader);
    let err = ts.send(ba).await.expect_err("uncertain read");
    match err {
        Error::ReadWithinUncertaintyInterval {
            existing, node_id, ..
        } => {
            assert_eq!(existing, write_ts);
            assert_eq!(node_id, 1);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn transactional_write_and_commit_resolves_intents() {
    let ts = bootstrapped_store().await;
    let now = ts.store.clock().now();
    let txn = Transaction::new(b"a", -5, IsolationLevel::Serializable, now, 0);

    let mut ba = batch_at(txn.timestamp, vec![put_req(b"a", b"in-txn")]);
    ba.header.txn = Some(txn.clone());
    ts.send(ba).await.expect("transactional write");

    // Commit through EndTransaction, resolving the intent locally.
    let mut commit = batch_at(
        txn.timestamp,
        vec![Request::EndTransaction {
            header: RequestHeader::point(b"a"),
            commit: true,
            intents: vec![RequestHeader::point(b"a")],
            split_trigger: None,
            merge_trigger: None,
            change_replicas_trigger: None,
        }],
    );
    commit.header.txn = Some(txn.clone());
    let br = ts.send(commit).await.expect("commit");
    match &br.responses[0] {
        Response::EndTransaction { txn: Some(t) } => {
            assert_eq!(t.status, quarry_store::TxnStatus::Committed);
        }
        other => panic!("unexpected response {other:?}"),
    }

    // The committed value is now visible to plain reads.
    assert_eq!(ts.get(b"a").await.expect("value"), b"in-txn".to_vec());
}

#[tokio::test]
async fn applied_commit_and_last_index_are_ordered() {
    let ts = bootstrapped_store().await;
    for i in 0..5u8 {
        ts.put(&[b'k', i], b"v").await;
    }
    let replica = ts.store.get_replica(1).expect("range 1");
    let status = ts.store.raft_status(1).await.expect("raft status");
    assert!(replica.applied_index() <= status.commit);
    assert!(status.commit <= replica.last_log_index());
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let ts = bootstrapped_store().await;
    // Start key at KeyMax.
    let err = ts
        .send(batch_of(vec![put_req(b"\xff\xff", b"v")]))
        .await
        .expect_err("keymax start");
    assert!(matches!(err, Error::InvalidKey(_)));

    // Range op with inverted span.
    let err = ts
        .send(batch_of(vec![Request::Scan {
            header: RequestHeader::span(b"b", b"a"),
            max_results: 0,
        }]))
        .await
        .expect_err("inverted span");
    assert!(matches!(err, Error::InvalidKey(_)));

    // Point op carrying an end key.
    let err = ts
        .send(batch_of(vec![Request::Get {
            header: RequestHeader::span(b"a", b"b"),
        }]))
        .await
        .expect_err("get with end key");
    assert!(matches!(err, Error::InvalidKey(_)));
}

#[tokio::test]
async fn delete_range_hides_keys_from_scans() {
    let ts = bootstrapped_store().await;
    ts.put(b"a", b"1").await;
    ts.put(b"b", b"2").await;
    ts.put(b"c", b"3").await;

    let br = ts
        .send(batch_of(vec![Request::DeleteRange {
            header: RequestHeader::span(b"a", b"c"),
            max_entries: 0,
        }]))
        .await
        .expect("delete range");
    match &br.responses[0] {
        Response::DeleteRange { num_deleted } => assert_eq!(*num_deleted, 2),
        other => panic!("unexpected response {other:?}"),
    }
    assert!(ts.get(b"a").await.is_none());
    assert!(ts.get(b"b").await.is_none());
    assert_eq!(ts.get(b"c").await.expect("value"), b"3".to_vec());
}
