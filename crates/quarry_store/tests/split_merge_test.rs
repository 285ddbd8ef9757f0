//! Range split and merge through the admin path.

mod common;

use common::{batch_of, bootstrapped_store};
use quarry_store::batch::{Request, RequestHeader, Response};
use quarry_store::error::Error;
use quarry_store::keys;
use quarry_store::mvcc;
use quarry_store::Timestamp;

fn admin_split(split_key: &[u8]) -> Request {
    Request::AdminSplit {
        header: RequestHeader::point(split_key),
        split_key: split_key.to_vec(),
        split_trigger: None,
    }
}

#[tokio::test]
async fn split_partitions_the_key_space() {
    let ts = bootstrapped_store().await;
    ts.put(b"apple", b"1").await;
    ts.put(b"zebra", b"2").await;
    assert_eq!(ts.store.replica_count(), 1);

    let br = ts
        .send(batch_of(vec![admin_split(b"m")]))
        .await
        .expect("split");
    assert!(matches!(br.responses[0], Response::AdminSplit));
    assert_eq!(ts.store.replica_count(), 2);

    // Routing: both halves exist and the boundary is the split key.
    let left = ts.store.lookup_replica(b"apple", &[]).expect("left range");
    let right = ts.store.lookup_replica(b"zebra", &[]).expect("right range");
    assert_ne!(left.range_id(), right.range_id());
    assert_eq!(left.desc().end_key, b"m".to_vec());
    assert_eq!(right.desc().start_key, b"m".to_vec());
    assert_eq!(right.desc().end_key, keys::KEY_MAX.to_vec());
    // Both halves carry the same replica set.
    assert_eq!(left.desc().replicas, right.desc().replicas);

    // Existing data still reads back, through both ranges.
    assert_eq!(ts.get(b"apple").await.expect("value"), b"1".to_vec());
    assert_eq!(ts.get(b"zebra").await.expect("value"), b"2".to_vec());

    // New writes to both halves work.
    ts.put(b"aardvark", b"3").await;
    ts.put(b"zulu", b"4").await;
    assert_eq!(ts.get(b"aardvark").await.expect("value"), b"3".to_vec());
    assert_eq!(ts.get(b"zulu").await.expect("value"), b"4".to_vec());

    // The meta2 addressing records cover both halves.
    let engine = ts.store.engine();
    let now = Timestamp::new(i64::MAX, 0);
    let (meta_left, _) = mvcc::mvcc_get(
        &*engine,
        &keys::range_meta_key(b"m"),
        now,
        false,
        None,
    )
    .expect("meta2 left");
    assert!(meta_left.is_some());
    let (meta_right, _) = mvcc::mvcc_get(
        &*engine,
        &keys::range_meta_key(keys::KEY_MAX),
        now,
        false,
        None,
    )
    .expect("meta2 right");
    assert!(meta_right.is_some());
}

#[tokio::test]
async fn split_rejects_keys_outside_the_range() {
    let ts = bootstrapped_store().await;
    ts.send(batch_of(vec![admin_split(b"m")]))
        .await
        .expect("first split");

    // Splitting the left half at its own boundary is invalid.
    let left = ts.store.lookup_replica(b"a", &[]).expect("left");
    let mut ba = batch_of(vec![admin_split(b"m")]);
    ba.header.range_id = left.range_id();
    let err = ts.send(ba).await.expect_err("boundary split");
    assert!(matches!(err, Error::InvalidKey(_)));
}

#[tokio::test]
async fn merge_reunites_collocated_ranges() {
    let ts = bootstrapped_store().await;
    ts.put(b"apple", b"1").await;
    ts.put(b"zebra", b"2").await;
    ts.send(batch_of(vec![admin_split(b"m")]))
        .await
        .expect("split");
    assert_eq!(ts.store.replica_count(), 2);

    let left = ts.store.lookup_replica(b"a", &[]).expect("left");
    let mut merge = batch_of(vec![Request::AdminMerge {
        header: RequestHeader::point(&left.desc().start_key.clone()),
        merge_trigger: None,
    }]);
    merge.header.range_id = left.range_id();
    let br = ts.send(merge).await.expect("merge");
    assert!(matches!(br.responses[0], Response::AdminMerge));

    assert_eq!(ts.store.replica_count(), 1);
    let merged = ts.store.lookup_replica(b"zebra", &[]).expect("merged");
    assert_eq!(merged.range_id(), left.range_id());
    assert_eq!(merged.desc().end_key, keys::KEY_MAX.to_vec());

    // Data from both former halves is intact.
    assert_eq!(ts.get(b"apple").await.expect("value"), b"1".to_vec());
    assert_eq!(ts.get(b"zebra").await.expect("value"), b"2".to_vec());
    ts.put(b"quail", b"3").await;
    assert_eq!(ts.get(b"quail").await.expect("value"), b"3".to_vec());
}

#[tokio::test]
async fn retried_commands_survive_a_split() {
    use quarry_store::batch::{BatchHeader, BatchRequest, ClientCmdId};

    let ts = bootstrapped_store().await;
    // Execute an increment on the far side of the future split point.
    let cmd_id = ClientCmdId::random(7);
    let make_batch = || BatchRequest {
        header: BatchHeader {
            cmd_id: Some(cmd_id),
            ..Default::default()
        },
        requests: vec![Request::Increment {
            header: RequestHeader::point(b"zebra-counter"),
            increment: 3,
        }],
    };
    ts.send(make_batch()).await.expect("first increment");

    ts.send(batch_of(vec![admin_split(b"m")]))
        .await
        .expect("split");

    // The retry routes to the new right-hand range, whose response
    // cache was copied from the original.
    let replay = ts.send(make_batch()).await.expect("replay");
    match &replay.responses[0] {
        Response::Increment { new_value } => assert_eq!(*new_value, 3),
        other => panic!("unexpected response {other:?}"),
    }
}
