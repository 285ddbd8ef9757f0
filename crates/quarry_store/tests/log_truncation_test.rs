//! Raft log truncation and replica tombstones.

mod common;

use common::{batch_of, bootstrapped_store};
use quarry_raft::{GroupStorage, RaftError};
use quarry_store::batch::{Request, RequestHeader};
use quarry_store::mvcc;
use quarry_store::value::Value;
use quarry_store::{keys, Timestamp};

#[tokio::test]
async fn truncate_log_advances_the_truncated_state() {
    let ts = bootstrapped_store().await;
    for i in 0..8u8 {
        ts.put(&[b'k', i], b"v").await;
    }
    let replica = ts.store.get_replica(1).expect("range 1");
    let applied = replica.applied_index();
    let first_before = replica.first_index().expect("first");
    assert!(applied > first_before);

    ts.send(batch_of(vec![Request::TruncateLog {
        header: RequestHeader::point(b""),
        index: applied,
    }]))
    .await
    .expect("truncate");

    let first_after = replica.first_index().expect("first");
    assert_eq!(first_after, applied);
    // The compaction boundary answers term lookups; entries below it
    // are gone.
    assert!(replica.term(applied - 1).is_ok());
    assert!(matches!(
        replica.entries(first_before, first_before + 1, 0),
        Err(RaftError::Unavailable)
    ));
    // Entries at and above the boundary survive, and the log stays
    // contiguous.
    let last = replica.last_log_index();
    let count = replica.entries(first_after, last + 1, 0).expect("tail").len() as u64;
    assert_eq!(last - first_after + 1, count);
}

#[tokio::test]
async fn destroyed_replica_leaves_a_tombstone() {
    let ts = bootstrapped_store().await;
    ts.put(b"doomed", b"v").await;
    let replica = ts.store.get_replica(1).expect("range 1");
    let next_replica_id = replica.desc().next_replica_id;

    ts.store
        .destroy_replica(replica.clone())
        .await
        .expect("destroy");
    assert!(ts.store.get_replica(1).is_err());

    // The data is gone and the tombstone records the next replica ID.
    let engine = ts.store.engine();
    let (value, _) = mvcc::mvcc_get(&*engine, b"doomed", Timestamp::new(i64::MAX, 0), true, None)
        .expect("get");
    assert!(value.is_none());
    let tombstone = mvcc::mvcc_get_inline(&*engine, &keys::raft_tombstone_key(1))
        .expect("tombstone read")
        .expect("tombstone present");
    let tombstone: quarry_store::data::RaftTombstone =
        bincode::deserialize(tombstone.as_bytes()).expect("decode");
    assert_eq!(tombstone.next_replica_id, next_replica_id);

    // Late commands observe the missing range.
    let err = ts
        .send(batch_of(vec![common::put_req(b"doomed", b"again")]))
        .await
        .expect_err("send to destroyed range");
    assert!(matches!(
        err,
        quarry_store::Error::RangeKeyMismatch { .. } | quarry_store::Error::RangeNotFound(_)
    ));
}

#[tokio::test]
async fn inline_values_round_trip_through_the_engine() {
    // Exercises the non-MVCC path the raft records use.
    let ts = bootstrapped_store().await;
    let engine = ts.store.engine();
    let mut batch = quarry_store::engine::Batch::new(&*engine);
    mvcc::mvcc_put_inline(&mut batch, b"\x00\x00\x00smark", Value::from_int(9))
        .expect("inline put");
    batch.commit().expect("commit");
    let v = mvcc::mvcc_get_inline(&*engine, b"\x00\x00\x00smark")
        .expect("inline get")
        .expect("present");
    assert_eq!(v.as_int().expect("int"), 9);
}
