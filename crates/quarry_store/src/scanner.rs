//! Background replica scanner.
//!
//! Every replica is considered at least once per scan interval, in
//! randomized order, by each maintenance queue: replica GC, raft log
//! truncation, size-based splitting, and response-cache/transaction GC.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::batch::{BatchHeader, BatchRequest, Request, RequestHeader};
use crate::clock::Timestamp;
use crate::mvcc;
use crate::replica::Replica;
use crate::store::Store;
use crate::txn::TXN_ABANDON_NANOS;

pub(crate) async fn run_scanner(store: Arc<Store>) {
    let interval = store.config().scan_interval;
    let idle = store.config().scan_max_idle_time;
    loop {
        tokio::time::sleep(interval).await;
        if !store.is_started() {
            continue;
        }
        let mut replicas = store.all_replicas();
        replicas.shuffle(&mut rand::thread_rng());
        for replica in replicas {
            process_replica(&store, &replica).await;
            if !idle.is_zero() {
                tokio::time::sleep(idle.min(Duration::from_secs(1))).await;
            }
        }
        store.update_gc_hints();
    }
}

async fn process_replica(store: &Arc<Store>, replica: &Arc<Replica>) {
    if !replica.is_initialized() {
        return;
    }
    let desc = replica.desc();
    let store_id = match store.ident() {
        Ok(ident) => ident.store_id,
        Err(_) => return,
    };

    // Replica GC: this store was removed from the range's membership.
    if desc.replica_for_store(store_id).is_none() {
        if let Err(err) = store.destroy_replica(replica.clone()).await {
            debug!(range = replica.range_id(), error = %err, "replica gc failed");
        }
        return;
    }

    maybe_truncate_log(store, replica).await;
    maybe_split(store, replica).await;
    maybe_gc(store, replica).await;
}

/// Truncate the raft log once it outgrows the configured threshold;
/// everything at or below the applied index is safe to drop.
async fn maybe_truncate_log(store: &Arc<Store>, replica: &Arc<Replica>) {
    let truncated = match replica.truncated_state() {
        Ok(ts) => ts,
        Err(_) => return,
    };
    let last = replica.last_log_index();
    let applied = replica.applied_index();
    if last.saturating_sub(truncated.index) <= store.config().raft_log_truncation_threshold {
        return;
    }
    if applied <= truncated.index + 1 {
        return;
    }
    let desc = replica.desc();
    let ba = BatchRequest {
        header: BatchHeader {
            range_id: replica.range_id(),
            ..Default::default()
        },
        requests: vec![Request::TruncateLog {
            header: RequestHeader::point(&desc.start_key),
            index: applied,
        }],
    };
    if let Err(err) = store.send(ba).await {
        debug!(range = replica.range_id(), error = %err, "log truncation failed");
    }
}

/// Split ranges that exceed the size threshold.
async fn maybe_split(store: &Arc<Store>, replica: &Arc<Replica>) {
    let desc = replica.desc();
    let stats = match mvcc::mvcc_range_stats(&*store.engine(), &desc.start_key, &desc.end_key) {
        Ok(stats) => stats,
        Err(_) => return,
    };
    if stats.total_bytes <= store.config().range_max_bytes {
        return;
    }
    debug!(
        range = replica.range_id(),
        bytes = stats.total_bytes,
        "range over size threshold; splitting"
    );
    let ba = BatchRequest {
        header: BatchHeader {
            range_id: replica.range_id(),
            ..Default::default()
        },
        requests: vec![Request::AdminSplit {
            header: RequestHeader::point(&desc.start_key),
            split_key: Vec::new(),
            split_trigger: None,
        }],
    };
    if let Err(err) = store.send(ba).await {
        debug!(range = replica.range_id(), error = %err, "size-based split failed");
    }
}

/// Expire response cache entries and settle abandoned transactions.
async fn maybe_gc(store: &Arc<Store>, replica: &Arc<Replica>) {
    let desc = replica.desc();
    let now = store.clock().now();
    let response_cache_expiration = Timestamp::new(
        now.wall_time - store.config().gc_response_cache_expiration.as_nanos() as i64,
        0,
    );
    let txn_expiration = Timestamp::new(now.wall_time - 2 * TXN_ABANDON_NANOS, 0);
    let ba = BatchRequest {
        header: BatchHeader {
            range_id: replica.range_id(),
            ..Default::default()
        },
        requests: vec![Request::Gc {
            header: RequestHeader::span(&desc.start_key, &desc.end_key),
            response_cache_expiration,
            txn_expiration,
        }],
    };
    if let Err(err) = store.send(ba).await {
        debug!(range = replica.range_id(), error = %err, "gc pass failed");
    }
}
