//! Shared harness for store integration tests: a bootstrapped
//! single-replica store over an in-memory engine with a manual clock.
#![allow(dead_code)]

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use quarry_raft::LocalTransport;
use quarry_store::batch::{BatchHeader, BatchRequest, Request, RequestHeader, Response};
use quarry_store::clock::Clock;
use quarry_store::engine::MemEngine;
use quarry_store::error::Result;
use quarry_store::store::{RetryOptions, Store, StoreConfig};
use quarry_store::value::Value;
use quarry_store::{BatchResponse, StoreIdent, Timestamp};

/// One second of manual-clock time, in nanoseconds.
pub const SECOND: i64 = 1_000_000_000;

pub struct TestStore {
    pub store: Arc<Store>,
    pub time: Arc<AtomicI64>,
}

pub async fn bootstrapped_store() -> TestStore {
    let engine = Arc::new(MemEngine::new());
    let (clock, time) = Clock::manual(10 * SECOND);
    let transport = Arc::new(LocalTransport::new());
    let mut cfg = StoreConfig::new(Arc::new(clock), transport);
    // Keep test retries snappy and bounded.
    cfg.range_retry_options = RetryOptions {
        initial_backoff: Duration::from_millis(2),
        max_backoff: Duration::from_millis(20),
        multiplier: 2,
        max_retries: 200,
    };
    cfg.raft_tick_interval = Duration::from_millis(10);

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
    TestStore { store, time }
}

pub fn put_req(key: &[u8], value: &[u8]) -> Request {
    Request::Put {
        header: RequestHeader::point(key),
        value: Value::from_bytes(value.to_vec()),
    }
}

pub fn get_req(key: &[u8]) -> Request {
    Request::Get {
        header: RequestHeader::point(key),
    }
}

pub fn batch_of(requests: Vec<Request>) -> BatchRequest {
    BatchRequest {
        header: BatchHeader::default(),
        requests,
    }
}

pub fn batch_at(ts: Timestamp, requests: Vec<Request>) -> BatchRequest {
    BatchRequest {
        header: BatchHeader {
            timestamp: ts,
            ..Default::default()
        },
        requests,
    }
}

impl TestStore {
    pub async fn send(&self, ba: BatchRequest) -> Result<BatchResponse> {
        self.store.send(ba).await
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) {
        self.send(batch_of(vec![put_req(key, value)]))
            .await
            .expect("put");
    }

    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let br = self
            .send(batch_of(vec![get_req(key)]))
            .await
            .expect("get");
        match br.responses.into_iter().next() {
            Some(Response::Get { value }) => value.map(|v| v.raw),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
