//! Message envelope and transport seam.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{GroupId, Message, ReplicaDesc, StoreId};

/// The wire envelope for one raft message. Coalesced heartbeats use
/// `NO_GROUP` and node IDs in the replica descriptors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftMessageRequest {
    pub group_id: GroupId,
    pub to_replica: ReplicaDesc,
    pub from_replica: ReplicaDesc,
    pub message: Message,
}

/// Outbound message sink. Implementations route by `to_replica.store_id`.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, req: RaftMessageRequest) -> anyhow::Result<()>;
}

/// In-process transport used by tests and single-process clusters:
/// stores register an inbound channel and messages are routed directly.
#[derive(Default)]
pub struct LocalTransport {
    routes: Mutex<HashMap<StoreId, mpsc::UnboundedSender<RaftMessageRequest>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, store_id: StoreId, sink: mpsc::UnboundedSender<RaftMessageRequest>) {
        self.routes
            .lock()
            .expect("transport routes lock")
            .insert(store_id, sink);
    }

    pub fn unregister(&self, store_id: StoreId) {
        self.routes
            .lock()
            .expect("transport routes lock")
            .remove(&store_id);
    }
}

impl Transport for LocalTransport {
    fn send(&self, req: RaftMessageRequest) -> anyhow::Result<()> {
        let routes = self.routes.lock().expect("transport routes lock");
        let Some(sink) = routes.get(&req.to_replica.store_id) else {
            anyhow::bail!("no route to store {}", req.to_replica.store_id);
        };
        sink.send(req)
            .map_err(|_| anyhow::anyhow!("destination store stopped"))
    }
}
