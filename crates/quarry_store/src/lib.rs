//! Node-local core of a sharded, replicated, strongly-consistent
//! key-value store: the per-store range replica engine.
//!
//! The store owns many range replicas, each backed by a consensus group
//! multiplexed onto one runtime loop (`quarry_raft`). Batches route by
//! key to a replica, reads serve under the range lease, writes replicate
//! through the log and apply exactly once in order, and write-intent
//! conflicts resolve by pushing the offending transactions.

pub mod batch;
pub mod clock;
pub mod data;
pub mod engine;
pub mod error;
pub mod keys;
pub mod mvcc;
pub mod replica;
pub mod response_cache;
mod scanner;
pub mod store;
pub mod txn;
pub mod value;

pub use batch::{
    BatchHeader, BatchRequest, BatchResponse, ClientCmdId, Method, ReadConsistency, Request,
    RequestHeader, Response,
};
pub use clock::{Clock, Timestamp};
pub use data::{
    Lease, RaftTruncatedState, RangeDescriptor, RangeId, ReplicaDescriptor, StoreIdent,
};
pub use engine::{Batch, Engine, EngineReader, FjallEngine, MemEngine};
pub use error::{Error, Result};
pub use replica::{Replica, RAFT_INITIAL_LOG_INDEX, RAFT_INITIAL_LOG_TERM};
pub use store::{RetryOptions, Store, StoreConfig, GC_RESPONSE_CACHE_EXPIRATION};
pub use txn::{IsolationLevel, Transaction, TxnId, TxnStatus};
pub use value::{Value, ValueTag};
