//! Multi-group raft runtime.
//!
//! One store drives many consensus groups from a single loop task. The
//! crate provides the consensus core (`group`), the storage contract the
//! application implements per group (`storage`), the runtime that
//! multiplexes groups, coalesces heartbeats, and serializes persistence
//! (`multi`), and the wire envelope (`transport`).

pub mod group;
pub mod multi;
pub mod storage;
pub mod transport;
pub mod types;

pub use group::{CoreConfig, GroupStatus, RaftCore};
pub use multi::{ConfChangeCallback, Event, MultiRaft, MultiRaftConfig, StorageProvider};
pub use storage::{GroupStorage, MemGroupStorage, INITIAL_LOG_INDEX, INITIAL_LOG_TERM};
pub use transport::{LocalTransport, RaftMessageRequest, Transport};
pub use types::{
    decode_command, encode_command, CommandId, ConfChange, ConfChangeContext, ConfChangeKind,
    ConfState, Entry, EntryKind, GroupId, HardState, Message, MessageKind, NodeId, Ready,
    ReplicaDesc, ReplicaId, Role, Snapshot, SnapshotMetadata, SoftState, StoreId, NO_GROUP,
};

/// Errors surfaced by the consensus runtime and its storage contract.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The requested log entries were compacted away or never written.
    #[error("requested raft log entries are unavailable")]
    Unavailable,
    /// The group was deleted; commands pending against it will never
    /// commit.
    #[error("raft group deleted")]
    GroupDeleted,
    /// The runtime is shutting down.
    #[error("raft processing stopped")]
    Stopped,
    #[error("group {0} has no known leader")]
    NoLeader(GroupId),
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("invalid replica descriptor: {0}")]
    InvalidReplica(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for RaftError {
    fn from(err: anyhow::Error) -> Self {
        RaftError::Storage(err)
    }
}
