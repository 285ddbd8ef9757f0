//! Core raft state and wire types shared by the consensus core and the
//! multi-group runtime.

use serde::{Deserialize, Serialize};

use crate::RaftError;

/// Identifies one consensus group (one replicated range).
pub type GroupId = u64;
/// Identifies one replica within a group. Replica IDs are never reused
/// within a group; a re-added store gets a fresh one.
pub type ReplicaId = u64;
/// Identifies one node (one process).
pub type NodeId = u64;
/// Identifies one store (one persistent device) on a node.
pub type StoreId = u64;

/// Sentinel group ID used by coalesced heartbeats, which address nodes
/// rather than groups.
pub const NO_GROUP: GroupId = 0;

/// Durable voter state. Must be persisted before any dependent vote or
/// log promise is acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: ReplicaId,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// The voting membership of a group, as replica IDs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<ReplicaId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfChange,
}

/// One raft log entry. Indices are contiguous starting at
/// `truncated_state.index + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind,
            data,
        }
    }

    /// Approximate encoded size, used for the `max_bytes` cutoff in
    /// `GroupStorage::entries`.
    pub fn encoded_len(&self) -> u64 {
        (8 + 8 + 1 + self.data.len()) as u64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// A point-in-time copy of a group's state machine plus the metadata raft
/// needs to resume the log after it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Propose,
    Append,
    AppendResp,
    Vote,
    VoteResp,
    Heartbeat,
    HeartbeatResp,
    Snap,
}

/// A raft protocol message. `from`/`to` carry replica IDs, except for
/// coalesced heartbeats (group `NO_GROUP`) where they carry node IDs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub from: u64,
    pub to: u64,
    pub term: u64,
    /// Term of the entry preceding `entries` (Append), or of the sender's
    /// last entry (Vote).
    pub log_term: u64,
    /// Index of the entry preceding `entries` (Append), the sender's last
    /// index (Vote), or the acknowledged index (AppendResp).
    pub index: u64,
    pub commit: u64,
    pub reject: bool,
    pub reject_hint: u64,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
}

impl Message {
    pub fn new(kind: MessageKind, from: u64, to: u64, term: u64) -> Self {
        Self {
            kind,
            from,
            to,
            term,
            log_term: 0,
            index: 0,
            commit: 0,
            reject: false,
            reject_hint: 0,
            entries: Vec::new(),
            snapshot: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Volatile per-group state surfaced through `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftState {
    pub leader: ReplicaId,
    pub role: Role,
}

/// One batch of pending work pulled from a group: state to persist,
/// entries to apply, and messages to send. The caller must persist
/// `hard_state`, `snapshot`, and `entries` before sending `messages` or
/// applying `committed_entries`, then call `advance`.
#[derive(Debug, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.soft_state.is_none()
            && self.hard_state.is_none()
            && self.entries.is_empty()
            && self.snapshot.is_none()
            && self.committed_entries.is_empty()
            && self.messages.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddReplica,
    RemoveReplica,
}

/// A proposed membership change, carried through the log as a
/// `ConfChange` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub replica_id: ReplicaId,
    pub context: Vec<u8>,
}

/// Where a replica lives: its node, its store, and its ID within the group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDesc {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl ReplicaDesc {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id == 0 || self.store_id == 0 || self.replica_id == 0 {
            return Err(RaftError::InvalidReplica(format!(
                "replica descriptor {self:?} has a zero field"
            )));
        }
        Ok(())
    }
}

/// Identifies a client command across proposal retries. Committed commands
/// are prefixed with their ID on the wire so the application can dedup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub [u8; 16]);

impl CommandId {
    pub fn random() -> Self {
        let mut buf = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut buf);
        Self(buf)
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Prefix a command payload with its ID for the raft log.
pub fn encode_command(id: CommandId, command: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + command.len());
    out.extend_from_slice(&id.0);
    out.extend_from_slice(command);
    out
}

/// Split an encoded log payload back into `(id, command)`.
pub fn decode_command(data: &[u8]) -> anyhow::Result<(CommandId, &[u8])> {
    anyhow::ensure!(data.len() >= 16, "log payload shorter than a command id");
    let mut id = [0u8; 16];
    id.copy_from_slice(&data[..16]);
    Ok((CommandId(id), &data[16..]))
}

/// Context attached to a membership-change entry so the application can
/// recover the originating command and replica on commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfChangeContext {
    pub command_id: CommandId,
    pub payload: Vec<u8>,
    pub replica: ReplicaDesc,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip_preserves_id_and_payload() {
        let id = CommandId::random();
        let encoded = encode_command(id, b"payload");
        let (decoded_id, payload) = decode_command(&encoded).expect("decode");
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(decode_command(&[1, 2, 3]).is_err());
    }

    #[test]
    fn replica_desc_validation() {
        let ok = ReplicaDesc {
            node_id: 1,
            store_id: 1,
            replica_id: 3,
        };
        assert!(ok.validate().is_ok());
        let bad = ReplicaDesc {
            node_id: 1,
            store_id: 0,
            replica_id: 3,
        };
        assert!(bad.validate().is_err());
    }
}
