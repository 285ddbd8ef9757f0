//! Range, replica, and store descriptors plus small persisted records.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::keys;

pub type RangeId = u64;
pub type NodeId = u64;
pub type StoreId = u64;
pub type ReplicaId = u64;

/// One copy of a range on one store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl ReplicaDescriptor {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.node_id > 0, "replica descriptor needs a node id");
        anyhow::ensure!(self.store_id > 0, "replica descriptor needs a store id");
        anyhow::ensure!(self.replica_id > 0, "replica descriptor needs a replica id");
        Ok(())
    }
}

/// Descriptor of one contiguous key interval `[start_key, end_key)`
/// replicated as one consensus group. Descriptors tile the key space
/// without gaps or overlaps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.range_id > 0, "range descriptor needs a range id");
        anyhow::ensure!(
            self.start_key < self.end_key,
            "range start {:?} must precede end {:?}",
            self.start_key,
            self.end_key
        );
        for rep in &self.replicas {
            rep.validate()?;
            anyhow::ensure!(
                rep.replica_id < self.next_replica_id,
                "replica id {} not below next replica id {}",
                rep.replica_id,
                self.next_replica_id
            );
        }
        Ok(())
    }

    /// Whether the (address) key falls inside this range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && key < self.end_key.as_slice()
    }

    /// Whether the (address) key span falls inside this range. An empty
    /// end behaves like a point lookup at `start`.
    pub fn contains_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        if end.is_empty() {
            return self.contains_key(start);
        }
        start >= self.start_key.as_slice() && end <= self.end_key.as_slice() && start < end
    }

    pub fn replica(&self, replica_id: ReplicaId) -> Option<ReplicaDescriptor> {
        self.replicas.iter().copied().find(|r| r.replica_id == replica_id)
    }

    pub fn replica_for_store(&self, store_id: StoreId) -> Option<ReplicaDescriptor> {
        self.replicas.iter().copied().find(|r| r.store_id == store_id)
    }

    /// Whether both descriptors carry the same replica set (nodes and
    /// stores; replica IDs may differ).
    pub fn replicas_collocated_with(&self, other: &RangeDescriptor) -> bool {
        if self.replicas.len() != other.replicas.len() {
            return false;
        }
        let mut a: Vec<(NodeId, StoreId)> =
            self.replicas.iter().map(|r| (r.node_id, r.store_id)).collect();
        let mut b: Vec<(NodeId, StoreId)> =
            other.replicas.iter().map(|r| (r.node_id, r.store_id)).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

/// Identity of a store within a cluster; written once at bootstrap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreIdent {
    pub cluster_id: String,
    pub node_id: NodeId,
    pub store_id: StoreId,
}

/// Metadata about the last log entry compacted away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftTruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Written when a replica is garbage collected so stale messages for
/// earlier incarnations are rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftTombstone {
    pub next_replica_id: ReplicaId,
}

/// The range lease. Only the holder may serve consistent reads or
/// propose writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub replica: ReplicaDescriptor,
    pub start: Timestamp,
    pub expiration: Timestamp,
    pub proposed_ts: Timestamp,
}

impl Lease {
    /// A lease covers a timestamp iff `start <= ts < expiration`.
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.expiration
    }

    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }
}

/// Coarse per-range size statistics, refreshed by background scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeStats {
    pub key_count: u64,
    pub total_bytes: u64,
    pub intent_count: u64,
}

/// Self-describing snapshot payload: the range descriptor plus every
/// engine key/value in the range's spans, raw.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RaftSnapshotData {
    pub range_descriptor: RangeDescriptor,
    pub kv: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Capacity report from the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    pub capacity: u64,
    pub available: u64,
}

/// Build a descriptor for a fresh range, assigning replica IDs in order.
pub fn new_range_descriptor(
    range_id: RangeId,
    start_key: &[u8],
    end_key: &[u8],
    replicas: &[ReplicaDescriptor],
) -> RangeDescriptor {
    let mut replicas: Vec<ReplicaDescriptor> = replicas.to_vec();
    for (i, rep) in replicas.iter_mut().enumerate() {
        rep.replica_id = (i + 1) as ReplicaId;
    }
    RangeDescriptor {
        range_id,
        start_key: start_key.to_vec(),
        end_key: end_key.to_vec(),
        next_replica_id: (replicas.len() + 1) as ReplicaId,
        replicas,
    }
}

/// Verify request keys: start must precede `KEY_MAX`; range operations
/// need `start < end <= KEY_MAX`; point operations must not carry an end
/// key; and range-local keys may not mix with global keys.
pub fn verify_keys(start: &[u8], end: &[u8], check_end_key: bool) -> anyhow::Result<()> {
    anyhow::ensure!(
        start < keys::KEY_MAX,
        "start key {start:?} must be less than KeyMax"
    );
    if !check_end_key {
        anyhow::ensure!(
            end.is_empty(),
            "end key {end:?} should not be specified for this operation"
        );
        return Ok(());
    }
    anyhow::ensure!(!end.is_empty(), "end key must be specified");
    anyhow::ensure!(
        end <= keys::KEY_MAX,
        "end key {end:?} must be less than or equal to KeyMax"
    );
    let s_addr = keys::addr(start)?;
    let e_addr = keys::addr(end)?;
    anyhow::ensure!(
        s_addr < e_addr,
        "end key {end:?} must be greater than start {start:?}"
    );
    if s_addr != start {
        anyhow::ensure!(
            e_addr != end,
            "start key is range-local, but end key is not"
        );
    } else {
        anyhow::ensure!(
            start >= keys::LOCAL_MAX,
            "start key in {start:?}-{end:?} must be greater than LocalMax"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u64) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: n,
            store_id: n,
            replica_id: n,
        }
    }

    fn desc(start: &[u8], end: &[u8]) -> RangeDescriptor {
        RangeDescriptor {
            range_id: 1,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            replicas: vec![replica(1)],
            next_replica_id: 2,
        }
    }

    #[test]
    fn containment_is_half_open() {
        let d = desc(b"b", b"m");
        assert!(d.contains_key(b"b"));
        assert!(d.contains_key(b"lzzz"));
        assert!(!d.contains_key(b"m"));
        assert!(!d.contains_key(b"a"));
        assert!(d.contains_key_range(b"b", b"m"));
        assert!(!d.contains_key_range(b"b", b"n"));
        assert!(d.contains_key_range(b"c", b""));
    }

    #[test]
    fn collocation_ignores_replica_ids_and_order() {
        let mut a = desc(b"a", b"c");
        a.replicas = vec![replica(1), replica(2)];
        let mut b = desc(b"c", b"e");
        b.replicas = vec![
            ReplicaDescriptor {
                node_id: 2,
                store_id: 2,
                replica_id: 7,
            },
            replica(1),
        ];
        assert!(a.replicas_collocated_with(&b));
        b.replicas.pop();
        assert!(!a.replicas_collocated_with(&b));
    }

    #[test]
    fn verify_keys_accepts_valid_spans() {
        assert!(verify_keys(b"a", b"", false).is_ok());
        assert!(verify_keys(b"a", b"b", true).is_ok());
        assert!(verify_keys(b"a", keys::KEY_MAX, true).is_ok());
    }

    #[test]
    fn verify_keys_rejects_invalid_spans() {
        // Start at or above KeyMax.
        assert!(verify_keys(keys::KEY_MAX, b"", false).is_err());
        // Point op with an end key.
        assert!(verify_keys(b"a", b"b", false).is_err());
        // Inverted span.
        assert!(verify_keys(b"b", b"a", true).is_err());
        // Missing end key for a range op.
        assert!(verify_keys(b"a", b"", true).is_err());
        // Global range op plowing through local keys.
        assert!(verify_keys(b"\x00\x00\x00zzz", b"b", true).is_err());
        // Local start with a global end.
        let local = keys::range_descriptor_key(b"a");
        assert!(verify_keys(&local, b"b", true).is_err());
    }

    #[test]
    fn local_range_spans_are_accepted() {
        let lo = keys::range_descriptor_key(b"a");
        let hi = keys::range_descriptor_key(b"b");
        assert!(verify_keys(&lo, &hi, true).is_ok());
    }

    #[test]
    fn new_descriptor_assigns_replica_ids() {
        let d = new_range_descriptor(5, b"a", b"z", &[replica(3), replica(9)]);
        assert_eq!(d.replicas[0].replica_id, 1);
        assert_eq!(d.replicas[1].replica_id, 2);
        assert_eq!(d.next_replica_id, 3);
        assert!(d.validate().is_ok());
    }
}
