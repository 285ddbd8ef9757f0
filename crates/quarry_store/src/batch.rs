//! The typed request/response batch model.
//!
//! Requests are a closed union; each variant advertises flags that drive
//! routing, batching, and transaction handling. Batches split into
//! compatible sub-batches at the replica layer and their responses
//! combine back slot by slot.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::data::{RangeDescriptor, RangeId, ReplicaDescriptor};
use crate::error::{Error, Result};
use crate::mvcc::KeyValue;
use crate::txn::{PushTxnType, Transaction};
use crate::value::Value;

pub const IS_READ: u32 = 1;
pub const IS_WRITE: u32 = 1 << 1;
pub const IS_ADMIN: u32 = 1 << 2;
pub const IS_RANGE: u32 = 1 << 3;
pub const IS_REVERSE: u32 = 1 << 4;
pub const IS_TXN: u32 = 1 << 5;
pub const IS_TXN_WRITE: u32 = 1 << 6;
pub const IS_ALONE: u32 = 1 << 7;

/// Client-visible command identity, used by the response cache to make
/// mutating commands idempotent across retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientCmdId {
    pub wall_time: i64,
    pub random: i64,
}

impl ClientCmdId {
    pub fn random(wall_time: i64) -> Self {
        Self {
            wall_time,
            random: rand::thread_rng().gen(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wall_time == 0 && self.random == 0
    }
}

/// The span a request operates on; `end_key` is empty for point requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl RequestHeader {
    pub fn point(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            end_key: Vec::new(),
        }
    }

    pub fn span(key: &[u8], end_key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            end_key: end_key.to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Put,
    ConditionalPut,
    Increment,
    Delete,
    DeleteRange,
    Scan,
    ReverseScan,
    EndTransaction,
    AdminSplit,
    AdminMerge,
    HeartbeatTxn,
    Gc,
    PushTxn,
    ResolveIntent,
    ResolveIntentRange,
    Noop,
    TruncateLog,
    LeaderLease,
}

/// Trigger carried by a committed split: both descriptors were written
/// by the command and the store re-indexes the replicas after commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitTrigger {
    pub updated_desc: RangeDescriptor,
    pub new_desc: RangeDescriptor,
}

/// Trigger carried by a committed merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeTrigger {
    pub updated_desc: RangeDescriptor,
    pub subsumed_desc: RangeDescriptor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChangeType {
    AddReplica,
    RemoveReplica,
}

/// Trigger carried by a committed membership change. The raft layer must
/// understand it, so batches carrying one may contain nothing else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeReplicasTrigger {
    pub change_type: ReplicaChangeType,
    pub replica: ReplicaDescriptor,
    pub updated_replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get {
        header: RequestHeader,
    },
    Put {
        header: RequestHeader,
        value: Value,
    },
    ConditionalPut {
        header: RequestHeader,
        value: Value,
        expected: Option<Value>,
    },
    Increment {
        header: RequestHeader,
        increment: i64,
    },
    Delete {
        header: RequestHeader,
    },
    DeleteRange {
        header: RequestHeader,
        max_entries: u64,
    },
    Scan {
        header: RequestHeader,
        max_results: u64,
    },
    ReverseScan {
        header: RequestHeader,
        max_results: u64,
    },
    EndTransaction {
        header: RequestHeader,
        commit: bool,
        /// Spans written by the transaction whose intents can be
        /// resolved locally on commit or abort.
        intents: Vec<RequestHeader>,
        split_trigger: Option<SplitTrigger>,
        merge_trigger: Option<MergeTrigger>,
        change_replicas_trigger: Option<ChangeReplicasTrigger>,
    },
    AdminSplit {
        header: RequestHeader,
        split_key: Vec<u8>,
        /// Filled in by the admin path before proposing.
        split_trigger: Option<SplitTrigger>,
    },
    AdminMerge {
        header: RequestHeader,
        /// Filled in by the admin path before proposing.
        merge_trigger: Option<MergeTrigger>,
    },
    HeartbeatTxn {
        header: RequestHeader,
        now: Timestamp,
    },
    Gc {
        header: RequestHeader,
        response_cache_expiration: Timestamp,
        txn_expiration: Timestamp,
    },
    PushTxn {
        header: RequestHeader,
        pusher: Option<Transaction>,
        pushee: Transaction,
        push_to: Timestamp,
        /// The store's clock reading, never the batch timestamp, so an
        /// abandoned pushee eventually times out.
        now: Timestamp,
        push_type: PushTxnType,
    },
    ResolveIntent {
        header: RequestHeader,
        intent_txn: Transaction,
    },
    ResolveIntentRange {
        header: RequestHeader,
        intent_txn: Transaction,
    },
    Noop,
    TruncateLog {
        header: RequestHeader,
        index: u64,
    },
    LeaderLease {
        header: RequestHeader,
        lease: crate::data::Lease,
    },
}

static EMPTY_HEADER: RequestHeader = RequestHeader {
    key: Vec::new(),
    end_key: Vec::new(),
};

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Get { .. } => Method::Get,
            Request::Put { .. } => Method::Put,
            Request::ConditionalPut { .. } => Method::ConditionalPut,
            Request::Increment { .. } => Method::Increment,
            Request::Delete { .. } => Method::Delete,
            Request::DeleteRange { .. } => Method::DeleteRange,
            Request::Scan { .. } => Method::Scan,
            Request::ReverseScan { .. } => Method::ReverseScan,
            Request::EndTransaction { .. } => Method::EndTransaction,
            Request::AdminSplit { .. } => Method::AdminSplit,
            Request::AdminMerge { .. } => Method::AdminMerge,
            Request::HeartbeatTxn { .. } => Method::HeartbeatTxn,
            Request::Gc { .. } => Method::Gc,
            Request::PushTxn { .. } => Method::PushTxn,
            Request::ResolveIntent { .. } => Method::ResolveIntent,
            Request::ResolveIntentRange { .. } => Method::ResolveIntentRange,
            Request::Noop => Method::Noop,
            Request::TruncateLog { .. } => Method::TruncateLog,
            Request::LeaderLease { .. } => Method::LeaderLease,
        }
    }

    pub fn header(&self) -> &RequestHeader {
        match self {
            Request::Get { header }
            | Request::Put { header, .. }
            | Request::ConditionalPut { header, .. }
            | Request::Increment { header, .. }
            | Request::Delete { header }
            | Request::DeleteRange { header, .. }
            | Request::Scan { header, .. }
            | Request::ReverseScan { header, .. }
            | Request::EndTransaction { header, .. }
            | Request::AdminSplit { header, .. }
            | Request::AdminMerge { header, .. }
            | Request::HeartbeatTxn { header, .. }
            | Request::Gc { header, .. }
            | Request::PushTxn { header, .. }
            | Request::ResolveIntent { header, .. }
            | Request::ResolveIntentRange { header, .. }
            | Request::TruncateLog { header, .. }
            | Request::LeaderLease { header, .. } => header,
            Request::Noop => &EMPTY_HEADER,
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            Request::Get { .. } => IS_READ | IS_TXN,
            Request::Put { .. } => IS_WRITE | IS_TXN | IS_TXN_WRITE,
            Request::ConditionalPut { .. } => IS_READ | IS_WRITE | IS_TXN | IS_TXN_WRITE,
            Request::Increment { .. } => IS_READ | IS_WRITE | IS_TXN | IS_TXN_WRITE,
            Request::Delete { .. } => IS_WRITE | IS_TXN | IS_TXN_WRITE,
            Request::DeleteRange { .. } => IS_WRITE | IS_RANGE | IS_TXN | IS_TXN_WRITE,
            Request::Scan { .. } => IS_READ | IS_RANGE | IS_TXN,
            Request::ReverseScan { .. } => IS_READ | IS_RANGE | IS_REVERSE | IS_TXN,
            Request::EndTransaction { .. } => IS_WRITE | IS_TXN | IS_ALONE,
            Request::AdminSplit { .. } => IS_ADMIN | IS_ALONE,
            Request::AdminMerge { .. } => IS_ADMIN | IS_ALONE,
            Request::HeartbeatTxn { .. } => IS_WRITE | IS_TXN,
            Request::Gc { .. } => IS_WRITE | IS_RANGE,
            Request::PushTxn { .. } => IS_WRITE,
            Request::ResolveIntent { .. } => IS_WRITE,
            Request::ResolveIntentRange { .. } => IS_WRITE | IS_RANGE,
            Request::Noop => 0,
            Request::TruncateLog { .. } => IS_WRITE,
            Request::LeaderLease { .. } => IS_WRITE | IS_ALONE,
        }
    }

    pub fn is_read_only(&self) -> bool {
        let flags = self.flags();
        flags & IS_READ != 0 && flags & IS_WRITE == 0
    }

    pub fn is_range(&self) -> bool {
        self.flags() & IS_RANGE != 0
    }

    pub fn is_transaction_write(&self) -> bool {
        self.flags() & IS_TXN_WRITE != 0
    }

    /// The empty response slot for this request.
    pub fn create_reply(&self) -> Response {
        match self {
            Request::Get { .. } => Response::Get { value: None },
            Request::Put { .. } => Response::Put,
            Request::ConditionalPut { .. } => Response::ConditionalPut,
            Request::Increment { .. } => Response::Increment { new_value: 0 },
            Request::Delete { .. } => Response::Delete,
            Request::DeleteRange { .. } => Response::DeleteRange { num_deleted: 0 },
            Request::Scan { .. } => Response::Scan { rows: Vec::new() },
            Request::ReverseScan { .. } => Response::ReverseScan { rows: Vec::new() },
            Request::EndTransaction { .. } => Response::EndTransaction { txn: None },
            Request::AdminSplit { .. } => Response::AdminSplit,
            Request::AdminMerge { .. } => Response::AdminMerge,
            Request::HeartbeatTxn { .. } => Response::HeartbeatTxn { txn: None },
            Request::Gc { .. } => Response::Gc,
            Request::PushTxn { .. } => Response::PushTxn { pushee: None },
            Request::ResolveIntent { .. } => Response::ResolveIntent,
            Request::ResolveIntentRange { .. } => Response::ResolveIntentRange,
            Request::Noop => Response::Noop,
            Request::TruncateLog { .. } => Response::TruncateLog,
            Request::LeaderLease { .. } => Response::LeaderLease,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    #[default]
    Consistent,
    Inconsistent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub timestamp: Timestamp,
    pub cmd_id: Option<ClientCmdId>,
    pub range_id: RangeId,
    pub replica: ReplicaDescriptor,
    pub user_priority: i32,
    pub txn: Option<Transaction>,
    pub read_consistency: ReadConsistency,
}

/// An ordered sequence of heterogeneous requests executed as a unit
/// against one range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn add(&mut self, req: Request) {
        self.requests.push(req);
    }

    pub fn flags(&self) -> u32 {
        self.requests.iter().fold(0, |acc, r| acc | r.flags())
    }

    pub fn is_write(&self) -> bool {
        self.flags() & IS_WRITE != 0
    }

    pub fn is_read_only(&self) -> bool {
        let flags = self.flags();
        flags & IS_READ != 0 && flags & IS_WRITE == 0
    }

    pub fn is_admin(&self) -> bool {
        self.flags() & IS_ADMIN != 0
    }

    pub fn is_reverse(&self) -> bool {
        self.flags() & IS_REVERSE != 0
    }

    pub fn is_range(&self) -> bool {
        self.flags() & IS_RANGE != 0
    }

    pub fn is_transaction_write(&self) -> bool {
        self.flags() & IS_TXN_WRITE != 0
    }

    pub fn is_consistent(&self) -> bool {
        self.header.read_consistency == ReadConsistency::Consistent
    }

    /// The request header's command ID, or a fresh one salted with the
    /// current wall time.
    pub fn get_or_create_cmd_id(&self, wall_time: i64) -> ClientCmdId {
        match self.header.cmd_id {
            Some(id) if !id.is_empty() => id,
            _ => ClientCmdId::random(wall_time),
        }
    }

    /// Key spans of transactional writes in this batch (future intents).
    pub fn intent_spans(&self) -> Vec<RequestHeader> {
        self.requests
            .iter()
            .filter(|r| r.is_transaction_write())
            .map(|r| r.header().clone())
            .collect()
    }

    /// Greedily group contiguous compatible requests, without changing
    /// order. Two requests are compatible iff neither is alone (after
    /// the first) and they agree on the write/admin/reverse flags.
    /// Reads are deliberately left out of the mask so reads and writes
    /// of one transaction share a sub-batch.
    pub fn split(&self) -> Vec<Vec<Request>> {
        const MASK: u32 = IS_WRITE | IS_ADMIN | IS_REVERSE;
        fn compatible(ex_flags: u32, new_flags: u32) -> bool {
            if ex_flags == 0 {
                return true;
            }
            if new_flags & IS_ALONE != 0 {
                return false;
            }
            (MASK & ex_flags) == (MASK & new_flags)
        }

        let mut parts: Vec<Vec<Request>> = Vec::new();
        let mut rest: &[Request] = &self.requests;
        while !rest.is_empty() {
            let mut group_flags = 0u32;
            let mut take = rest.len();
            for (i, req) in rest.iter().enumerate() {
                let flags = req.flags();
                if !compatible(group_flags, flags) {
                    take = i;
                    break;
                }
                group_flags |= flags;
            }
            parts.push(rest[..take].to_vec());
            rest = &rest[take..];
        }
        parts
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Value> },
    Put,
    ConditionalPut,
    Increment { new_value: i64 },
    Delete,
    DeleteRange { num_deleted: u64 },
    Scan { rows: Vec<KeyValue> },
    ReverseScan { rows: Vec<KeyValue> },
    EndTransaction { txn: Option<Transaction> },
    AdminSplit,
    AdminMerge,
    HeartbeatTxn { txn: Option<Transaction> },
    Gc,
    PushTxn { pushee: Option<Transaction> },
    ResolveIntent,
    ResolveIntentRange,
    Noop,
    TruncateLog,
    LeaderLease,
}

impl Response {
    /// Whether this response type supports slot-wise combination. The
    /// capability is fixed per type; `combine` on anything else only
    /// accepts an identical no-op slot.
    pub fn combines(&self) -> bool {
        matches!(
            self,
            Response::Scan { .. } | Response::ReverseScan { .. } | Response::DeleteRange { .. }
        )
    }

    /// Merge `other` into this slot.
    pub fn combine(&mut self, other: Response) -> Result<()> {
        match (self, other) {
            (Response::Scan { rows }, Response::Scan { rows: other_rows }) => {
                rows.extend(other_rows);
                Ok(())
            }
            (Response::ReverseScan { rows }, Response::ReverseScan { rows: other_rows }) => {
                rows.extend(other_rows);
                Ok(())
            }
            (
                Response::DeleteRange { num_deleted },
                Response::DeleteRange {
                    num_deleted: other_deleted,
                },
            ) => {
                *num_deleted += other_deleted;
                Ok(())
            }
            (slot, other) => {
                if let Response::Noop = slot {
                    *slot = other;
                    return Ok(());
                }
                Err(Error::internal("response slots are not combinable"))
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponseHeader {
    pub timestamp: Timestamp,
    pub txn: Option<Transaction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub header: BatchResponseHeader,
    pub responses: Vec<Response>,
}

impl BatchResponse {
    pub fn add(&mut self, resp: Response) {
        self.responses.push(resp);
    }

    /// Combine each slot of `other` into the corresponding slot here.
    /// The slot counts must match. The timestamp is forwarded and the
    /// transaction merged field-wise.
    pub fn combine(&mut self, other: BatchResponse) -> Result<()> {
        if other.responses.len() != self.responses.len() {
            return Err(Error::internal(
                "unable to combine batch responses of different length",
            ));
        }
        for (slot, other_slot) in self.responses.iter_mut().zip(other.responses) {
            if slot.combines() || matches!(slot, Response::Noop) {
                slot.combine(other_slot)?;
            }
        }
        self.header.timestamp.forward(other.header.timestamp);
        match (&mut self.header.txn, other.header.txn) {
            (Some(mine), Some(theirs)) => mine.update(&theirs),
            (mine @ None, Some(theirs)) => *mine = Some(theirs),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(key: &[u8]) -> Request {
        Request::Get {
            header: RequestHeader::point(key),
        }
    }

    fn put(key: &[u8], val: &[u8]) -> Request {
        Request::Put {
            header: RequestHeader::point(key),
            value: Value::from_bytes(val.to_vec()),
        }
    }

    fn cput(key: &[u8], val: &[u8]) -> Request {
        Request::ConditionalPut {
            header: RequestHeader::point(key),
            value: Value::from_bytes(val.to_vec()),
            expected: None,
        }
    }

    fn admin_split(key: &[u8]) -> Request {
        Request::AdminSplit {
            header: RequestHeader::point(key),
            split_key: key.to_vec(),
            split_trigger: None,
        }
    }

    fn methods(parts: &[Vec<Request>]) -> Vec<Vec<Method>> {
        parts
            .iter()
            .map(|p| p.iter().map(|r| r.method()).collect())
            .collect()
    }

    #[test]
    fn reads_and_writes_share_a_sub_batch() {
        // isRead is excluded from the compatibility mask, so a Get rides
        // with a Put and ConditionalPut stays next to Put.
        let mut ba = BatchRequest::default();
        ba.add(get(b"k"));
        ba.add(put(b"k", b"v"));
        ba.add(cput(b"k", b"w"));
        let parts = ba.split();
        assert_eq!(
            methods(&parts),
            vec![vec![Method::Get, Method::Put, Method::ConditionalPut]]
        );
    }

    #[test]
    fn alone_requests_split_off() {
        let mut ba = BatchRequest::default();
        ba.add(admin_split(b"s"));
        ba.add(put(b"k", b"v"));
        let parts = ba.split();
        assert_eq!(
            methods(&parts),
            vec![vec![Method::AdminSplit], vec![Method::Put]]
        );
    }

    #[test]
    fn reverse_and_forward_ranges_do_not_mix() {
        let mut ba = BatchRequest::default();
        ba.add(Request::Scan {
            header: RequestHeader::span(b"a", b"b"),
            max_results: 0,
        });
        ba.add(Request::ReverseScan {
            header: RequestHeader::span(b"a", b"b"),
            max_results: 0,
        });
        let parts = ba.split();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn split_is_stable_and_order_preserving() {
        let mut ba = BatchRequest::default();
        ba.add(get(b"a"));
        ba.add(put(b"b", b"1"));
        ba.add(admin_split(b"c"));
        ba.add(get(b"d"));
        let parts = ba.split();

        // Concatenating the parts reproduces the input order.
        let flattened: Vec<Request> = parts.iter().flatten().cloned().collect();
        assert_eq!(flattened, ba.requests);

        // Re-running the rule on each part is idempotent.
        for part in parts {
            let nested = BatchRequest {
                header: BatchHeader::default(),
                requests: part.clone(),
            };
            assert_eq!(nested.split(), vec![part]);
        }
    }

    #[test]
    fn batch_flags_aggregate() {
        let mut ba = BatchRequest::default();
        ba.add(get(b"a"));
        assert!(ba.is_read_only());
        ba.add(put(b"b", b"1"));
        assert!(ba.is_write());
        assert!(!ba.is_read_only());
        assert!(!ba.is_admin());
    }

    #[test]
    fn scan_responses_concatenate_on_combine() {
        let row = |k: &[u8]| KeyValue {
            key: k.to_vec(),
            value: Value::from_bytes(b"v".to_vec()),
        };
        let mut left = BatchResponse::default();
        left.add(Response::Scan {
            rows: vec![row(b"a")],
        });
        left.header.timestamp = Timestamp::new(5, 0);

        let mut right = BatchResponse::default();
        right.add(Response::Scan {
            rows: vec![row(b"b")],
        });
        right.header.timestamp = Timestamp::new(3, 0);

        left.combine(right).expect("combine");
        match &left.responses[0] {
            Response::Scan { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].key, b"a");
                assert_eq!(rows[1].key, b"b");
            }
            other => panic!("unexpected slot {other:?}"),
        }
        // Timestamp is forwarded, not replaced.
        assert_eq!(left.header.timestamp, Timestamp::new(5, 0));
    }

    #[test]
    fn noop_slots_adopt_the_other_side() {
        let mut left = BatchResponse::default();
        left.add(Response::Noop);
        let mut right = BatchResponse::default();
        right.add(Response::Increment { new_value: 9 });
        left.combine(right).expect("combine");
        assert_eq!(left.responses[0], Response::Increment { new_value: 9 });
    }

    #[test]
    fn mismatched_lengths_refuse_to_combine() {
        let mut left = BatchResponse::default();
        left.add(Response::Noop);
        let right = BatchResponse::default();
        assert!(left.combine(right).is_err());
    }
}
