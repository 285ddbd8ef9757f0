//! Transaction records, intents, and push arithmetic.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::data::NodeId;

/// Transaction identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub [u8; 16]);

impl TxnId {
    pub fn random() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill(&mut buf);
        Self(buf)
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    Snapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    #[default]
    Pending,
    Committed,
    Aborted,
}

impl TxnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

/// A transaction record. Terminal statuses never revert and the epoch
/// only increments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    /// Anchor key; the transaction record lives on the range containing
    /// this key.
    pub key: Vec<u8>,
    pub epoch: u32,
    pub priority: i32,
    pub isolation: IsolationLevel,
    pub status: TxnStatus,
    pub timestamp: Timestamp,
    pub orig_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub last_heartbeat: Timestamp,
    pub certain_nodes: Vec<NodeId>,
    pub writing: bool,
}

impl Transaction {
    pub fn new(
        key: &[u8],
        user_priority: i32,
        isolation: IsolationLevel,
        now: Timestamp,
        max_offset_nanos: i64,
    ) -> Self {
        Self {
            id: TxnId::random(),
            key: key.to_vec(),
            epoch: 0,
            priority: make_priority(user_priority),
            isolation,
            status: TxnStatus::Pending,
            timestamp: now,
            orig_timestamp: now,
            max_timestamp: now.add(max_offset_nanos, 0),
            last_heartbeat: now,
            certain_nodes: Vec::new(),
            writing: false,
        }
    }

    /// Field-wise merge of a newer copy of the same transaction,
    /// preserving the record invariants.
    pub fn update(&mut self, other: &Transaction) {
        if other.id != self.id {
            return;
        }
        if !self.status.is_terminal() {
            self.status = other.status;
        }
        if other.epoch > self.epoch {
            self.epoch = other.epoch;
        }
        self.timestamp.forward(other.timestamp);
        self.orig_timestamp.forward(other.orig_timestamp);
        self.max_timestamp.forward(other.max_timestamp);
        self.last_heartbeat.forward(other.last_heartbeat);
        if other.priority > self.priority {
            self.priority = other.priority;
        }
        for node in &other.certain_nodes {
            if !self.certain_nodes.contains(node) {
                self.certain_nodes.push(*node);
            }
        }
        self.writing = self.writing || other.writing;
    }

    /// Whether the transaction considers reads at `node_id` free of
    /// uncertainty restarts.
    pub fn is_certain(&self, node_id: NodeId) -> bool {
        self.certain_nodes.contains(&node_id)
    }
}

/// Map a user priority to a random transaction priority. Negative user
/// priorities pin the exact value (used by internal transactions); the
/// randomization otherwise keeps equal-priority pushers from starving
/// each other.
pub fn make_priority(user_priority: i32) -> i32 {
    if user_priority < 0 {
        return -user_priority;
    }
    let up = if user_priority == 0 { 1 } else { user_priority };
    rand::thread_rng().gen_range(1..=up.saturating_mul(10))
}

/// An in-flight provisional write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub txn: Transaction,
}

/// What a push is trying to achieve: evict the writer entirely, or just
/// move its timestamp out of the reader's way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushTxnType {
    PushTimestamp,
    AbortTxn,
}

/// Time after which a transaction with no heartbeat counts as abandoned.
pub const TXN_ABANDON_NANOS: i64 = 5_000_000_000;

/// Decide whether the pusher beats the pushee. `now` must come from the
/// node's clock, not the request timestamp, so abandoned transactions
/// are eventually detected.
pub fn pusher_wins(pusher: &Transaction, pushee: &Transaction, now: Timestamp) -> bool {
    let last_active = if pushee.last_heartbeat.is_zero() {
        pushee.orig_timestamp
    } else {
        pushee.last_heartbeat
    };
    if now.wall_time > last_active.wall_time + TXN_ABANDON_NANOS {
        return true;
    }
    if pusher.priority != pushee.priority {
        return pusher.priority > pushee.priority;
    }
    // Equal priorities: the older transaction wins ties.
    pusher.orig_timestamp < pushee.orig_timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(priority: i32, orig: Timestamp) -> Transaction {
        let mut t = Transaction::new(b"k", -priority, IsolationLevel::Serializable, orig, 0);
        t.last_heartbeat = orig;
        t
    }

    #[test]
    fn terminal_status_never_reverts() {
        let mut t = txn(1, Timestamp::new(1, 0));
        let mut committed = t.clone();
        committed.status = TxnStatus::Committed;
        t.update(&committed);
        assert_eq!(t.status, TxnStatus::Committed);

        let mut pending = t.clone();
        pending.status = TxnStatus::Pending;
        t.update(&pending);
        assert_eq!(t.status, TxnStatus::Committed);
    }

    #[test]
    fn epoch_only_increments() {
        let mut t = txn(1, Timestamp::new(1, 0));
        t.epoch = 4;
        let mut old = t.clone();
        old.epoch = 2;
        t.update(&old);
        assert_eq!(t.epoch, 4);
    }

    #[test]
    fn negative_user_priority_is_exact() {
        assert_eq!(make_priority(-37), 37);
        let p = make_priority(5);
        assert!((1..=50).contains(&p));
    }

    #[test]
    fn higher_priority_pusher_wins() {
        let now = Timestamp::new(10, 0);
        let strong = txn(10, Timestamp::new(5, 0));
        let weak = txn(1, Timestamp::new(5, 0));
        assert!(pusher_wins(&strong, &weak, now));
        assert!(!pusher_wins(&weak, &strong, now));
    }

    #[test]
    fn abandoned_pushee_always_loses() {
        let weak = txn(1, Timestamp::new(0, 0));
        let mut strong = txn(10, Timestamp::new(0, 0));
        strong.last_heartbeat = Timestamp::new(1, 0);
        let long_after = Timestamp::new(TXN_ABANDON_NANOS * 2, 0);
        assert!(pusher_wins(&weak, &strong, long_after));
    }
}
