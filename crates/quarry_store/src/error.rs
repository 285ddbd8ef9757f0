//! The store's error taxonomy.
//!
//! Errors are serializable so the response cache can persist them next
//! to successful responses. The send path dispatches on variants:
//! `WriteTooOld` and resolved `WriteIntent`s retry locally, everything
//! else surfaces to the caller.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::data::{NodeId, RangeDescriptor, RangeId, ReplicaDescriptor};
use crate::txn::{Intent, Transaction};
use crate::value::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum Error {
    #[error("range {0} was not found")]
    RangeNotFound(RangeId),

    #[error("key range {start:?}-{end:?} outside of bounds of range")]
    RangeKeyMismatch {
        start: Vec<u8>,
        end: Vec<u8>,
        range: Option<RangeDescriptor>,
    },

    #[error("replica does not hold the range lease")]
    NotLeader { leader: Option<ReplicaDescriptor> },

    #[error("conflicting write intents on {} key(s)", .intents.len())]
    WriteIntent {
        intents: Vec<Intent>,
        /// Set once the conflicting transactions were pushed, telling
        /// the sender to retry without backoff.
        resolved: bool,
        index: Option<usize>,
    },

    #[error("write at {timestamp} too old; existing version at {existing}")]
    WriteTooOld {
        timestamp: Timestamp,
        existing: Timestamp,
    },

    #[error("read at {timestamp} uncertain about version at {existing}")]
    ReadWithinUncertaintyInterval {
        timestamp: Timestamp,
        existing: Timestamp,
        node_id: NodeId,
    },

    #[error("transaction must retry")]
    TransactionRetry { txn: Box<Transaction> },

    #[error("transaction aborted")]
    TransactionAborted { txn: Box<Transaction> },

    #[error("failed to push transaction")]
    TransactionPush {
        pushee: Box<Transaction>,
        index: Option<usize>,
    },

    #[error("unexpected value for conditional operation")]
    ConditionFailed {
        actual: Option<Value>,
        index: Option<usize>,
    },

    #[error("requested raft log entries unavailable")]
    LogUnavailable,

    #[error("raft group deleted")]
    GroupDeleted,

    #[error("replica too old; already garbage collected")]
    ReplicaTooOld,

    #[error("node is shutting down")]
    Stopped,

    #[error("store has not been bootstrapped")]
    NotBootstrapped,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range descriptor: {0}")]
    InvalidRangeDescriptor(String),

    #[error("invalid replica descriptor: {0}")]
    InvalidReplicaDescriptor(String),

    #[error("rejecting command with timestamp {timestamp} in the future ({offset_nanos}ns ahead)")]
    TimestampTooFar {
        timestamp: Timestamp,
        offset_nanos: i64,
    },

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Position of the offending request inside its batch, if recorded.
    pub fn error_index(&self) -> Option<usize> {
        match self {
            Error::WriteIntent { index, .. }
            | Error::TransactionPush { index, .. }
            | Error::ConditionFailed { index, .. } => *index,
            _ => None,
        }
    }

    /// Pin the error to a request position. The store uses this to keep
    /// indexes pointing at the original batch slot when errors are
    /// rewritten during conflict resolution.
    pub fn set_error_index(&mut self, new_index: usize) {
        match self {
            Error::WriteIntent { index, .. }
            | Error::TransactionPush { index, .. }
            | Error::ConditionFailed { index, .. } => *index = Some(new_index),
            _ => {}
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{err:#}"))
    }
}

impl From<quarry_raft::RaftError> for Error {
    fn from(err: quarry_raft::RaftError) -> Self {
        use quarry_raft::RaftError;
        match err {
            RaftError::Unavailable => Error::LogUnavailable,
            RaftError::GroupDeleted => Error::GroupDeleted,
            RaftError::Stopped => Error::Stopped,
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_index_is_preserved_on_rewrite() {
        let mut err = Error::WriteIntent {
            intents: Vec::new(),
            resolved: false,
            index: Some(3),
        };
        assert_eq!(err.error_index(), Some(3));
        err.set_error_index(0);
        assert_eq!(err.error_index(), Some(0));
        // Unindexed errors ignore the setter.
        let mut plain = Error::Stopped;
        plain.set_error_index(1);
        assert_eq!(plain.error_index(), None);
    }

    #[test]
    fn errors_roundtrip_through_serialization() {
        let err = Error::WriteTooOld {
            timestamp: Timestamp::new(1, 2),
            existing: Timestamp::new(3, 4),
        };
        let bytes = bincode::serialize(&err).expect("serialize");
        let back: Error = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(back, err);
    }
}
