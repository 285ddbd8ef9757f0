//! The per-range replica: raft storage on the write-ahead side, command
//! execution on the apply side, and lease-gated request serving.
//!
//! Mutations are serialized through the store's consensus loop, so
//! committed commands for one range apply strictly in log order and
//! never concurrently. In-memory fields sit behind a read-write lock;
//! the last and applied indexes are atomics so the raft storage reads
//! them lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use quarry_raft::{
    CommandId, ConfChangeKind, ConfState, Entry, GroupStorage, HardState, RaftError, Snapshot,
    SnapshotMetadata,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::batch::{
    BatchHeader, BatchRequest, BatchResponse, ChangeReplicasTrigger, ClientCmdId, MergeTrigger,
    ReplicaChangeType, Request, RequestHeader, Response, SplitTrigger,
};
use crate::clock::{Clock, Timestamp};
use crate::data::{
    Lease, RaftSnapshotData, RaftTruncatedState, RangeDescriptor, RangeId, ReplicaDescriptor,
    StoreIdent,
};
use crate::engine::{Batch, Engine, EngineReader};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc;
use crate::response_cache::ResponseCache;
use crate::store::Store;
use crate::txn::{pusher_wins, make_priority, PushTxnType, Transaction, TxnStatus};
use crate::value::Value;

/// Log position at which an initialized empty range starts. Leaving room
/// below the initial index lets raft distinguish a fresh range from one
/// that lost its log.
pub const RAFT_INITIAL_LOG_INDEX: u64 = 10;
/// Term paired with the initial log index.
pub const RAFT_INITIAL_LOG_TERM: u64 = 5;

/// How long a granted range lease lasts.
pub const DEFAULT_LEASE_DURATION_NANOS: i64 = 1_000_000_000;

/// The payload of every replicated command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RaftCommand {
    pub range_id: RangeId,
    pub origin_replica: ReplicaDescriptor,
    pub cmd: BatchRequest,
}

/// Narrow handle to store-level services; replicas never own the store.
#[derive(Clone)]
pub(crate) struct RangeContext {
    pub engine: Arc<dyn Engine>,
    pub clock: Arc<Clock>,
    pub ident: StoreIdent,
    pub multiraft: quarry_raft::MultiRaft,
    pub stopped: Arc<AtomicBool>,
}

struct ReplicaState {
    desc: Arc<RangeDescriptor>,
    lease: Option<Lease>,
    truncated: Option<RaftTruncatedState>,
    destroyed: bool,
}

/// Deferred effects of an applied command; they run after the engine
/// batch commits and may not fail.
enum PostCommit {
    Split(SplitTrigger),
    Merge(MergeTrigger),
    Truncate(RaftTruncatedState),
    Lease(Lease),
    UpdateDesc(RangeDescriptor),
}

#[derive(Default)]
struct ApplyContext {
    post_commit: Vec<PostCommit>,
}

pub struct Replica {
    range_id: RangeId,
    ctx: RangeContext,
    state: RwLock<ReplicaState>,
    last_index: AtomicU64,
    applied_index: AtomicU64,
    response_cache: ResponseCache,
    pending: Mutex<HashMap<CommandId, oneshot::Sender<Result<BatchResponse>>>>,
}

fn raft_cmd_id(id: ClientCmdId) -> CommandId {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&id.wall_time.to_be_bytes());
    buf[8..].copy_from_slice(&id.random.to_be_bytes());
    CommandId(buf)
}

// ---- persisted index records ----

fn load_applied_index<R: EngineReader + ?Sized>(
    eng: &R,
    range_id: RangeId,
    initialized: bool,
) -> anyhow::Result<u64> {
    match mvcc::mvcc_get_inline(eng, &keys::raft_applied_index_key(range_id))? {
        Some(v) => Ok(v.as_int()? as u64),
        None if initialized => Ok(RAFT_INITIAL_LOG_INDEX),
        None => Ok(0),
    }
}

fn set_applied_index(batch: &mut Batch<'_>, range_id: RangeId, index: u64) -> anyhow::Result<()> {
    mvcc::mvcc_put_inline(
        batch,
        &keys::raft_applied_index_key(range_id),
        Value::from_int(index as i64),
    )
}

fn set_last_index(batch: &mut Batch<'_>, range_id: RangeId, index: u64) -> anyhow::Result<()> {
    mvcc::mvcc_put_inline(
        batch,
        &keys::raft_last_index_key(range_id),
        Value::from_int(index as i64),
    )
}

fn load_truncated_state<R: EngineReader + ?Sized>(
    eng: &R,
    range_id: RangeId,
    initialized: bool,
) -> anyhow::Result<RaftTruncatedState> {
    match mvcc::mvcc_get_inline(eng, &keys::raft_truncated_state_key(range_id))? {
        Some(v) => Ok(bincode::deserialize(v.as_bytes())?),
        None if initialized => Ok(RaftTruncatedState {
            index: RAFT_INITIAL_LOG_INDEX,
            term: RAFT_INITIAL_LOG_TERM,
        }),
        None => Ok(RaftTruncatedState::default()),
    }
}

fn load_last_index<R: EngineReader + ?Sized>(
    eng: &R,
    range_id: RangeId,
    initialized: bool,
) -> anyhow::Result<u64> {
    match mvcc::mvcc_get_inline(eng, &keys::raft_last_index_key(range_id))? {
        Some(v) => Ok(v.as_int()? as u64),
        // An empty log: either a fresh range or one truncated away
        // entirely; the truncated state covers both.
        None => Ok(load_truncated_state(eng, range_id, initialized)?.index),
    }
}

fn load_lease<R: EngineReader + ?Sized>(
    eng: &R,
    range_id: RangeId,
) -> anyhow::Result<Option<Lease>> {
    match mvcc::mvcc_get_inline(eng, &keys::range_lease_key(range_id))? {
        Some(v) => Ok(Some(bincode::deserialize(v.as_bytes())?)),
        None => Ok(None),
    }
}

/// The engine spans holding a range's data: range-ID-local keys,
/// range-key-local keys, and the user span, all in encoded form.
fn replica_data_spans(desc: &RangeDescriptor) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut spans = Vec::with_capacity(3);
    let (id_lo, id_hi) = keys::range_id_span(desc.range_id);
    spans.push((
        mvcc::mvcc_encode_meta_key(&id_lo),
        mvcc::mvcc_encode_meta_key(&id_hi),
    ));
    if !desc.end_key.is_empty() {
        let (k_lo, k_hi) = keys::range_key_local_span(&desc.start_key, &desc.end_key);
        spans.push((
            mvcc::mvcc_encode_meta_key(&k_lo),
            mvcc::mvcc_encode_meta_key(&k_hi),
        ));
        spans.push((
            mvcc::mvcc_encode_meta_key(&desc.start_key),
            mvcc::mvcc_encode_meta_key(&desc.end_key),
        ));
    }
    spans
}

impl Replica {
    pub(crate) fn new(desc: RangeDescriptor, ctx: RangeContext) -> anyhow::Result<Self> {
        let initialized = !desc.end_key.is_empty();
        if initialized {
            desc.validate()?;
        }
        let range_id = desc.range_id;
        let last_index = load_last_index(&*ctx.engine, range_id, initialized)?;
        let applied_index = load_applied_index(&*ctx.engine, range_id, initialized)?;
        let lease = load_lease(&*ctx.engine, range_id)?;
        Ok(Self {
            range_id,
            ctx,
            state: RwLock::new(ReplicaState {
                desc: Arc::new(desc),
                lease,
                truncated: None,
                destroyed: false,
            }),
            last_index: AtomicU64::new(last_index),
            applied_index: AtomicU64::new(applied_index),
            response_cache: ResponseCache::new(range_id),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn desc(&self) -> Arc<RangeDescriptor> {
        self.state.read().expect("replica state lock").desc.clone()
    }

    pub(crate) fn set_desc(&self, desc: RangeDescriptor) {
        let mut state = self.state.write().expect("replica state lock");
        state.desc = Arc::new(desc);
    }

    pub fn lease(&self) -> Option<Lease> {
        self.state.read().expect("replica state lock").lease
    }

    pub fn is_initialized(&self) -> bool {
        !self.desc().end_key.is_empty()
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    pub(crate) fn replica_descriptor(&self, replica_id: u64) -> Result<ReplicaDescriptor> {
        self.desc()
            .replica(replica_id)
            .ok_or_else(|| Error::InvalidReplicaDescriptor(format!(
                "replica {replica_id} not in range {}",
                self.range_id
            )))
    }

    fn own_replica(&self) -> Result<ReplicaDescriptor> {
        self.desc()
            .replica_for_store(self.ctx.ident.store_id)
            .ok_or(Error::RangeNotFound(self.range_id))
    }

    pub(crate) fn truncated_state(&self) -> anyhow::Result<RaftTruncatedState> {
        if let Some(ts) = self.state.read().expect("replica state lock").truncated {
            return Ok(ts);
        }
        let ts = load_truncated_state(&*self.ctx.engine, self.range_id, self.is_initialized())?;
        if ts.index != 0 {
            self.state.write().expect("replica state lock").truncated = Some(ts);
        }
        Ok(ts)
    }

    /// Refuse new commands and fail the waiting ones; called before the
    /// replica is removed from the store.
    pub(crate) fn quiesce(&self) {
        self.state.write().expect("replica state lock").destroyed = true;
        let mut pending = self.pending.lock().expect("pending lock");
        for (_, ch) in pending.drain() {
            let _ = ch.send(Err(Error::RangeNotFound(self.range_id)));
        }
    }

    fn check_destroyed(&self) -> Result<()> {
        if self.state.read().expect("replica state lock").destroyed {
            return Err(Error::RangeNotFound(self.range_id));
        }
        Ok(())
    }

    // ---- request serving ----

    /// Entry point for a routed batch. Reads execute locally under the
    /// lease; writes are proposed to the consensus group; admin commands
    /// orchestrate their own proposals.
    pub(crate) async fn send(&self, store: &Arc<Store>, ba: BatchRequest) -> Result<BatchResponse> {
        self.check_destroyed()?;
        if self.ctx.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if ba.is_admin() {
            if ba.requests.len() != 1 {
                return Err(Error::internal("admin command must be alone in its batch"));
            }
            return self.execute_admin(store, ba).await;
        }
        self.check_batch_keys(&ba)?;
        if ba.is_read_only() {
            if ba.is_consistent() {
                self.redirect_or_acquire_lease(ba.header.timestamp).await?;
            }
            return self.execute_read_only(&ba);
        }
        self.redirect_or_acquire_lease(ba.header.timestamp).await?;
        self.add_write_cmd(ba).await
    }

    /// Every request span must fall inside this range.
    fn check_batch_keys(&self, ba: &BatchRequest) -> Result<()> {
        let desc = self.desc();
        for req in &ba.requests {
            if matches!(req, Request::Noop) {
                continue;
            }
            let header = req.header();
            let start = keys::addr(&header.key).map_err(|e| Error::InvalidKey(e.to_string()))?;
            let end = if header.end_key.is_empty() {
                Vec::new()
            } else {
                keys::addr(&header.end_key).map_err(|e| Error::InvalidKey(e.to_string()))?
            };
            if !desc.contains_key_range(&start, &end) {
                return Err(Error::RangeKeyMismatch {
                    start: header.key.clone(),
                    end: header.end_key.clone(),
                    range: Some((*desc).clone()),
                });
            }
        }
        Ok(())
    }

    /// Verify the lease covers `ts`, acquiring one for this replica when
    /// nobody holds it.
    async fn redirect_or_acquire_lease(&self, ts: Timestamp) -> Result<()> {
        if let Some(lease) = self.lease() {
            if lease.covers(ts) {
                if lease.owned_by(self.ctx.ident.store_id) {
                    return Ok(());
                }
                return Err(Error::NotLeader {
                    leader: Some(lease.replica),
                });
            }
        }

        let now = self.ctx.clock.now();
        let replica = self.own_replica()?;
        let mut start = ts;
        if now < start {
            start = now;
        }
        let lease_req = Request::LeaderLease {
            header: RequestHeader::point(&self.desc().start_key),
            lease: Lease {
                replica,
                start,
                expiration: now.add(DEFAULT_LEASE_DURATION_NANOS, 0),
                proposed_ts: now,
            },
        };
        let mut ba = BatchRequest {
            header: BatchHeader {
                timestamp: now,
                range_id: self.range_id,
                ..Default::default()
            },
            requests: vec![lease_req],
        };
        ba.header.cmd_id = Some(ClientCmdId::random(now.wall_time));
        match self.add_write_cmd(ba).await {
            Ok(_) => {}
            Err(Error::NotLeader { leader }) => return Err(Error::NotLeader { leader }),
            Err(err) => return Err(err),
        }

        match self.lease() {
            Some(lease) if lease.covers(ts) && lease.owned_by(self.ctx.ident.store_id) => Ok(()),
            Some(lease) => Err(Error::NotLeader {
                leader: Some(lease.replica),
            }),
            None => Err(Error::NotLeader { leader: None }),
        }
    }

    fn execute_read_only(&self, ba: &BatchRequest) -> Result<BatchResponse> {
        let engine = self.ctx.engine.clone();
        // Reads never mutate; the batch only provides the read-through
        // view and is dropped unused.
        let mut scratch = Batch::new(&*engine);
        let mut ctx = ApplyContext::default();
        let mut br = BatchResponse {
            header: crate::batch::BatchResponseHeader {
                timestamp: ba.header.timestamp,
                txn: ba.header.txn.clone(),
            },
            responses: Vec::with_capacity(ba.requests.len()),
        };
        for (index, req) in ba.requests.iter().enumerate() {
            match self.execute_request(&mut scratch, req, &ba.header, &mut ctx) {
                Ok(resp) => br.add(resp),
                Err(mut err) => {
                    err.set_error_index(index);
                    return Err(err);
                }
            }
        }
        Ok(br)
    }

    /// Dedup against the response cache, then propose and wait for apply.
    async fn add_write_cmd(&self, mut ba: BatchRequest) -> Result<BatchResponse> {
        let cmd_id = ba.get_or_create_cmd_id(self.ctx.clock.physical_now());
        ba.header.cmd_id = Some(cmd_id);
        if let Some(cached) = self
            .response_cache
            .lookup(&*self.ctx.engine, cmd_id)
            .map_err(Error::from)?
        {
            debug!(range = self.range_id, "response cache hit");
            return cached;
        }
        self.propose_and_wait(ba).await
    }

    async fn propose_and_wait(&self, ba: BatchRequest) -> Result<BatchResponse> {
        let cmd_id = ba.header.cmd_id.ok_or_else(|| Error::internal("proposal without command id"))?;
        let id = raft_cmd_id(cmd_id);
        let origin = self.own_replica()?;
        let cmd = RaftCommand {
            range_id: self.range_id,
            origin_replica: origin,
            cmd: ba,
        };
        let data = bincode::serialize(&cmd).map_err(|e| Error::internal(e))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        // Membership changes ride a dedicated proposal path because the
        // consensus layer must understand them.
        let change = change_replicas_of(&cmd.cmd);
        self.ctx
            .multiraft
            .create_group(self.range_id, 0)
            .await
            .map_err(Error::from)?;
        let committed = match change {
            Some(trigger) => {
                if cmd.cmd.requests.len() != 1 {
                    self.pending.lock().expect("pending lock").remove(&id);
                    return Err(Error::internal(
                        "change-replicas command must be alone in its batch",
                    ));
                }
                let kind = match trigger.change_type {
                    ReplicaChangeType::AddReplica => ConfChangeKind::AddReplica,
                    ReplicaChangeType::RemoveReplica => ConfChangeKind::RemoveReplica,
                };
                let replica = quarry_raft::ReplicaDesc {
                    node_id: trigger.replica.node_id,
                    store_id: trigger.replica.store_id,
                    replica_id: trigger.replica.replica_id,
                };
                self.ctx
                    .multiraft
                    .change_group_membership(self.range_id, id, kind, replica, data)
            }
            None => self.ctx.multiraft.submit_command(self.range_id, id, data),
        };

        match committed.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.pending.lock().expect("pending lock").remove(&id);
                return Err(Error::from(err));
            }
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                return Err(Error::Stopped);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::RangeNotFound(self.range_id)),
        }
    }

    fn complete_pending(&self, id: CommandId, result: &Result<BatchResponse>) {
        if let Some(ch) = self.pending.lock().expect("pending lock").remove(&id) {
            let _ = ch.send(result.clone());
        }
    }

    // ---- admin operations ----

    async fn execute_admin(&self, store: &Arc<Store>, ba: BatchRequest) -> Result<BatchResponse> {
        let req = ba.requests.first().cloned().ok_or_else(|| Error::internal("empty admin batch"))?;
        let resp = match req {
            Request::AdminSplit { split_key, .. } => self.admin_split(store, &ba.header, split_key).await?,
            Request::AdminMerge { .. } => self.admin_merge(store, &ba.header).await?,
            other => {
                return Err(Error::internal(format!(
                    "not an admin command: {:?}",
                    other.method()
                )))
            }
        };
        let mut br = BatchResponse::default();
        br.header.timestamp = ba.header.timestamp;
        br.add(resp);
        Ok(br)
    }

    /// Shorten this range at `split_key` and create a new range for the
    /// other half; both descriptors and the addressing records are
    /// written by a single replicated command.
    async fn admin_split(
        &self,
        store: &Arc<Store>,
        h: &BatchHeader,
        split_key: Vec<u8>,
    ) -> Result<Response> {
        let desc = self.desc();
        let split_key = if split_key.is_empty() {
            mvcc::mvcc_find_split_key(&*self.ctx.engine, &desc.start_key, &desc.end_key)
                .map_err(Error::from)?
                .ok_or_else(|| Error::internal("cannot find a split key for the range"))?
        } else {
            split_key
        };
        if split_key <= desc.start_key || split_key >= desc.end_key {
            return Err(Error::InvalidKey(format!(
                "split key {split_key:?} outside of range bounds"
            )));
        }
        if keys::is_local(&split_key) {
            return Err(Error::InvalidKey("split key may not be range-local".to_string()));
        }

        let new_range_id = store.allocate_range_id()?;
        let mut updated = (*desc).clone();
        updated.end_key = split_key.clone();
        let new_desc = RangeDescriptor {
            range_id: new_range_id,
            start_key: split_key.clone(),
            end_key: desc.end_key.clone(),
            replicas: desc.replicas.clone(),
            next_replica_id: desc.next_replica_id,
        };
        info!(
            range = self.range_id,
            new_range = new_range_id,
            "initiating split"
        );

        let mut ba = BatchRequest {
            header: BatchHeader {
                timestamp: if h.timestamp.is_zero() {
                    self.ctx.clock.now()
                } else {
                    h.timestamp
                },
                range_id: self.range_id,
                ..Default::default()
            },
            requests: vec![Request::AdminSplit {
                header: RequestHeader::point(&desc.start_key),
                split_key,
                split_trigger: Some(SplitTrigger {
                    updated_desc: updated,
                    new_desc,
                }),
            }],
        };
        ba.header.cmd_id = Some(ClientCmdId::random(self.ctx.clock.physical_now()));
        self.propose_and_wait(ba).await?;
        Ok(Response::AdminSplit)
    }

    /// Absorb the collocated range that starts at this range's end key.
    async fn admin_merge(&self, store: &Arc<Store>, h: &BatchHeader) -> Result<Response> {
        let desc = self.desc();
        if desc.end_key.as_slice() >= keys::KEY_MAX {
            return Err(Error::internal("cannot merge final range"));
        }
        let subsumed = store
            .lookup_replica(&desc.end_key, &[])
            .ok_or_else(|| Error::internal("subsumed range not found on store"))?;
        let subsumed_desc = subsumed.desc();
        if !desc.replicas_collocated_with(&subsumed_desc) {
            return Err(Error::internal(
                "ranges not collocated; cannot merge",
            ));
        }

        let mut updated = (*desc).clone();
        updated.end_key = subsumed_desc.end_key.clone();
        info!(
            range = self.range_id,
            subsumed = subsumed_desc.range_id,
            "initiating merge"
        );

        let mut ba = BatchRequest {
            header: BatchHeader {
                timestamp: if h.timestamp.is_zero() {
                    self.ctx.clock.now()
                } else {
                    h.timestamp
                },
                range_id: self.range_id,
                ..Default::default()
            },
            requests: vec![Request::AdminMerge {
                header: RequestHeader::point(&desc.start_key),
                merge_trigger: Some(MergeTrigger {
                    updated_desc: updated,
                    subsumed_desc: (*subsumed_desc).clone(),
                }),
            }],
        };
        ba.header.cmd_id = Some(ClientCmdId::random(self.ctx.clock.physical_now()));
        self.propose_and_wait(ba).await?;
        Ok(Response::AdminMerge)
    }

    // ---- command application ----

    /// Apply a committed command. Runs on the store's consensus loop,
    /// strictly in log-index order per range.
    pub(crate) async fn apply_raft_command(
        &self,
        store: &Arc<Store>,
        index: u64,
        id: CommandId,
        cmd: RaftCommand,
    ) -> Result<()> {
        if index == 0 {
            return Err(Error::internal("raft command without an index"));
        }
        if self.applied_index.load(Ordering::SeqCst) >= index {
            // Re-delivery of an already applied command; the first
            // application answered the waiter.
            debug!(range = self.range_id, index, "skipping re-applied command");
            return Ok(());
        }

        let has_change_replicas = change_replicas_of(&cmd.cmd).is_some();
        if has_change_replicas && cmd.cmd.requests.len() != 1 {
            // The consensus layer applied a membership change that was
            // hidden inside a larger batch; replicas would diverge.
            panic!("change-replicas command must be the only request in its batch");
        }

        let engine = self.ctx.engine.clone();

        // A command re-proposed across a leadership change can commit
        // twice under two log positions. The response cache makes the
        // second application a no-op.
        if let Some(cmd_id) = cmd.cmd.header.cmd_id {
            if let Some(cached) = self
                .response_cache
                .lookup(&*engine, cmd_id)
                .map_err(Error::from)?
            {
                debug!(range = self.range_id, index, "skipping replayed command");
                let mut batch = Batch::new(&*engine);
                set_applied_index(&mut batch, self.range_id, index).map_err(Error::from)?;
                if let Err(err) = batch.commit() {
                    panic!("committing applied index failed: {err:#}");
                }
                self.applied_index.store(index, Ordering::SeqCst);
                self.complete_pending(id, &cached);
                return Ok(());
            }
        }

        let mut ctx = ApplyContext::default();
        let mut batch = Batch::new(&*engine);
        let result = self.execute_write_batch(&mut batch, &cmd.cmd, &mut ctx);

        let mut result = match result {
            Ok(br) => Ok(br),
            Err(err) => {
                // Failed commands still consume their log position: drop
                // the half-built batch and persist only the metadata.
                drop(batch);
                ctx = ApplyContext::default();
                batch = Batch::new(&*engine);
                Err(err)
            }
        };

        if let Some(cmd_id) = cmd.cmd.header.cmd_id {
            // Retryable outcomes are not cached: the client will retry
            // the same command ID and must re-execute, not replay the
            // transient error.
            let cacheable = match &result {
                Ok(_) => true,
                Err(err) => !matches!(
                    err,
                    Error::WriteTooOld { .. }
                        | Error::WriteIntent { .. }
                        | Error::ReadWithinUncertaintyInterval { .. }
                        | Error::TransactionRetry { .. }
                        | Error::TransactionPush { .. }
                        | Error::NotLeader { .. }
                        | Error::RangeNotFound(_)
                        | Error::RangeKeyMismatch { .. }
                ),
            };
            if cacheable {
                self.response_cache
                    .put_response(&mut batch, cmd_id, cmd.cmd.header.timestamp, &result)
                    .map_err(Error::from)?;
            }
        }
        set_applied_index(&mut batch, self.range_id, index).map_err(Error::from)?;
        if let Err(err) = batch.commit() {
            // A half-applied batch cannot be repaired locally.
            panic!("committing applied command failed: {err:#}");
        }
        self.applied_index.store(index, Ordering::SeqCst);

        // Post-commit housekeeping; failures here must not fail the
        // command.
        for action in ctx.post_commit {
            match action {
                PostCommit::Split(trigger) => {
                    if let Err(err) = store.split_range(self, &trigger) {
                        warn!(range = self.range_id, error = %err, "split bookkeeping failed");
                    }
                }
                PostCommit::Merge(trigger) => {
                    if let Err(err) = store.merge_range(self, &trigger).await {
                        warn!(range = self.range_id, error = %err, "merge bookkeeping failed");
                    }
                }
                PostCommit::Truncate(truncated) => {
                    self.state.write().expect("replica state lock").truncated = Some(truncated);
                }
                PostCommit::Lease(lease) => {
                    self.state.write().expect("replica state lock").lease = Some(lease);
                }
                PostCommit::UpdateDesc(desc) => {
                    store.update_replica_descriptor(self, desc);
                }
            }
        }

        self.complete_pending(id, &result);
        match &mut result {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        }
    }

    /// Execute a mutating batch: split into compatible sub-batches and
    /// run them in order against one engine batch.
    fn execute_write_batch(
        &self,
        batch: &mut Batch<'_>,
        ba: &BatchRequest,
        ctx: &mut ApplyContext,
    ) -> Result<BatchResponse> {
        let mut br = BatchResponse {
            header: crate::batch::BatchResponseHeader {
                timestamp: ba.header.timestamp,
                txn: ba.header.txn.clone(),
            },
            responses: Vec::with_capacity(ba.requests.len()),
        };
        let mut index = 0usize;
        for part in ba.split() {
            for req in &part {
                match self.execute_request(batch, req, &ba.header, ctx) {
                    Ok(resp) => br.add(resp),
                    Err(mut err) => {
                        err.set_error_index(index);
                        return Err(err);
                    }
                }
                index += 1;
            }
        }
        Ok(br)
    }

    fn execute_request(
        &self,
        batch: &mut Batch<'_>,
        req: &Request,
        h: &BatchHeader,
        ctx: &mut ApplyContext,
    ) -> Result<Response> {
        let ts = h.timestamp;
        let txn = h.txn.as_ref();
        let consistent = h.read_consistency == crate::batch::ReadConsistency::Consistent;
        match req {
            Request::Get { header } => {
                let (value, _) = mvcc::mvcc_get(batch, &header.key, ts, consistent, txn)?;
                Ok(Response::Get { value })
            }
            Request::Put { header, value } => {
                mvcc::mvcc_put(batch, &header.key, ts, value.clone(), txn)?;
                Ok(Response::Put)
            }
            Request::ConditionalPut {
                header,
                value,
                expected,
            } => {
                mvcc::mvcc_conditional_put(
                    batch,
                    &header.key,
                    ts,
                    value.clone(),
                    expected.as_ref(),
                    txn,
                )?;
                Ok(Response::ConditionalPut)
            }
            Request::Increment { header, increment } => {
                let new_value = mvcc::mvcc_increment(batch, &header.key, ts, txn, *increment)?;
                Ok(Response::Increment { new_value })
            }
            Request::Delete { header } => {
                mvcc::mvcc_delete(batch, &header.key, ts, txn)?;
                Ok(Response::Delete)
            }
            Request::DeleteRange {
                header,
                max_entries,
            } => {
                let deleted = mvcc::mvcc_delete_range(
                    batch,
                    &header.key,
                    &header.end_key,
                    ts,
                    *max_entries,
                    txn,
                )?;
                Ok(Response::DeleteRange {
                    num_deleted: deleted.len() as u64,
                })
            }
            Request::Scan {
                header,
                max_results,
            } => {
                let (rows, _) = mvcc::mvcc_scan(
                    batch,
                    &header.key,
                    &header.end_key,
                    ts,
                    *max_results,
                    consistent,
                    txn,
                    false,
                )?;
                Ok(Response::Scan { rows })
            }
            Request::ReverseScan {
                header,
                max_results,
            } => {
                let (rows, _) = mvcc::mvcc_scan(
                    batch,
                    &header.key,
                    &header.end_key,
                    ts,
                    *max_results,
                    consistent,
                    txn,
                    true,
                )?;
                Ok(Response::ReverseScan { rows })
            }
            Request::EndTransaction {
                commit,
                intents,
                split_trigger,
                merge_trigger,
                change_replicas_trigger,
                ..
            } => self.execute_end_transaction(
                batch,
                h,
                *commit,
                intents,
                split_trigger.as_ref(),
                merge_trigger.as_ref(),
                change_replicas_trigger.as_ref(),
                ctx,
            ),
            Request::AdminSplit { split_trigger, .. } => {
                let trigger = split_trigger
                    .as_ref()
                    .ok_or_else(|| Error::internal("split command without a trigger"))?;
                self.execute_split_trigger(batch, h, trigger, ctx)?;
                Ok(Response::AdminSplit)
            }
            Request::AdminMerge { merge_trigger, .. } => {
                let trigger = merge_trigger
                    .as_ref()
                    .ok_or_else(|| Error::internal("merge command without a trigger"))?;
                self.execute_merge_trigger(batch, h, trigger, ctx)?;
                Ok(Response::AdminMerge)
            }
            Request::HeartbeatTxn { now, .. } => {
                let req_txn = txn.ok_or_else(|| Error::internal("heartbeat without transaction"))?;
                let key = keys::transaction_key(&req_txn.key, req_txn.id);
                let mut record = match mvcc::mvcc_get_inline(batch, &key).map_err(Error::from)? {
                    Some(v) => bincode::deserialize::<Transaction>(v.as_bytes())
                        .map_err(|e| Error::internal(e))?,
                    None => req_txn.clone(),
                };
                if !record.status.is_terminal() {
                    record.last_heartbeat.forward(*now);
                    mvcc::mvcc_put_inline(
                        batch,
                        &key,
                        Value::from_bytes(
                            bincode::serialize(&record).map_err(|e| Error::internal(e))?,
                        ),
                    )
                    .map_err(Error::from)?;
                }
                Ok(Response::HeartbeatTxn { txn: Some(record) })
            }
            Request::Gc {
                response_cache_expiration,
                txn_expiration,
                ..
            } => {
                self.execute_gc(batch, *response_cache_expiration, *txn_expiration)?;
                Ok(Response::Gc)
            }
            Request::PushTxn {
                pusher,
                pushee,
                push_to,
                now,
                push_type,
                ..
            } => self.execute_push_txn(batch, pusher.as_ref(), pushee, *push_to, *now, *push_type, h),
            Request::ResolveIntent { header, intent_txn } => {
                mvcc::mvcc_resolve_intent(batch, &header.key, intent_txn)?;
                Ok(Response::ResolveIntent)
            }
            Request::ResolveIntentRange { header, intent_txn } => {
                mvcc::mvcc_resolve_intent_range(batch, &header.key, &header.end_key, intent_txn)?;
                Ok(Response::ResolveIntentRange)
            }
            Request::Noop => Ok(Response::Noop),
            Request::TruncateLog { index, .. } => self.execute_truncate_log(batch, *index, ctx),
            Request::LeaderLease { lease, .. } => self.execute_leader_lease(batch, h, *lease, ctx),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_end_transaction(
        &self,
        batch: &mut Batch<'_>,
        h: &BatchHeader,
        commit: bool,
        intents: &[RequestHeader],
        split_trigger: Option<&SplitTrigger>,
        merge_trigger: Option<&MergeTrigger>,
        change_replicas_trigger: Option<&ChangeReplicasTrigger>,
        ctx: &mut ApplyContext,
    ) -> Result<Response> {
        let req_txn = h
            .txn
            .as_ref()
            .ok_or_else(|| Error::internal("EndTransaction outside a transaction"))?;
        let key = keys::transaction_key(&req_txn.key, req_txn.id);
        let mut record = match mvcc::mvcc_get_inline(batch, &key).map_err(Error::from)? {
            Some(v) => bincode::deserialize::<Transaction>(v.as_bytes())
                .map_err(|e| Error::internal(e))?,
            None => req_txn.clone(),
        };

        match record.status {
            TxnStatus::Committed => {
                return Err(Error::internal("transaction already committed"));
            }
            TxnStatus::Aborted => {
                return Err(Error::TransactionAborted {
                    txn: Box::new(record),
                });
            }
            TxnStatus::Pending => {}
        }
        if req_txn.epoch < record.epoch {
            return Err(Error::internal("transaction epoch regression"));
        }

        record.update(req_txn);
        if commit {
            // A serializable transaction whose timestamp was pushed
            // cannot commit at the new timestamp without re-reading.
            if record.isolation == crate::txn::IsolationLevel::Serializable
                && record.timestamp != record.orig_timestamp
            {
                return Err(Error::TransactionRetry {
                    txn: Box::new(record),
                });
            }
            record.status = TxnStatus::Committed;
        } else {
            record.status = TxnStatus::Aborted;
        }
        mvcc::mvcc_put_inline(
            batch,
            &key,
            Value::from_bytes(bincode::serialize(&record).map_err(|e| Error::internal(e))?),
        )
        .map_err(Error::from)?;

        // Resolve intents that live on this range; others are the
        // client's (or the GC queue's) problem.
        let desc = self.desc();
        for span in intents {
            let start = keys::addr(&span.key).map_err(|e| Error::InvalidKey(e.to_string()))?;
            if span.end_key.is_empty() {
                if desc.contains_key(&start) {
                    mvcc::mvcc_resolve_intent(batch, &span.key, &record)?;
                }
            } else {
                let end = keys::addr(&span.end_key).map_err(|e| Error::InvalidKey(e.to_string()))?;
                if desc.contains_key_range(&start, &end) {
                    mvcc::mvcc_resolve_intent_range(batch, &span.key, &span.end_key, &record)?;
                }
            }
        }

        if record.status == TxnStatus::Committed {
            if let Some(trigger) = split_trigger {
                self.execute_split_trigger(batch, h, trigger, ctx)?;
            }
            if let Some(trigger) = merge_trigger {
                self.execute_merge_trigger(batch, h, trigger, ctx)?;
            }
            if let Some(trigger) = change_replicas_trigger {
                self.execute_change_replicas_trigger(batch, h, trigger, ctx)?;
            }
        }

        Ok(Response::EndTransaction { txn: Some(record) })
    }

    fn execute_split_trigger(
        &self,
        batch: &mut Batch<'_>,
        h: &BatchHeader,
        trigger: &SplitTrigger,
        ctx: &mut ApplyContext,
    ) -> Result<()> {
        let ts = h.timestamp;
        let txn = h.txn.as_ref();
        let updated = &trigger.updated_desc;
        let new_desc = &trigger.new_desc;
        if updated.end_key != new_desc.start_key {
            return Err(Error::InvalidRangeDescriptor(
                "split halves do not meet at the split key".to_string(),
            ));
        }

        let updated_bytes = bincode::serialize(updated).map_err(|e| Error::internal(e))?;
        let new_bytes = bincode::serialize(new_desc).map_err(|e| Error::internal(e))?;
        mvcc::mvcc_put(
            batch,
            &keys::range_descriptor_key(&updated.start_key),
            ts,
            Value::from_bytes(updated_bytes.clone()),
            txn,
        )?;
        mvcc::mvcc_put(
            batch,
            &keys::range_descriptor_key(&new_desc.start_key),
            ts,
            Value::from_bytes(new_bytes.clone()),
            txn,
        )?;
        // Addressing records for both halves.
        mvcc::mvcc_put(
            batch,
            &keys::range_meta_key(&updated.end_key),
            ts,
            Value::from_bytes(updated_bytes),
            txn,
        )?;
        mvcc::mvcc_put(
            batch,
            &keys::range_meta_key(&new_desc.end_key),
            ts,
            Value::from_bytes(new_bytes),
            txn,
        )?;
        // The new range must answer retried commands the old one already
        // executed.
        self.response_cache
            .copy_into(&*self.ctx.engine, batch, new_desc.range_id)
            .map_err(Error::from)?;

        ctx.post_commit.push(PostCommit::Split(trigger.clone()));
        Ok(())
    }

    fn execute_merge_trigger(
        &self,
        batch: &mut Batch<'_>,
        h: &BatchHeader,
        trigger: &MergeTrigger,
        ctx: &mut ApplyContext,
    ) -> Result<()> {
        let ts = h.timestamp;
        let txn = h.txn.as_ref();
        let updated = &trigger.updated_desc;
        let subsumed = &trigger.subsumed_desc;
        if updated.end_key != subsumed.end_key {
            return Err(Error::InvalidRangeDescriptor(
                "merged descriptor must extend to the subsumed range's end".to_string(),
            ));
        }

        let updated_bytes = bincode::serialize(updated).map_err(|e| Error::internal(e))?;
        mvcc::mvcc_put(
            batch,
            &keys::range_descriptor_key(&updated.start_key),
            ts,
            Value::from_bytes(updated_bytes.clone()),
            txn,
        )?;
        mvcc::mvcc_delete(
            batch,
            &keys::range_descriptor_key(&subsumed.start_key),
            ts,
            txn,
        )?;
        mvcc::mvcc_put(
            batch,
            &keys::range_meta_key(&updated.end_key),
            ts,
            Value::from_bytes(updated_bytes),
            txn,
        )?;
        // The old boundary record points at the vanished range.
        mvcc::mvcc_delete(
            batch,
            &keys::range_meta_key(&subsumed.start_key),
            ts,
            txn,
        )?;

        ctx.post_commit.push(PostCommit::Merge(trigger.clone()));
        Ok(())
    }

    fn execute_change_replicas_trigger(
        &self,
        batch: &mut Batch<'_>,
        h: &BatchHeader,
        trigger: &ChangeReplicasTrigger,
        ctx: &mut ApplyContext,
    ) -> Result<()> {
        let desc = self.desc();
        let mut updated = (*desc).clone();
        updated.replicas = trigger.updated_replicas.clone();
        updated.next_replica_id = trigger.next_replica_id;
        let bytes = bincode::serialize(&updated).map_err(|e| Error::internal(e))?;
        mvcc::mvcc_put(
            batch,
            &keys::range_descriptor_key(&updated.start_key),
            h.timestamp,
            Value::from_bytes(bytes),
            h.txn.as_ref(),
        )?;
        ctx.post_commit.push(PostCommit::UpdateDesc(updated));
        Ok(())
    }

    fn execute_gc(
        &self,
        batch: &mut Batch<'_>,
        response_cache_expiration: Timestamp,
        txn_expiration: Timestamp,
    ) -> Result<()> {
        let engine = self.ctx.engine.clone();
        self.response_cache
            .gc(&*engine, batch, response_cache_expiration)
            .map_err(Error::from)?;

        // Abandoned or finished transaction records in this range.
        let desc = self.desc();
        if desc.end_key.is_empty() {
            return Ok(());
        }
        let (lo, hi) = keys::range_key_local_span(&desc.start_key, &desc.end_key);
        let enc_lo = mvcc::mvcc_encode_meta_key(&lo);
        let enc_hi = mvcc::mvcc_encode_meta_key(&hi);
        let mut victims: Vec<Vec<u8>> = Vec::new();
        engine
            .iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
                let (ukey, ts) = mvcc::mvcc_decode_key(k)?;
                if !ts.is_zero() || !keys::is_transaction_key(&ukey) {
                    return Ok(false);
                }
                let meta: mvcc::MvccMetadata = bincode::deserialize(v)?;
                let Some(value) = meta.inline_value else {
                    return Ok(false);
                };
                let record: Transaction = bincode::deserialize(value.as_bytes())?;
                let last_active = if record.last_heartbeat.is_zero() {
                    record.orig_timestamp
                } else {
                    record.last_heartbeat
                };
                if record.status.is_terminal() || last_active < txn_expiration {
                    victims.push(ukey);
                }
                Ok(false)
            })
            .map_err(Error::from)?;
        for key in victims {
            mvcc::mvcc_delete_inline(batch, &key);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_push_txn(
        &self,
        batch: &mut Batch<'_>,
        pusher: Option<&Transaction>,
        pushee: &Transaction,
        push_to: Timestamp,
        now: Timestamp,
        push_type: PushTxnType,
        h: &BatchHeader,
    ) -> Result<Response> {
        let key = keys::transaction_key(&pushee.key, pushee.id);
        let mut record = match mvcc::mvcc_get_inline(batch, &key).map_err(Error::from)? {
            Some(v) => bincode::deserialize::<Transaction>(v.as_bytes())
                .map_err(|e| Error::internal(e))?,
            None => pushee.clone(),
        };

        if record.status.is_terminal() {
            // Already settled; the push trivially succeeds.
            return Ok(Response::PushTxn {
                pushee: Some(record),
            });
        }

        let synthesized;
        let pusher = match pusher {
            Some(p) => p,
            None => {
                // No pushing transaction: synthesize one carrying only
                // the user priority.
                synthesized = Transaction {
                    priority: make_priority(h.user_priority),
                    ..Default::default()
                };
                &synthesized
            }
        };

        if !pusher_wins(pusher, &record, now) {
            return Err(Error::TransactionPush {
                pushee: Box::new(record),
                index: None,
            });
        }

        match push_type {
            PushTxnType::AbortTxn => {
                record.status = TxnStatus::Aborted;
            }
            PushTxnType::PushTimestamp => {
                record.timestamp.forward(push_to.next());
            }
        }
        mvcc::mvcc_put_inline(
            batch,
            &key,
            Value::from_bytes(bincode::serialize(&record).map_err(|e| Error::internal(e))?),
        )
        .map_err(Error::from)?;
        Ok(Response::PushTxn {
            pushee: Some(record),
        })
    }

    fn execute_truncate_log(
        &self,
        batch: &mut Batch<'_>,
        index: u64,
        ctx: &mut ApplyContext,
    ) -> Result<Response> {
        let current = self.truncated_state().map_err(Error::from)?;
        if index <= current.index + 1 {
            return Ok(Response::TruncateLog);
        }
        let term = self
            .term(index - 1)
            .map_err(Error::from)?;
        for i in current.index + 1..index {
            mvcc::mvcc_delete_inline(batch, &keys::raft_log_key(self.range_id, i));
        }
        let truncated = RaftTruncatedState {
            index: index - 1,
            term,
        };
        mvcc::mvcc_put_inline(
            batch,
            &keys::raft_truncated_state_key(self.range_id),
            Value::from_bytes(bincode::serialize(&truncated).map_err(|e| Error::internal(e))?),
        )
        .map_err(Error::from)?;
        ctx.post_commit.push(PostCommit::Truncate(truncated));
        Ok(Response::TruncateLog)
    }

    fn execute_leader_lease(
        &self,
        batch: &mut Batch<'_>,
        h: &BatchHeader,
        lease: Lease,
        ctx: &mut ApplyContext,
    ) -> Result<Response> {
        if let Some(prev) = self.lease() {
            let effective_now = h.timestamp;
            if prev.covers(effective_now) && prev.replica.store_id != lease.replica.store_id {
                // Someone else holds an active lease; redirect.
                return Err(Error::NotLeader {
                    leader: Some(prev.replica),
                });
            }
        }
        mvcc::mvcc_put_inline(
            batch,
            &keys::range_lease_key(self.range_id),
            Value::from_bytes(bincode::serialize(&lease).map_err(|e| Error::internal(e))?),
        )
        .map_err(Error::from)?;
        ctx.post_commit.push(PostCommit::Lease(lease));
        Ok(Response::LeaderLease)
    }
}

fn change_replicas_of(ba: &BatchRequest) -> Option<ChangeReplicasTrigger> {
    for req in &ba.requests {
        if let Request::EndTransaction {
            change_replicas_trigger: Some(trigger),
            ..
        } = req
        {
            return Some(trigger.clone());
        }
    }
    None
}

// ---- raft storage contract ----

fn storage_err(err: anyhow::Error) -> RaftError {
    RaftError::Storage(err)
}

impl GroupStorage for Replica {
    fn initial_state(&self) -> std::result::Result<(HardState, ConfState), RaftError> {
        let desc = self.desc();
        let found =
            mvcc::mvcc_get_inline(&*self.ctx.engine, &keys::raft_hard_state_key(self.range_id))
                .map_err(storage_err)?;
        let hs = match &found {
            Some(v) => bincode::deserialize::<HardState>(v.as_bytes())
                .map_err(|e| storage_err(e.into()))?,
            None if self.is_initialized() => {
                self.last_index
                    .store(RAFT_INITIAL_LOG_INDEX, Ordering::SeqCst);
                HardState {
                    term: RAFT_INITIAL_LOG_TERM,
                    vote: 0,
                    commit: RAFT_INITIAL_LOG_INDEX,
                }
            }
            None => {
                // A replica waiting for a snapshot starts from zero.
                self.last_index.store(0, Ordering::SeqCst);
                HardState::default()
            }
        };

        let mut cs = ConfState::default();
        // Membership is unknown for uninitialized ranges.
        if found.is_some() || self.is_initialized() {
            cs.voters = desc.replicas.iter().map(|r| r.replica_id).collect();
        }
        Ok((hs, cs))
    }

    fn entries(
        &self,
        lo: u64,
        hi: u64,
        max_bytes: u64,
    ) -> std::result::Result<Vec<Entry>, RaftError> {
        let lo_key = mvcc::mvcc_encode_meta_key(&keys::raft_log_key(self.range_id, lo));
        let hi_key = mvcc::mvcc_encode_meta_key(&keys::raft_log_key(self.range_id, hi));
        let mut ents: Vec<Entry> = Vec::new();
        let mut size = 0u64;
        self.ctx
            .engine
            .iterate(&lo_key, &hi_key, false, &mut |_, v| {
                let meta: mvcc::MvccMetadata = bincode::deserialize(v)?;
                let Some(value) = meta.inline_value else {
                    anyhow::bail!("raft log record without payload");
                };
                let ent: Entry = bincode::deserialize(value.as_bytes())?;
                size += ent.encoded_len();
                ents.push(ent);
                Ok(max_bytes > 0 && size > max_bytes)
            })
            .map_err(storage_err)?;

        // Unless a size limit cut the scan short, a count mismatch means
        // part of the requested range was compacted or never written.
        if ents.len() as u64 != hi - lo && (max_bytes == 0 || size < max_bytes) {
            return Err(RaftError::Unavailable);
        }
        Ok(ents)
    }

    fn term(&self, i: u64) -> std::result::Result<u64, RaftError> {
        match self.entries(i, i + 1, 0) {
            Ok(ents) => Ok(ents.first().map(|e| e.term).unwrap_or(0)),
            Err(RaftError::Unavailable) => {
                let ts = self.truncated_state().map_err(storage_err)?;
                if i == ts.index {
                    Ok(ts.term)
                } else {
                    Err(RaftError::Unavailable)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn first_index(&self) -> std::result::Result<u64, RaftError> {
        Ok(self.truncated_state().map_err(storage_err)?.index + 1)
    }

    fn last_index(&self) -> std::result::Result<u64, RaftError> {
        Ok(self.last_index.load(Ordering::SeqCst))
    }

    fn snapshot(&self) -> std::result::Result<Snapshot, RaftError> {
        // Copy everything out of a consistent engine snapshot.
        let snap = self.ctx.engine.new_snapshot().map_err(storage_err)?;
        let start_key = self.desc().start_key.clone();

        let applied = load_applied_index(&*snap, self.range_id, self.is_initialized())
            .map_err(storage_err)?;

        // Read the descriptor ignoring intents: an in-flight descriptor
        // change resolves its own intents when it commits.
        let (desc_value, _) = mvcc::mvcc_get(
            &*snap,
            &keys::range_descriptor_key(&start_key),
            self.ctx.clock.now(),
            false,
            None,
        )
        .map_err(|e| storage_err(anyhow::anyhow!("{e}")))?;
        let desc: RangeDescriptor = match desc_value {
            Some(v) => bincode::deserialize(v.as_bytes()).map_err(|e| storage_err(e.into()))?,
            None => {
                return Err(storage_err(anyhow::anyhow!(
                    "could not find range descriptor for snapshot"
                )))
            }
        };

        let mut data = RaftSnapshotData {
            range_descriptor: desc.clone(),
            kv: Vec::new(),
        };
        for (lo, hi) in replica_data_spans(&desc) {
            snap.iterate(&lo, &hi, false, &mut |k, v| {
                data.kv.push((k.to_vec(), v.to_vec()));
                Ok(false)
            })
            .map_err(storage_err)?;
        }

        let term = self.term(applied)?;
        let payload = bincode::serialize(&data).map_err(|e| storage_err(e.into()))?;
        Ok(Snapshot {
            data: payload,
            metadata: SnapshotMetadata {
                index: applied,
                term,
                conf_state: ConfState {
                    voters: desc.replicas.iter().map(|r| r.replica_id).collect(),
                },
            },
        })
    }

    fn append(&self, entries: &[Entry]) -> std::result::Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        let engine = self.ctx.engine.clone();
        let mut batch = Batch::new(&*engine);
        for ent in entries {
            let payload = bincode::serialize(ent).map_err(|e| storage_err(e.into()))?;
            mvcc::mvcc_put_inline(
                &mut batch,
                &keys::raft_log_key(self.range_id, ent.index),
                Value::from_bytes(payload),
            )
            .map_err(storage_err)?;
        }
        let last = entries[entries.len() - 1].index;
        let prev_last = self.last_index.load(Ordering::SeqCst);
        // Clear any divergent tail that never committed.
        for i in last + 1..=prev_last {
            mvcc::mvcc_delete_inline(&mut batch, &keys::raft_log_key(self.range_id, i));
        }
        set_last_index(&mut batch, self.range_id, last).map_err(storage_err)?;
        batch.commit().map_err(storage_err)?;
        self.last_index.store(last, Ordering::SeqCst);
        Ok(())
    }

    fn apply_snapshot(&self, snap: &Snapshot) -> std::result::Result<(), RaftError> {
        let data: RaftSnapshotData =
            bincode::deserialize(&snap.data).map_err(|e| storage_err(e.into()))?;
        let desc = data.range_descriptor.clone();
        let engine = self.ctx.engine.clone();

        // The hard state may record a vote that must survive the
        // snapshot; keep the raw record byte for byte.
        let hard_state_key =
            mvcc::mvcc_encode_meta_key(&keys::raft_hard_state_key(self.range_id));
        let preserved = engine.get(&hard_state_key).map_err(storage_err)?;

        let mut batch = Batch::new(&*engine);
        // Replace everything in the range with the snapshot contents.
        for (lo, hi) in replica_data_spans(&desc) {
            let mut victims: Vec<Vec<u8>> = Vec::new();
            engine
                .iterate(&lo, &hi, false, &mut |k, _| {
                    victims.push(k.to_vec());
                    Ok(false)
                })
                .map_err(storage_err)?;
            for key in victims {
                batch.delete(&key);
            }
        }
        for (k, v) in &data.kv {
            batch.put(k, v);
        }
        match preserved {
            Some(bytes) => batch.put(&hard_state_key, &bytes),
            None => batch.delete(&hard_state_key),
        }
        // Last and applied index coincide after a snapshot; entries the
        // leader sent past the snapshot index will be re-requested.
        set_last_index(&mut batch, self.range_id, snap.metadata.index).map_err(storage_err)?;
        batch.commit().map_err(storage_err)?;

        self.last_index.store(snap.metadata.index, Ordering::SeqCst);
        self.applied_index
            .store(snap.metadata.index, Ordering::SeqCst);

        let lease = load_lease(&*engine, self.range_id).map_err(storage_err)?;
        {
            let mut state = self.state.write().expect("replica state lock");
            state.desc = Arc::new(desc);
            state.lease = lease;
            state.truncated = None;
        }
        Ok(())
    }

    fn set_hard_state(&self, hs: &HardState) -> std::result::Result<(), RaftError> {
        let engine = self.ctx.engine.clone();
        let mut batch = Batch::new(&*engine);
        let payload = bincode::serialize(hs).map_err(|e| storage_err(e.into()))?;
        mvcc::mvcc_put_inline(
            &mut batch,
            &keys::raft_hard_state_key(self.range_id),
            Value::from_bytes(payload),
        )
        .map_err(storage_err)?;
        batch.commit().map_err(storage_err)?;
        Ok(())
    }
}
