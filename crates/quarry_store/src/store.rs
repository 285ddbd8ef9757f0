//! The store: owns every replica on one device, routes batches, runs the
//! consensus event loop, and resolves write-intent conflicts.
//!
//! Replicas are indexed twice: by range ID and by end key. A range is
//! initialized iff it appears in the end-key index. Everything that
//! mutates replica membership or applies commands runs on the single
//! consensus event task; client-facing `send` runs on caller tasks and
//! may block on conflict resolution.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use quarry_raft::{
    CommandId, Event, GroupStorage, MultiRaft, MultiRaftConfig, RaftError, RaftMessageRequest,
    Snapshot, StorageProvider, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::batch::{
    BatchHeader, BatchRequest, BatchResponse, MergeTrigger, Request, RequestHeader, Response,
    SplitTrigger,
};
use crate::clock::Clock;
use crate::data::{
    verify_keys, RaftSnapshotData, RaftTombstone, RangeDescriptor, RangeId, ReplicaDescriptor,
    StoreIdent,
};
use crate::engine::{Batch, Engine};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc;
use crate::replica::{RaftCommand, RangeContext, Replica};
use crate::txn::{make_priority, Intent, PushTxnType, Transaction, TxnStatus, TXN_ABANDON_NANOS};
use crate::value::Value;

/// Expiration for response cache entries.
pub const GC_RESPONSE_CACHE_EXPIRATION: Duration = Duration::from_secs(60 * 60);

const DEFAULT_RAFT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_HEARTBEAT_INTERVAL_TICKS: usize = 3;
const DEFAULT_RAFT_ELECTION_TIMEOUT_TICKS: usize = 15;
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_RANGE_MAX_BYTES: u64 = 64 << 20;
const DEFAULT_RAFT_LOG_TRUNCATION_THRESHOLD: u64 = 10_000;

/// Backoff schedule for retrying range commands after recoverable
/// errors. Zero max retries means unbounded.
#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    pub max_retries: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
            max_retries: 0,
        }
    }
}

/// Everything needed to construct a store. All durations and tick counts
/// get defaults suitable for a local network; the clock and transport
/// are required.
pub struct StoreConfig {
    pub clock: Arc<Clock>,
    pub transport: Arc<dyn Transport>,
    pub range_retry_options: RetryOptions,
    pub raft_tick_interval: Duration,
    pub raft_heartbeat_interval_ticks: usize,
    pub raft_election_timeout_ticks: usize,
    pub scan_interval: Duration,
    pub scan_max_idle_time: Duration,
    pub gc_response_cache_expiration: Duration,
    pub range_max_bytes: u64,
    pub raft_log_truncation_threshold: u64,
}

impl StoreConfig {
    pub fn new(clock: Arc<Clock>, transport: Arc<dyn Transport>) -> Self {
        Self {
            clock,
            transport,
            range_retry_options: RetryOptions::default(),
            raft_tick_interval: DEFAULT_RAFT_TICK_INTERVAL,
            raft_heartbeat_interval_ticks: DEFAULT_HEARTBEAT_INTERVAL_TICKS,
            raft_election_timeout_ticks: DEFAULT_RAFT_ELECTION_TIMEOUT_TICKS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            scan_max_idle_time: Duration::ZERO,
            gc_response_cache_expiration: GC_RESPONSE_CACHE_EXPIRATION,
            range_max_bytes: DEFAULT_RANGE_MAX_BYTES,
            raft_log_truncation_threshold: DEFAULT_RAFT_LOG_TRUNCATION_THRESHOLD,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.raft_tick_interval.is_zero(),
            "raft tick interval must be positive"
        );
        anyhow::ensure!(
            self.raft_heartbeat_interval_ticks > 0,
            "heartbeat interval ticks must be positive"
        );
        anyhow::ensure!(
            self.raft_election_timeout_ticks > self.raft_heartbeat_interval_ticks,
            "election timeout must exceed the heartbeat interval"
        );
        anyhow::ensure!(
            !self.scan_interval.is_zero(),
            "scan interval must be positive"
        );
        Ok(())
    }
}

struct ReplicaMaps {
    by_id: HashMap<RangeId, Arc<Replica>>,
    /// Initialized replicas keyed by their end key.
    by_key: BTreeMap<Vec<u8>, Arc<Replica>>,
    uninit: HashMap<RangeId, Arc<Replica>>,
}

enum StoreOp {
    RemoveReplica {
        replica: Arc<Replica>,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub struct Store {
    cfg: StoreConfig,
    engine: Arc<dyn Engine>,
    ident: RwLock<Option<StoreIdent>>,
    multiraft: OnceLock<MultiRaft>,
    replicas: RwLock<ReplicaMaps>,
    ops: OnceLock<mpsc::UnboundedSender<StoreOp>>,
    range_id_lock: Mutex<()>,
    stopped: Arc<AtomicBool>,
    started: AtomicBool,
}

impl Store {
    pub fn new(cfg: StoreConfig, engine: Arc<dyn Engine>) -> anyhow::Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            engine,
            ident: RwLock::new(None),
            multiraft: OnceLock::new(),
            replicas: RwLock::new(ReplicaMaps {
                by_id: HashMap::new(),
                by_key: BTreeMap::new(),
                uninit: HashMap::new(),
            }),
            ops: OnceLock::new(),
            range_id_lock: Mutex::new(()),
            stopped: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    pub fn clock(&self) -> Arc<Clock> {
        self.cfg.clock.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn ident(&self) -> Result<StoreIdent> {
        self.ident
            .read()
            .expect("ident lock")
            .clone()
            .ok_or(Error::NotBootstrapped)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn multiraft(&self) -> Result<&MultiRaft> {
        self.multiraft.get().ok_or(Error::Stopped)
    }

    // ---- bootstrap ----

    /// Write a new store ident. Only legal on a completely empty engine,
    /// or one whose existing ident already matches the cluster.
    pub fn bootstrap(&self, ident: StoreIdent) -> Result<()> {
        if self.is_started() {
            return Err(Error::internal("store already started"));
        }
        let existing = self
            .engine
            .scan(&[], &[0xff, 0xff, 0xff, 0xff, 0xff], 1)
            .map_err(Error::from)?;
        if !existing.is_empty() {
            match mvcc::mvcc_get_inline(&*self.engine, &keys::store_ident_key())
                .map_err(Error::from)?
            {
                Some(v) => {
                    let found: StoreIdent = bincode::deserialize(v.as_bytes())
                        .map_err(|e| Error::internal(e))?;
                    if found.cluster_id == ident.cluster_id {
                        *self.ident.write().expect("ident lock") = Some(found);
                        return Ok(());
                    }
                    return Err(Error::internal(format!(
                        "store already belongs to cluster {}",
                        found.cluster_id
                    )));
                }
                None => {
                    return Err(Error::internal(format!(
                        "engine is non-empty with no store ident (first key {:?})",
                        existing[0].0
                    )));
                }
            }
        }
        let mut batch = Batch::new(&*self.engine);
        let payload = bincode::serialize(&ident).map_err(|e| Error::internal(e))?;
        mvcc::mvcc_put_inline(&mut batch, &keys::store_ident_key(), Value::from_bytes(payload))
            .map_err(Error::from)?;
        batch.commit().map_err(Error::from)?;
        *self.ident.write().expect("ident lock") = Some(ident);
        Ok(())
    }

    /// Create range 1 spanning the whole key space, with addressing
    /// records for meta1 and meta2 and any initial values.
    pub fn bootstrap_range(&self, initial_values: Vec<(Vec<u8>, Value)>) -> Result<()> {
        let ident = self.ident()?;
        let desc = RangeDescriptor {
            range_id: 1,
            start_key: keys::KEY_MIN.to_vec(),
            end_key: keys::KEY_MAX.to_vec(),
            next_replica_id: 2,
            replicas: vec![ReplicaDescriptor {
                node_id: ident.node_id,
                store_id: ident.store_id,
                replica_id: 1,
            }],
        };
        desc.validate().map_err(|e| Error::InvalidRangeDescriptor(e.to_string()))?;

        let now = self.cfg.clock.now();
        let desc_bytes = bincode::serialize(&desc).map_err(|e| Error::internal(e))?;
        let mut batch = Batch::new(&*self.engine);
        mvcc::mvcc_put(
            &mut batch,
            &keys::range_descriptor_key(&desc.start_key),
            now,
            Value::from_bytes(desc_bytes.clone()),
            None,
        )?;
        // Addressing: meta2 record for the range, meta1 for the meta2 span.
        let meta2_key = keys::range_meta_key(&desc.end_key);
        mvcc::mvcc_put(
            &mut batch,
            &meta2_key,
            now,
            Value::from_bytes(desc_bytes.clone()),
            None,
        )?;
        let meta1_key = keys::range_meta_key(&meta2_key);
        mvcc::mvcc_put(&mut batch, &meta1_key, now, Value::from_bytes(desc_bytes), None)?;

        for (key, mut value) in initial_values {
            value.init_checksum(&key);
            mvcc::mvcc_put(&mut batch, &key, now, value, None)?;
        }
        batch.commit().map_err(Error::from)?;
        Ok(())
    }

    // ---- startup ----

    /// Read the ident, start the consensus runtime, scan descriptors,
    /// and spawn the event and scanner tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let ident = match mvcc::mvcc_get_inline(&*self.engine, &keys::store_ident_key())
            .map_err(Error::from)?
        {
            Some(v) => bincode::deserialize::<StoreIdent>(v.as_bytes())
                .map_err(|e| Error::internal(e))?,
            None => return Err(Error::NotBootstrapped),
        };
        *self.ident.write().expect("ident lock") = Some(ident.clone());

        let (mr, events, _task) = MultiRaft::start(
            MultiRaftConfig {
                node_id: ident.node_id,
                store_id: ident.store_id,
                tick_interval: self.cfg.raft_tick_interval,
                election_timeout_ticks: self.cfg.raft_election_timeout_ticks,
                heartbeat_interval_ticks: self.cfg.raft_heartbeat_interval_ticks,
            },
            Arc::new(StoreRaftProvider(Arc::downgrade(self))),
            self.cfg.transport.clone(),
        )
        .map_err(Error::from)?;
        self.multiraft
            .set(mr)
            .map_err(|_| Error::internal("store started twice"))?;

        // Load every initialized replica from its persisted descriptor,
        // ignoring uncommitted descriptor intents: a split that crashed
        // half-way resolves them on its next attempt.
        let (lo, hi) = keys::range_key_local_span(keys::KEY_MIN, keys::KEY_MAX);
        let mut descriptors: Vec<RangeDescriptor> = Vec::new();
        let now = self.cfg.clock.now();
        mvcc::mvcc_iterate(
            &*self.engine,
            &lo,
            &hi,
            now,
            false,
            None,
            false,
            &mut |kv| {
                let suffix_is_descriptor = keys::addr(&kv.key)
                    .map(|anchor| kv.key == keys::range_descriptor_key(&anchor))
                    .unwrap_or(false);
                if suffix_is_descriptor {
                    let desc: RangeDescriptor = bincode::deserialize(kv.value.as_bytes())
                        .map_err(|e| Error::internal(e))?;
                    descriptors.push(desc);
                }
                Ok(false)
            },
        )?;
        for desc in descriptors {
            let replica = Arc::new(
                Replica::new(desc, self.range_context()?).map_err(Error::from)?,
            );
            self.add_replica_internal(replica)?;
        }

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        self.ops
            .set(ops_tx)
            .map_err(|_| Error::internal("store started twice"))?;
        tokio::spawn(run_raft_events(self.clone(), events, ops_rx));
        tokio::spawn(crate::scanner::run_scanner(self.clone()));

        self.update_gc_hints();
        self.started.store(true, Ordering::SeqCst);
        info!(
            node = ident.node_id,
            store = ident.store_id,
            replicas = self.replica_count(),
            "store started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(mr) = self.multiraft.get() {
            mr.stop();
        }
    }

    pub(crate) fn update_gc_hints(&self) {
        let min_rcache = self.cfg.clock.now().wall_time
            - self.cfg.gc_response_cache_expiration.as_nanos() as i64;
        // Transaction record GC keys off the abandonment horizon.
        let min_txn = self.cfg.clock.now().wall_time - TXN_ABANDON_NANOS;
        self.engine.set_gc_timeouts(min_txn, min_rcache);
    }

    /// Enqueue an inbound raft wire message.
    pub fn enqueue_raft_message(&self, req: RaftMessageRequest) -> Result<()> {
        self.multiraft()?
            .handle_raft_message(req)
            .map_err(Error::from)
    }

    /// Current raft status of a range's consensus group, if it is
    /// running.
    pub async fn raft_status(&self, range_id: RangeId) -> Option<quarry_raft::GroupStatus> {
        self.multiraft.get()?.status(range_id).await
    }

    fn range_context(&self) -> Result<RangeContext> {
        Ok(RangeContext {
            engine: self.engine.clone(),
            clock: self.cfg.clock.clone(),
            ident: self.ident()?,
            multiraft: self.multiraft()?.clone(),
            stopped: self.stopped.clone(),
        })
    }

    // ---- replica indexes ----

    pub fn replica_count(&self) -> usize {
        self.replicas.read().expect("replica maps lock").by_id.len()
    }

    pub fn get_replica(&self, range_id: RangeId) -> Result<Arc<Replica>> {
        self.replicas
            .read()
            .expect("replica maps lock")
            .by_id
            .get(&range_id)
            .cloned()
            .ok_or(Error::RangeNotFound(range_id))
    }

    /// All replicas, in unspecified order.
    pub(crate) fn all_replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas
            .read()
            .expect("replica maps lock")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    /// Find the replica containing `[start, end)` (address keys): the
    /// smallest end key strictly greater than `start` whose descriptor
    /// contains the span.
    pub fn lookup_replica(&self, start: &[u8], end: &[u8]) -> Option<Arc<Replica>> {
        let maps = self.replicas.read().expect("replica maps lock");
        let (_, replica) = maps
            .by_key
            .range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded))
            .next()?;
        if !replica.desc().contains_key_range(start, end) {
            return None;
        }
        Some(replica.clone())
    }

    fn add_replica_internal(&self, replica: Arc<Replica>) -> Result<()> {
        if !replica.is_initialized() {
            return Err(Error::internal("attempted to index an uninitialized range"));
        }
        let mut maps = self.replicas.write().expect("replica maps lock");
        let range_id = replica.range_id();
        if maps.by_id.contains_key(&range_id) && !maps.uninit.contains_key(&range_id) {
            return Err(Error::internal(format!(
                "range {range_id} already exists on store"
            )));
        }
        maps.uninit.remove(&range_id);
        maps.by_id.insert(range_id, replica.clone());
        let end_key = replica.desc().end_key.clone();
        if maps.by_key.insert(end_key, replica).is_some() {
            return Err(Error::internal("end key already indexed on store"));
        }
        Ok(())
    }

    /// Register an uninitialized placeholder created for an incoming
    /// snapshot; it joins the end-key index when the snapshot applies.
    fn add_uninitialized_replica(&self, replica: Arc<Replica>) {
        let mut maps = self.replicas.write().expect("replica maps lock");
        maps.by_id.insert(replica.range_id(), replica.clone());
        maps.uninit.insert(replica.range_id(), replica);
    }

    /// Move a replica from the uninitialized set into the end-key index
    /// once its descriptor is known (snapshot applied).
    pub(crate) fn mark_replica_initialized(&self, replica: &Arc<Replica>) -> Result<()> {
        let mut maps = self.replicas.write().expect("replica maps lock");
        if maps.uninit.remove(&replica.range_id()).is_none() {
            return Ok(());
        }
        let end_key = replica.desc().end_key.clone();
        if maps.by_key.insert(end_key, replica.clone()).is_some() {
            return Err(Error::internal("end key already indexed on store"));
        }
        Ok(())
    }

    /// Allocate a fresh range ID from the persisted store-local counter.
    pub(crate) fn allocate_range_id(&self) -> Result<RangeId> {
        let _guard = self.range_id_lock.lock().expect("range id lock");
        let key = keys::store_range_id_generator_key();
        let next = match mvcc::mvcc_get_inline(&*self.engine, &key).map_err(Error::from)? {
            Some(v) => v.as_int().map_err(Error::from)? as RangeId,
            None => 2,
        };
        let mut batch = Batch::new(&*self.engine);
        mvcc::mvcc_put_inline(&mut batch, &key, Value::from_int((next + 1) as i64))
            .map_err(Error::from)?;
        batch.commit().map_err(Error::from)?;
        Ok(next)
    }

    // ---- split / merge / removal bookkeeping ----

    /// Re-index both halves after a committed split. Runs on the
    /// consensus event task.
    pub(crate) fn split_range(&self, orig: &Replica, trigger: &SplitTrigger) -> Result<()> {
        let mut maps = self.replicas.write().expect("replica maps lock");
        let old_end = orig.desc().end_key.clone();
        if maps.by_key.remove(&old_end).is_none() {
            return Err(Error::internal("split range missing from end-key index"));
        }
        orig.set_desc(trigger.updated_desc.clone());
        let orig_arc = maps
            .by_id
            .get(&orig.range_id())
            .cloned()
            .ok_or(Error::RangeNotFound(orig.range_id()))?;
        maps.by_key
            .insert(trigger.updated_desc.end_key.clone(), orig_arc);

        let new_range_id = trigger.new_desc.range_id;
        // An uninitialized placeholder for the new range loses to the
        // replica created by the split.
        maps.uninit.remove(&new_range_id);
        maps.by_id.remove(&new_range_id);
        drop(maps);

        let replica = Arc::new(
            Replica::new(trigger.new_desc.clone(), self.range_context()?)
                .map_err(Error::from)?,
        );
        self.add_replica_internal(replica)?;
        info!(
            range = orig.range_id(),
            new_range = new_range_id,
            "split applied"
        );
        Ok(())
    }

    /// Absorb the subsumed range after a committed merge. Runs on the
    /// consensus event task.
    pub(crate) async fn merge_range(
        self: &Arc<Self>,
        subsuming: &Replica,
        trigger: &MergeTrigger,
    ) -> Result<()> {
        let subsumed = self.get_replica(trigger.subsumed_desc.range_id)?;
        if !subsuming
            .desc()
            .replicas_collocated_with(&subsumed.desc())
        {
            return Err(Error::internal("cannot merge ranges that are not collocated"));
        }
        self.remove_replica_impl(&subsumed).await?;

        let mut maps = self.replicas.write().expect("replica maps lock");
        let old_end = subsuming.desc().end_key.clone();
        let subsuming_arc = maps
            .by_id
            .get(&subsuming.range_id())
            .cloned()
            .ok_or(Error::RangeNotFound(subsuming.range_id()))?;
        maps.by_key.remove(&old_end);
        subsuming.set_desc(trigger.updated_desc.clone());
        maps.by_key
            .insert(trigger.updated_desc.end_key.clone(), subsuming_arc);
        info!(
            range = subsuming.range_id(),
            subsumed = trigger.subsumed_desc.range_id,
            "merge applied"
        );
        Ok(())
    }

    pub(crate) fn update_replica_descriptor(&self, replica: &Replica, desc: RangeDescriptor) {
        replica.set_desc(desc);
    }

    /// Remove a replica through the consensus event task so removal
    /// never races an in-flight apply.
    pub async fn remove_replica(&self, replica: Arc<Replica>) -> Result<()> {
        let ops = self.ops.get().ok_or(Error::Stopped)?;
        let (reply, rx) = oneshot::channel();
        ops.send(StoreOp::RemoveReplica { replica, reply })
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    async fn remove_replica_impl(&self, replica: &Arc<Replica>) -> Result<()> {
        // Silence the replica first so late proposals see RangeNotFound
        // instead of hanging.
        replica.quiesce();
        self.multiraft()?
            .remove_group(replica.range_id())
            .await
            .map_err(Error::from)?;
        let mut maps = self.replicas.write().expect("replica maps lock");
        maps.by_id.remove(&replica.range_id());
        maps.uninit.remove(&replica.range_id());
        let end_key = replica.desc().end_key.clone();
        if !end_key.is_empty() {
            maps.by_key.remove(&end_key);
        }
        Ok(())
    }

    /// Garbage-collect a replica that is no longer a member of its
    /// range: persist a tombstone, drop its data, remove the group.
    pub async fn destroy_replica(self: &Arc<Self>, replica: Arc<Replica>) -> Result<()> {
        let desc = replica.desc();
        info!(range = replica.range_id(), "garbage collecting replica");
        self.remove_replica(replica.clone()).await?;

        let mut batch = Batch::new(&*self.engine);
        let tombstone = RaftTombstone {
            next_replica_id: desc.next_replica_id,
        };
        // Drop every key the replica owns, then write the tombstone so
        // stale messages for old incarnations are rejected.
        let spans = [
            keys::range_id_span(desc.range_id),
            keys::range_key_local_span(&desc.start_key, &desc.end_key),
            (desc.start_key.clone(), desc.end_key.clone()),
        ];
        for (lo, hi) in spans {
            let enc_lo = mvcc::mvcc_encode_meta_key(&lo);
            let enc_hi = mvcc::mvcc_encode_meta_key(&hi);
            let mut victims = Vec::new();
            self.engine
                .iterate(&enc_lo, &enc_hi, false, &mut |k, _| {
                    victims.push(k.to_vec());
                    Ok(false)
                })
                .map_err(Error::from)?;
            for key in victims {
                batch.delete(&key);
            }
        }
        mvcc::mvcc_put_inline(
            &mut batch,
            &keys::raft_tombstone_key(desc.range_id),
            Value::from_bytes(bincode::serialize(&tombstone).map_err(|e| Error::internal(e))?),
        )
        .map_err(Error::from)?;
        batch.commit().map_err(Error::from)?;
        Ok(())
    }

    // ---- the public send path ----

    /// Route and execute a batch, retrying recoverable errors with
    /// exponential backoff per the store's retry options.
    ///
    /// Written as a plain fn returning an explicitly boxed future (rather
    /// than `async fn`) because `send` and `resolve_write_intent_error`
    /// call each other reentrantly; an `async fn` here would give `send`
    /// an opaque return type and the mutual recursion would leave the
    /// compiler unable to prove the future is `Send`.
    pub fn send<'a>(
        self: &'a Arc<Self>,
        mut ba: BatchRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<BatchResponse>> + Send + 'a>>
    {
        Box::pin(async move { self.send_impl(&mut ba).await })
    }

    async fn send_impl(self: &Arc<Self>, ba: &mut BatchRequest) -> Result<BatchResponse> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        for req in &ba.requests {
            if matches!(req, Request::Noop) {
                continue;
            }
            let header = req.header();
            verify_keys(&header.key, &header.end_key, req.is_range())
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
        }

        // Clock admission and forwarding: commands from the future are
        // rejected before raft would ratchet every replica's clock.
        if !ba.header.timestamp.is_zero() {
            let max_offset = self.cfg.clock.max_offset();
            if !max_offset.is_zero() {
                let ahead = ba.header.timestamp.wall_time - self.cfg.clock.physical_now();
                if ahead > max_offset.as_nanos() as i64 {
                    return Err(Error::TimestampTooFar {
                        timestamp: ba.header.timestamp,
                        offset_nanos: ahead,
                    });
                }
            }
        } else if let Some(txn) = &ba.header.txn {
            ba.header.timestamp = txn.timestamp;
        } else {
            ba.header.timestamp = self.cfg.clock.now();
        }
        self.cfg.clock.update(ba.header.timestamp);

        let retry = self.cfg.range_retry_options;
        let mut backoff = retry.initial_backoff;
        let mut attempts = 0usize;
        let mut last_err: Error;
        loop {
            attempts += 1;
            if retry.max_retries > 0 && attempts > retry.max_retries {
                // Retry budget exhausted: transactional batches restart.
                if let Some(txn) = ba.header.txn.clone() {
                    return Err(Error::TransactionRetry { txn: Box::new(txn) });
                }
                return Err(Error::internal("retry limit exceeded"));
            }

            let replica = self.route(ba)?;
            match replica.send(self, ba.clone()).await {
                Ok(br) => return Ok(br),
                Err(err) => last_err = err,
            }

            match last_err {
                Error::WriteTooOld { existing, .. } => {
                    // Jump past the existing version and retry at once.
                    debug!(existing = %existing, "write too old; retrying above");
                    ba.header.timestamp.forward(existing.next());
                    backoff = retry.initial_backoff;
                    continue;
                }
                Error::WriteIntent {
                    intents,
                    resolved: _,
                    index,
                } => {
                    let boxed_resolve: std::pin::Pin<
                        Box<dyn std::future::Future<Output = Error> + Send + '_>,
                    > = Box::pin(self.resolve_write_intent_error(&*ba, intents, index));
                    let err = boxed_resolve.await;
                    match err {
                        Error::WriteIntent {
                            resolved: true, ..
                        } => {
                            backoff = retry.initial_backoff;
                            continue;
                        }
                        Error::WriteIntent {
                            intents,
                            resolved: false,
                            ..
                        } => {
                            // Push failed: move past the writers (for
                            // writes) and back off.
                            if ba.is_write() {
                                for intent in &intents {
                                    if ba.header.timestamp < intent.txn.timestamp {
                                        ba.header.timestamp = intent.txn.timestamp.next();
                                    }
                                }
                            }
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * retry.multiplier).min(retry.max_backoff);
                            continue;
                        }
                        other => return Err(other),
                    }
                }
                Error::ReadWithinUncertaintyInterval {
                    timestamp,
                    existing,
                    ..
                } => {
                    return Err(Error::ReadWithinUncertaintyInterval {
                        timestamp,
                        existing,
                        node_id: self.ident()?.node_id,
                    });
                }
                other => return Err(other),
            }
        }
    }

    fn route(&self, ba: &mut BatchRequest) -> Result<Arc<Replica>> {
        if ba.header.range_id != 0 {
            return self.get_replica(ba.header.range_id);
        }
        let first = ba
            .requests
            .iter()
            .find(|r| !matches!(r, Request::Noop))
            .ok_or_else(|| Error::internal("batch without requests"))?;
        let header = first.header();
        let start = keys::addr(&header.key).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let end = if header.end_key.is_empty() {
            Vec::new()
        } else {
            keys::addr(&header.end_key).map_err(|e| Error::InvalidKey(e.to_string()))?
        };
        let replica = self
            .lookup_replica(&start, &end)
            .ok_or(Error::RangeKeyMismatch {
                start: header.key.clone(),
                end: header.end_key.clone(),
                range: None,
            })?;
        ba.header.range_id = replica.range_id();
        if let Some(rep) = replica.desc().replica_for_store(self.ident()?.store_id) {
            ba.header.replica = rep;
        }
        Ok(replica)
    }

    /// Push the transactions behind conflicting intents: abort them for
    /// write conflicts, move their timestamps for reads. On success the
    /// returned error carries `resolved = true` and intent resolution is
    /// kicked off asynchronously; the caller retries immediately.
    async fn resolve_write_intent_error(
        self: &Arc<Self>,
        ba: &BatchRequest,
        intents: Vec<Intent>,
        index: Option<usize>,
    ) -> Error {
        let push_type = if ba.is_write() {
            PushTxnType::AbortTxn
        } else {
            PushTxnType::PushTimestamp
        };
        let pusher_txn = ba.header.txn.clone();
        // The clock, not the batch timestamp: a fixed batch timestamp
        // would never notice that a transaction stopped heartbeating.
        let now = self.cfg.clock.now();

        let mut push_intents = Vec::new();
        let mut resolve_intents = Vec::new();
        for intent in intents.iter().cloned() {
            if intent.txn.status == TxnStatus::Pending {
                push_intents.push(intent);
            } else {
                resolve_intents.push(intent);
            }
        }

        let pusher = pusher_txn.clone().unwrap_or_else(|| Transaction {
            priority: make_priority(ba.header.user_priority),
            ..Default::default()
        });

        let mut push_failed: Option<Error> = None;
        for intent in &mut push_intents {
            let push_ba = BatchRequest {
                header: BatchHeader {
                    timestamp: now,
                    ..Default::default()
                },
                requests: vec![Request::PushTxn {
                    header: RequestHeader::point(&intent.txn.key),
                    pusher: Some(pusher.clone()),
                    pushee: intent.txn.clone(),
                    push_to: ba.header.timestamp,
                    now,
                    push_type,
                }],
            };
            // Reentrant send: pushes route through the store like any
            // other batch.
            let result = self.send(push_ba).await;
            match result {
                Ok(br) => {
                    if let Some(Response::PushTxn {
                        pushee: Some(updated),
                    }) = br.responses.into_iter().next()
                    {
                        intent.txn = updated;
                    }
                    resolve_intents.push(intent.clone());
                }
                Err(err) => {
                    push_failed = Some(err);
                    break;
                }
            }
        }

        if let Some(push_err) = push_failed {
            debug!(error = %push_err, "push failed during conflict resolution");
            // Write/write conflicts inside a transaction propagate the
            // push error so the client restarts; read conflicts back off
            // and retry the read.
            let read_only = ba.is_read_only();
            if pusher_txn.is_some() && !read_only {
                let mut err = push_err;
                if let Some(i) = index {
                    err.set_error_index(i);
                }
                return err;
            }
            return Error::WriteIntent {
                intents,
                resolved: false,
                index,
            };
        }

        // Pushes succeeded (or were unnecessary): resolve asynchronously
        // and let the caller retry immediately.
        for intent in resolve_intents {
            let store = self.clone();
            tokio::spawn(async move {
                let resolve_ba = BatchRequest {
                    header: BatchHeader {
                        timestamp: store.cfg.clock.now(),
                        ..Default::default()
                    },
                    requests: vec![if intent.end_key.is_empty() {
                        Request::ResolveIntent {
                            header: RequestHeader::point(&intent.key),
                            intent_txn: intent.txn.clone(),
                        }
                    } else {
                        Request::ResolveIntentRange {
                            header: RequestHeader::span(&intent.key, &intent.end_key),
                            intent_txn: intent.txn.clone(),
                        }
                    }],
                };
                if let Err(err) = store.send(resolve_ba).await {
                    debug!(error = %err, "async intent resolution failed");
                }
            });
        }

        Error::WriteIntent {
            intents,
            resolved: true,
            index,
        }
    }
}

// ---- consensus event loop ----

/// Apply committed commands and membership changes, and serialize
/// replica removal, on one task.
async fn run_raft_events(
    store: Arc<Store>,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut ops: mpsc::UnboundedReceiver<StoreOp>,
) {
    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(event) => handle_raft_event(&store, event).await,
                    None => break,
                }
            }
            maybe_op = ops.recv() => {
                match maybe_op {
                    Some(StoreOp::RemoveReplica { replica, reply }) => {
                        let _ = reply.send(store.remove_replica_impl(&replica).await);
                    }
                    None => break,
                }
            }
        }
    }
    debug!("raft event loop finished");
}

async fn handle_raft_event(store: &Arc<Store>, event: Event) {
    match event {
        Event::CommandCommitted {
            group_id,
            command_id,
            command,
            index,
        } => {
            let Ok(cmd) = bincode::deserialize::<RaftCommand>(&command) else {
                // Committed bytes every replica must apply identically;
                // failing to decode them is unrecoverable.
                panic!("undecodable committed command in group {group_id}");
            };
            if cmd.range_id != group_id {
                panic!(
                    "committed command for range {} delivered to group {group_id}",
                    cmd.range_id
                );
            }
            match store.get_replica(group_id) {
                Ok(replica) => {
                    if let Err(err) = replica
                        .apply_raft_command(store, index, command_id, cmd)
                        .await
                    {
                        debug!(range = group_id, index, error = %err, "command application returned error");
                    }
                    maybe_initialize(store, group_id);
                }
                Err(err) => {
                    error!(range = group_id, error = %err, "committed command for unknown range");
                }
            }
        }
        Event::MembershipChangeCommitted {
            group_id,
            command_id,
            index,
            payload,
            callback,
            ..
        } => {
            let result = apply_membership_change(store, group_id, command_id, index, payload).await;
            callback.complete(result.map_err(|e| anyhow::anyhow!("{e}")));
        }
        Event::LeaderElection {
            group_id,
            replica_id,
            term,
        } => {
            debug!(range = group_id, replica = replica_id, term, "leader elected");
        }
    }
}

/// A replica created for an incoming snapshot joins the end-key index
/// once a snapshot gave it a real descriptor.
fn maybe_initialize(store: &Arc<Store>, range_id: RangeId) {
    if let Ok(replica) = store.get_replica(range_id) {
        if replica.is_initialized() {
            if let Err(err) = store.mark_replica_initialized(&replica) {
                warn!(range = range_id, error = %err, "initializing replica failed");
            }
        }
    }
}

async fn apply_membership_change(
    store: &Arc<Store>,
    group_id: RangeId,
    command_id: CommandId,
    index: u64,
    payload: Vec<u8>,
) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    let cmd: RaftCommand = bincode::deserialize(&payload)
        .map_err(|e| Error::internal(format!("undecodable membership payload: {e}")))?;
    let replica = store.get_replica(group_id)?;
    replica
        .apply_raft_command(store, index, command_id, cmd)
        .await
}

// ---- consensus storage provider ----

/// The store's side of the consensus runtime contract. Holds a weak
/// reference so the store can shut down while the runtime drains.
struct StoreRaftProvider(Weak<Store>);

impl StoreRaftProvider {
    fn store(&self) -> std::result::Result<Arc<Store>, RaftError> {
        self.0.upgrade().ok_or(RaftError::Stopped)
    }
}

impl StorageProvider for StoreRaftProvider {
    fn group_storage(
        &self,
        group_id: u64,
        replica_id: u64,
    ) -> std::result::Result<Arc<dyn GroupStorage>, RaftError> {
        let store = self.store()?;
        if let Ok(replica) = store.get_replica(group_id) {
            return Ok(replica);
        }
        // Unknown group: consult the tombstone before creating an
        // uninitialized placeholder that waits for a snapshot.
        let tombstone = mvcc::mvcc_get_inline(&*store.engine, &keys::raft_tombstone_key(group_id))
            .map_err(RaftError::Storage)?;
        if let Some(v) = tombstone {
            let tombstone: RaftTombstone = bincode::deserialize(v.as_bytes())
                .map_err(|e| RaftError::Storage(e.into()))?;
            if replica_id != 0 && replica_id < tombstone.next_replica_id {
                return Err(RaftError::GroupDeleted);
            }
        }
        let desc = RangeDescriptor {
            range_id: group_id,
            ..Default::default()
        };
        let ctx = store
            .range_context()
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        let replica = Arc::new(
            Replica::new(desc, ctx).map_err(RaftError::Storage)?,
        );
        store.add_uninitialized_replica(replica.clone());
        Ok(replica)
    }

    fn replica_descriptor(
        &self,
        group_id: u64,
        replica_id: u64,
    ) -> std::result::Result<quarry_raft::ReplicaDesc, RaftError> {
        let store = self.store()?;
        let replica = store
            .get_replica(group_id)
            .map_err(|_| RaftError::GroupNotFound(group_id))?;
        let desc = replica
            .replica_descriptor(replica_id)
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        Ok(quarry_raft::ReplicaDesc {
            node_id: desc.node_id,
            store_id: desc.store_id,
            replica_id: desc.replica_id,
        })
    }

    fn replica_id_for_store(
        &self,
        group_id: u64,
        store_id: u64,
    ) -> std::result::Result<u64, RaftError> {
        let store = self.store()?;
        let replica = store
            .get_replica(group_id)
            .map_err(|_| RaftError::GroupNotFound(group_id))?;
        replica
            .desc()
            .replica_for_store(store_id)
            .map(|r| r.replica_id)
            .ok_or_else(|| {
                RaftError::Internal(format!(
                    "store {store_id} is not a replica of range {group_id}"
                ))
            })
    }

    fn replicas_from_snapshot(
        &self,
        snap: &Snapshot,
    ) -> std::result::Result<Vec<quarry_raft::ReplicaDesc>, RaftError> {
        let data: RaftSnapshotData = bincode::deserialize(&snap.data)
            .map_err(|e| RaftError::Storage(e.into()))?;
        Ok(data
            .range_descriptor
            .replicas
            .iter()
            .map(|r| quarry_raft::ReplicaDesc {
                node_id: r.node_id,
                store_id: r.store_id,
                replica_id: r.replica_id,
            })
            .collect())
    }

    fn can_apply_snapshot(&self, group_id: u64, snap: &Snapshot) -> bool {
        let Ok(store) = self.store() else {
            return false;
        };
        if let Ok(replica) = store.get_replica(group_id) {
            if replica.is_initialized() {
                // The range exists and knows its bounds; let the
                // snapshot through.
                return true;
            }
        }
        // The placeholder can only be initialized if no other range
        // already claims the snapshot's span.
        let Ok(data) = bincode::deserialize::<RaftSnapshotData>(&snap.data) else {
            return false;
        };
        let maps = store.replicas.read().expect("replica maps lock");
        !maps
            .by_key
            .contains_key(&data.range_descriptor.end_key)
    }

    fn applied_index(&self, group_id: u64) -> std::result::Result<u64, RaftError> {
        let store = self.store()?;
        let replica = store
            .get_replica(group_id)
            .map_err(|_| RaftError::GroupNotFound(group_id))?;
        Ok(replica.applied_index())
    }
}
