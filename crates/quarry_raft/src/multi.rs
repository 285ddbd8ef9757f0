//! The multi-group runtime.
//!
//! One loop task per store owns every group's consensus core and all the
//! bookkeeping maps; clients interact only through channels. The loop
//! alternates between consuming inputs and running the ready pipeline:
//! pending per-group output is handed to a dedicated write thread, and
//! only after the write is acknowledged are committed entries surfaced
//! and outgoing messages sent, so no message ever promises a log prefix
//! that is not durable.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::group::{CoreConfig, GroupStatus, RaftCore};
use crate::storage::GroupStorage;
use crate::transport::{RaftMessageRequest, Transport};
use crate::types::{
    encode_command, CommandId, ConfChange, ConfChangeContext, ConfChangeKind, Entry, EntryKind,
    GroupId, HardState, Message, MessageKind, NodeId, Ready, ReplicaDesc, ReplicaId, Snapshot,
    StoreId, NO_GROUP,
};
use crate::{decode_command, RaftError};

/// Bound on the replica descriptor cache. Descriptors reloadable from
/// disk share the cache with message-derived ones that are not.
const MAX_REPLICA_DESC_CACHE: usize = 1000;

#[derive(Clone, Debug)]
pub struct MultiRaftConfig {
    pub node_id: NodeId,
    pub store_id: StoreId,
    /// Resolution of the raft timer; all other timeouts are multiples.
    pub tick_interval: Duration,
    /// Ticks without leader contact before an election is called. The
    /// effective timeout is randomized over `[n, 2n)` ticks.
    pub election_timeout_ticks: usize,
    /// Ticks between (coalesced) heartbeats.
    pub heartbeat_interval_ticks: usize,
}

impl MultiRaftConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.node_id > 0, "node id is required");
        anyhow::ensure!(self.store_id > 0, "store id is required");
        anyhow::ensure!(
            self.election_timeout_ticks > 0,
            "election timeout ticks must be greater than zero"
        );
        anyhow::ensure!(
            self.heartbeat_interval_ticks > 0,
            "heartbeat interval ticks must be greater than zero"
        );
        anyhow::ensure!(
            !self.tick_interval.is_zero(),
            "tick interval must be greater than zero"
        );
        Ok(())
    }
}

/// Storage and routing facts the runtime needs from the application.
pub trait StorageProvider: Send + Sync + 'static {
    /// Storage for a group, creating an uninitialized placeholder if the
    /// group is unknown. Fails with `GroupDeleted` when a tombstone
    /// records a newer replica ID than the requested one.
    fn group_storage(
        &self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<Arc<dyn GroupStorage>, RaftError>;

    fn replica_descriptor(
        &self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<ReplicaDesc, RaftError>;

    fn replica_id_for_store(
        &self,
        group_id: GroupId,
        store_id: StoreId,
    ) -> Result<ReplicaId, RaftError>;

    fn replicas_from_snapshot(&self, snap: &Snapshot) -> Result<Vec<ReplicaDesc>, RaftError>;

    /// Admission check run before a snapshot message is stepped into the
    /// group.
    fn can_apply_snapshot(&self, group_id: GroupId, snap: &Snapshot) -> bool;

    /// Highest applied index for the group's state machine.
    fn applied_index(&self, group_id: GroupId) -> Result<u64, RaftError>;
}

/// Events surfaced to the application, in commit order per group.
pub enum Event {
    CommandCommitted {
        group_id: GroupId,
        command_id: CommandId,
        command: Vec<u8>,
        index: u64,
    },
    MembershipChangeCommitted {
        group_id: GroupId,
        command_id: CommandId,
        index: u64,
        replica: ReplicaDesc,
        kind: ConfChangeKind,
        payload: Vec<u8>,
        /// The change is not applied to the group until this callback is
        /// completed; an error reply rejects it.
        callback: ConfChangeCallback,
    },
    LeaderElection {
        group_id: GroupId,
        replica_id: ReplicaId,
        term: u64,
    },
}

/// One-shot reply channel for a committed membership change, routed back
/// into the loop as a callback input.
pub struct ConfChangeCallback {
    group_id: GroupId,
    cc: ConfChange,
    replica: ReplicaDesc,
    ops: mpsc::UnboundedSender<LoopOp>,
}

impl ConfChangeCallback {
    pub fn complete(self, result: anyhow::Result<()>) {
        let _ = self.ops.send(LoopOp::ConfChangeDone {
            group_id: self.group_id,
            cc: self.cc,
            replica: self.replica,
            error: result.err().map(|e| format!("{e:#}")),
        });
    }
}

enum ProposalKind {
    Command(Vec<u8>),
    ConfChange {
        kind: ConfChangeKind,
        replica: ReplicaDesc,
        payload: Vec<u8>,
    },
}

struct PendingProposal {
    command_id: CommandId,
    kind: ProposalKind,
    ch: Option<oneshot::Sender<Result<(), RaftError>>>,
}

impl PendingProposal {
    fn complete(&mut self, result: Result<(), RaftError>) {
        if let Some(ch) = self.ch.take() {
            let _ = ch.send(result);
        }
    }
}

enum LoopOp {
    Message(RaftMessageRequest),
    CreateGroup {
        group_id: GroupId,
        replica_id: ReplicaId,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    RemoveGroup {
        group_id: GroupId,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    Propose(PendingProposal, GroupId),
    Status {
        group_id: GroupId,
        reply: oneshot::Sender<Option<GroupStatus>>,
    },
    ConfChangeDone {
        group_id: GroupId,
        cc: ConfChange,
        replica: ReplicaDesc,
        error: Option<String>,
    },
    Stop,
}

/// Handle to the runtime loop. Cheap to clone; all methods funnel into
/// the loop's input channel.
#[derive(Clone)]
pub struct MultiRaft {
    ops: mpsc::UnboundedSender<LoopOp>,
}

impl MultiRaft {
    /// Start the loop task and the write thread. Returns the handle, the
    /// event stream, and the loop task's join handle.
    pub fn start(
        cfg: MultiRaftConfig,
        provider: Arc<dyn StorageProvider>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<(MultiRaft, mpsc::UnboundedReceiver<Event>, JoinHandle<()>)> {
        cfg.validate()?;
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = std_mpsc::channel::<WriteRequest>();
        thread::Builder::new()
            .name("raft-write".to_string())
            .spawn(move || write_task(write_rx))
            .map_err(|e| anyhow::anyhow!("spawn raft write thread: {e}"))?;

        let state = LoopState {
            cfg,
            provider,
            transport,
            groups: HashMap::new(),
            nodes: HashMap::new(),
            desc_cache: ReplicaDescCache::new(MAX_REPLICA_DESC_CACHE),
            events: events_tx,
            ops: ops_tx.clone(),
            write_tx,
        };
        let task = tokio::spawn(state.run(ops_rx));
        Ok((MultiRaft { ops: ops_tx }, events_rx, task))
    }

    /// Enqueue an inbound wire message. Returns as soon as the message is
    /// queued.
    pub fn handle_raft_message(&self, req: RaftMessageRequest) -> Result<(), RaftError> {
        self.ops
            .send(LoopOp::Message(req))
            .map_err(|_| RaftError::Stopped)
    }

    /// Create (or join) a consensus group. Membership comes from the
    /// group storage's initial state; `replica_id` is zero when it should
    /// be resolved from storage.
    pub async fn create_group(
        &self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(LoopOp::CreateGroup {
                group_id,
                replica_id,
                reply,
            })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Destroy a group. Pending commands complete with `GroupDeleted`.
    pub async fn remove_group(&self, group_id: GroupId) -> Result<(), RaftError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(LoopOp::RemoveGroup { group_id, reply })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Submit a command. The returned channel fires when the command has
    /// committed (not necessarily applied) or failed.
    pub fn submit_command(
        &self,
        group_id: GroupId,
        command_id: CommandId,
        command: Vec<u8>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        let (tx, rx) = oneshot::channel();
        let prop = PendingProposal {
            command_id,
            kind: ProposalKind::Command(command),
            ch: Some(tx),
        };
        if let Err(send_err) = self.ops.send(LoopOp::Propose(prop, group_id)) {
            if let LoopOp::Propose(mut prop, _) = send_err.0 {
                prop.complete(Err(RaftError::Stopped));
            }
        }
        rx
    }

    /// Submit a membership change. The payload is an opaque blob handed
    /// back in the resulting `MembershipChangeCommitted` event.
    pub fn change_group_membership(
        &self,
        group_id: GroupId,
        command_id: CommandId,
        kind: ConfChangeKind,
        replica: ReplicaDesc,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<Result<(), RaftError>> {
        let (tx, rx) = oneshot::channel();
        let mut prop = PendingProposal {
            command_id,
            kind: ProposalKind::ConfChange {
                kind,
                replica,
                payload,
            },
            ch: Some(tx),
        };
        if let Err(err) = replica.validate() {
            prop.complete(Err(err));
            return rx;
        }
        if let Err(send_err) = self.ops.send(LoopOp::Propose(prop, group_id)) {
            if let LoopOp::Propose(mut prop, _) = send_err.0 {
                prop.complete(Err(RaftError::Stopped));
            }
        }
        rx
    }

    pub async fn status(&self, group_id: GroupId) -> Option<GroupStatus> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(LoopOp::Status { group_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn stop(&self) {
        let _ = self.ops.send(LoopOp::Stop);
    }
}

// ---- write task ----

struct GroupWrite {
    storage: Arc<dyn GroupStorage>,
    hard_state: Option<HardState>,
    snapshot: Option<Snapshot>,
    entries: Vec<Entry>,
}

struct WriteRequest {
    groups: Vec<(GroupId, GroupWrite)>,
    done: oneshot::Sender<anyhow::Result<()>>,
}

/// Single-consumer persistence worker: hard state first, then snapshot,
/// then log entries, per group.
fn write_task(rx: std_mpsc::Receiver<WriteRequest>) {
    while let Ok(req) = rx.recv() {
        let mut result: anyhow::Result<()> = Ok(());
        'groups: for (group_id, write) in &req.groups {
            if let Some(hs) = &write.hard_state {
                if let Err(err) = write.storage.set_hard_state(hs) {
                    result = Err(anyhow::anyhow!("group {group_id} hard state: {err}"));
                    break 'groups;
                }
            }
            if let Some(snap) = &write.snapshot {
                if let Err(err) = write.storage.apply_snapshot(snap) {
                    result = Err(anyhow::anyhow!("group {group_id} snapshot: {err}"));
                    break 'groups;
                }
            }
            if !write.entries.is_empty() {
                if let Err(err) = write.storage.append(&write.entries) {
                    result = Err(anyhow::anyhow!("group {group_id} append: {err}"));
                    break 'groups;
                }
            }
        }
        let _ = req.done.send(result);
    }
}

// ---- loop state ----

struct Group {
    group_id: GroupId,
    replica_id: ReplicaId,
    core: RaftCore,
    storage: Arc<dyn GroupStorage>,
    committed_term: u64,
    leader: ReplicaDesc,
    pending: HashMap<CommandId, PendingProposal>,
    /// True while a ready batch for this group is in flight to the write
    /// thread. A group recreated in the meantime must not consume the
    /// stale ack.
    writing: bool,
    node_ids: Vec<NodeId>,
    /// Outstanding membership-change callbacks; proposals are held while
    /// this is positive.
    wait_for_callback: usize,
}

struct ReplicaDescCache {
    map: HashMap<(GroupId, ReplicaId), (ReplicaDesc, u64)>,
    clock: u64,
    cap: usize,
}

impl ReplicaDescCache {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            clock: 0,
            cap,
        }
    }

    fn get(&mut self, key: (GroupId, ReplicaId)) -> Option<ReplicaDesc> {
        self.clock += 1;
        let clock = self.clock;
        self.map.get_mut(&key).map(|(desc, used)| {
            *used = clock;
            *desc
        })
    }

    fn add(&mut self, key: (GroupId, ReplicaId), desc: ReplicaDesc) {
        self.clock += 1;
        self.map.insert(key, (desc, self.clock));
        if self.map.len() > self.cap {
            if let Some(victim) = self
                .map
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| *k)
            {
                self.map.remove(&victim);
            }
        }
    }
}

struct LoopState {
    cfg: MultiRaftConfig,
    provider: Arc<dyn StorageProvider>,
    transport: Arc<dyn Transport>,
    groups: HashMap<GroupId, Group>,
    nodes: HashMap<NodeId, HashSet<GroupId>>,
    desc_cache: ReplicaDescCache,
    events: mpsc::UnboundedSender<Event>,
    ops: mpsc::UnboundedSender<LoopOp>,
    write_tx: std_mpsc::Sender<WriteRequest>,
}

impl LoopState {
    async fn run(mut self, mut ops_rx: mpsc::UnboundedReceiver<LoopOp>) {
        info!(node = self.cfg.node_id, store = self.cfg.store_id, "raft loop starting");
        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks = 0usize;
        loop {
            tokio::select! {
                maybe_op = ops_rx.recv() => {
                    match maybe_op {
                        None | Some(LoopOp::Stop) => break,
                        Some(op) => self.handle_op(op),
                    }
                }
                _ = tick.tick() => {
                    for g in self.groups.values_mut() {
                        g.core.tick();
                    }
                    ticks += 1;
                    if ticks >= self.cfg.heartbeat_interval_ticks {
                        ticks = 0;
                        self.coalesced_heartbeat();
                    }
                }
            }
            self.process_ready().await;
        }
        self.shutdown();
    }

    fn handle_op(&mut self, op: LoopOp) {
        match op {
            LoopOp::Message(req) => self.handle_message(req),
            LoopOp::CreateGroup {
                group_id,
                replica_id,
                reply,
            } => {
                let _ = reply.send(self.create_group(group_id, replica_id));
            }
            LoopOp::RemoveGroup { group_id, reply } => {
                let _ = reply.send(self.remove_group(group_id));
            }
            LoopOp::Propose(prop, group_id) => self.deliver_proposal(group_id, prop),
            LoopOp::Status { group_id, reply } => {
                let _ = reply.send(self.groups.get(&group_id).map(|g| g.core.status()));
            }
            LoopOp::ConfChangeDone {
                group_id,
                cc,
                replica,
                error,
            } => self.conf_change_done(group_id, cc, replica, error),
            LoopOp::Stop => {}
        }
    }

    fn shutdown(&mut self) {
        info!(store = self.cfg.store_id, "raft loop stopping");
        for g in self.groups.values_mut() {
            for (_, mut p) in g.pending.drain() {
                p.complete(Err(RaftError::Stopped));
            }
        }
    }

    // ---- node bookkeeping ----

    fn add_node(nodes: &mut HashMap<NodeId, HashSet<GroupId>>, node_id: NodeId, g: &mut Group) {
        nodes.entry(node_id).or_default().insert(g.group_id);
        if !g.node_ids.contains(&node_id) {
            g.node_ids.push(node_id);
        }
    }

    fn remove_node(
        nodes: &mut HashMap<NodeId, HashSet<GroupId>>,
        node_id: NodeId,
        g: &mut Group,
    ) {
        if let Some(set) = nodes.get_mut(&node_id) {
            set.remove(&g.group_id);
        }
        g.node_ids.retain(|&n| n != node_id);
    }

    // ---- descriptor cache ----

    fn replica_descriptor(
        &mut self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<ReplicaDesc, RaftError> {
        if let Some(desc) = self.desc_cache.get((group_id, replica_id)) {
            return Ok(desc);
        }
        let desc = self.provider.replica_descriptor(group_id, replica_id)?;
        desc.validate()?;
        self.desc_cache.add((group_id, replica_id), desc);
        Ok(desc)
    }

    fn cache_replica_descriptor(&mut self, group_id: GroupId, desc: ReplicaDesc) {
        if desc.replica_id == 0 {
            return;
        }
        self.desc_cache.add((group_id, desc.replica_id), desc);
    }

    // ---- group lifecycle ----

    fn create_group(
        &mut self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<(), RaftError> {
        if let Some(g) = self.groups.get(&group_id) {
            if replica_id != 0 && g.replica_id != replica_id {
                return Err(RaftError::Internal(format!(
                    "cannot create group {group_id} with replica id {replica_id}; exists with {}",
                    g.replica_id
                )));
            }
            return Ok(());
        }
        debug!(store = self.cfg.store_id, group = group_id, "creating group");

        let storage = self.provider.group_storage(group_id, replica_id)?;
        let (_, cs) = storage.initial_state()?;

        // Resolve our replica ID from the conf state, which may be stale:
        // an explicitly passed ID is only checked against regression.
        let mut replica_id = replica_id;
        for &voter in &cs.voters {
            let desc = self.replica_descriptor(group_id, voter)?;
            if desc.store_id == self.cfg.store_id {
                if replica_id == 0 {
                    replica_id = desc.replica_id;
                } else if replica_id < desc.replica_id {
                    return Err(RaftError::Internal(format!(
                        "inconsistent replica id: passed {replica_id}, found {} in conf state",
                        desc.replica_id
                    )));
                }
                break;
            }
        }
        if replica_id == 0 {
            return Err(RaftError::Internal(format!(
                "could not find replica id for store {} in group {group_id}",
                self.cfg.store_id
            )));
        }
        self.cache_replica_descriptor(
            group_id,
            ReplicaDesc {
                node_id: self.cfg.node_id,
                store_id: self.cfg.store_id,
                replica_id,
            },
        );

        let applied = self.provider.applied_index(group_id)?;
        let core = RaftCore::new(
            group_id,
            replica_id,
            CoreConfig {
                election_ticks: self.cfg.election_timeout_ticks,
                heartbeat_ticks: self.cfg.heartbeat_interval_ticks,
            },
            storage.clone(),
            applied,
        )?;
        let mut group = Group {
            group_id,
            replica_id,
            core,
            storage,
            committed_term: 0,
            leader: ReplicaDesc::default(),
            pending: HashMap::new(),
            writing: false,
            node_ids: Vec::new(),
            wait_for_callback: 0,
        };

        for &voter in &cs.voters {
            let desc = self.replica_descriptor(group_id, voter)?;
            Self::add_node(&mut self.nodes, desc.node_id, &mut group);
        }

        // A single-voter group hosted here can elect itself immediately.
        if cs.voters.len() == 1 {
            let desc = self.replica_descriptor(group_id, cs.voters[0])?;
            if desc.store_id == self.cfg.store_id {
                info!(group = group_id, "campaigning for single-voter group");
                group.core.campaign();
            }
        }

        self.groups.insert(group_id, group);
        Ok(())
    }

    fn remove_group(&mut self, group_id: GroupId) -> Result<(), RaftError> {
        // Group creation is lazy and idempotent; so is removal.
        let Some(mut g) = self.groups.remove(&group_id) else {
            return Ok(());
        };
        debug!(store = self.cfg.store_id, group = group_id, "removing group");
        for (_, mut p) in g.pending.drain() {
            p.complete(Err(RaftError::GroupDeleted));
        }
        for node_id in g.node_ids {
            if let Some(set) = self.nodes.get_mut(&node_id) {
                set.remove(&group_id);
            }
        }
        Ok(())
    }

    // ---- proposals ----

    fn deliver_proposal(&mut self, group_id: GroupId, mut prop: PendingProposal) {
        let Some(g) = self.groups.get_mut(&group_id) else {
            prop.complete(Err(RaftError::GroupDeleted));
            return;
        };
        if !g.node_ids.contains(&self.cfg.node_id) {
            // Not a member of the group: refuse proposals.
            prop.complete(Err(RaftError::GroupDeleted));
            return;
        }
        if g.wait_for_callback > 0 {
            g.pending.insert(prop.command_id, prop);
            return;
        }
        let command_id = prop.command_id;
        let result = match &prop.kind {
            ProposalKind::Command(data) => {
                let payload = encode_command(command_id, data);
                g.core.propose(payload)
            }
            ProposalKind::ConfChange {
                kind,
                replica,
                payload,
            } => {
                let ctx = ConfChangeContext {
                    command_id,
                    payload: payload.clone(),
                    replica: *replica,
                };
                match bincode::serialize(&ctx) {
                    Ok(encoded) => g.core.propose_conf_change(&ConfChange {
                        kind: *kind,
                        replica_id: replica.replica_id,
                        context: encoded,
                    }),
                    Err(err) => Err(RaftError::Internal(err.to_string())),
                }
            }
        };
        g.pending.insert(command_id, prop);
        if let Err(err) = result {
            // Leaderless groups hold the proposal; it is re-submitted on
            // the next leader event.
            debug!(group = group_id, %command_id, error = %err, "proposal deferred");
        }
    }

    // ---- heartbeats ----

    fn coalesced_heartbeat(&mut self) {
        let remotes: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|&n| n != self.cfg.node_id)
            .collect();
        for node_id in remotes {
            let msg = Message::new(MessageKind::Heartbeat, self.cfg.node_id, node_id, 0);
            self.send_node_message(node_id, msg);
        }
    }

    /// Send a node-addressed message (coalesced heartbeat or response).
    fn send_node_message(&mut self, to_node: NodeId, message: Message) {
        let req = RaftMessageRequest {
            group_id: NO_GROUP,
            // Node-addressed messages do not know the remote store; the
            // store id mirrors the node id by convention.
            to_replica: ReplicaDesc {
                node_id: to_node,
                store_id: to_node,
                replica_id: 0,
            },
            from_replica: ReplicaDesc {
                node_id: self.cfg.node_id,
                store_id: self.cfg.store_id,
                replica_id: 0,
            },
            message,
        };
        if let Err(err) = self.transport.send(req) {
            debug!(to = to_node, error = %err, "coalesced heartbeat send failed");
        }
    }

    /// Expand a coalesced heartbeat into one heartbeat per group led by
    /// the sending node.
    fn fanout_heartbeat(&mut self, req: RaftMessageRequest) {
        let from_node = req.message.from;
        let group_ids: Vec<GroupId> = self
            .nodes
            .get(&from_node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut fanned = 0usize;
        for group_id in &group_ids {
            let Some(g) = self.groups.get(group_id) else {
                continue;
            };
            // Only deliver if we believe the sender leads this group.
            if g.leader.node_id != from_node || from_node == self.cfg.node_id {
                continue;
            }
            let Ok(from_rep) = self
                .provider
                .replica_id_for_store(*group_id, req.from_replica.store_id)
            else {
                continue;
            };
            let Ok(to_rep) = self
                .provider
                .replica_id_for_store(*group_id, self.cfg.store_id)
            else {
                continue;
            };
            let msg = Message::new(MessageKind::Heartbeat, from_rep, to_rep, 0);
            if let Some(g) = self.groups.get_mut(group_id) {
                if let Err(err) = g.core.step(msg) {
                    debug!(group = group_id, error = %err, "heartbeat step failed");
                }
                fanned += 1;
            }
        }
        // Respond whether or not anything was fanned out: a leader does
        // not begin follower recovery until a heartbeat response arrives.
        let resp = Message::new(MessageKind::HeartbeatResp, self.cfg.node_id, from_node, 0);
        self.send_node_message(from_node, resp);
        debug!(
            from = from_node,
            fanned,
            groups = group_ids.len(),
            "coalesced heartbeat fanned out"
        );
    }

    fn fanout_heartbeat_response(&mut self, req: RaftMessageRequest) {
        let from_node = req.message.from;
        let Some(group_ids) = self.nodes.get(&from_node) else {
            warn!(from = from_node, "heartbeat response from unknown node");
            return;
        };
        let group_ids: Vec<GroupId> = group_ids.iter().copied().collect();
        for group_id in group_ids {
            let Some(g) = self.groups.get(&group_id) else {
                continue;
            };
            // Only deliver if the local replica leads this group.
            if g.leader.node_id != self.cfg.node_id || from_node == self.cfg.node_id {
                continue;
            }
            let Ok(from_rep) = self
                .provider
                .replica_id_for_store(group_id, req.from_replica.store_id)
            else {
                continue;
            };
            let Ok(to_rep) = self
                .provider
                .replica_id_for_store(group_id, self.cfg.store_id)
            else {
                continue;
            };
            let msg = Message::new(MessageKind::HeartbeatResp, from_rep, to_rep, 0);
            if let Some(g) = self.groups.get_mut(&group_id) {
                if let Err(err) = g.core.step(msg) {
                    debug!(group = group_id, error = %err, "heartbeat response step failed");
                }
            }
        }
    }

    // ---- inbound messages ----

    fn handle_message(&mut self, req: RaftMessageRequest) {
        match req.message.kind {
            MessageKind::Heartbeat if req.group_id == NO_GROUP => {
                self.fanout_heartbeat(req);
                return;
            }
            MessageKind::HeartbeatResp if req.group_id == NO_GROUP => {
                self.fanout_heartbeat_response(req);
                return;
            }
            MessageKind::Snap => {
                if let Some(snap) = &req.message.snapshot {
                    if !self.provider.can_apply_snapshot(req.group_id, snap) {
                        // Dropping here is cheaper than unwinding a
                        // half-stepped snapshot.
                        debug!(group = req.group_id, "snapshot refused by storage");
                        return;
                    }
                }
            }
            _ => {}
        }

        self.cache_replica_descriptor(req.group_id, req.from_replica);
        self.cache_replica_descriptor(req.group_id, req.to_replica);

        let existing = self.groups.get(&req.group_id).map(|g| g.replica_id);
        match existing {
            Some(have) if have > req.to_replica.replica_id => {
                warn!(
                    group = req.group_id,
                    got = req.to_replica.replica_id,
                    have,
                    "dropping message with stale replica id"
                );
                return;
            }
            Some(have) if have < req.to_replica.replica_id => {
                // This store was removed from the group and re-added
                // before GC caught up; reincarnate the group.
                info!(
                    group = req.group_id,
                    old = have,
                    new = req.to_replica.replica_id,
                    "recreating group for newer replica id"
                );
                if let Err(err) = self.remove_group(req.group_id) {
                    warn!(group = req.group_id, error = %err, "removing group for reincarnation failed");
                    return;
                }
                if let Err(err) = self.create_group(req.group_id, req.to_replica.replica_id) {
                    warn!(group = req.group_id, error = %err, "recreating group failed");
                    return;
                }
            }
            Some(_) => {}
            None => {
                if let Err(err) = self.create_group(req.group_id, req.to_replica.replica_id) {
                    warn!(group = req.group_id, error = %err, "creating group for message failed");
                    return;
                }
            }
        }

        if let Some(g) = self.groups.get_mut(&req.group_id) {
            if let Err(err) = g.core.step(req.message) {
                debug!(group = req.group_id, error = %err, "message step failed");
            }
        }
    }

    // ---- ready pipeline ----

    async fn process_ready(&mut self) {
        loop {
            let ids: Vec<GroupId> = self.groups.keys().copied().collect();
            let mut batch: Vec<(GroupId, Ready)> = Vec::new();
            let mut writes: Vec<(GroupId, GroupWrite)> = Vec::new();
            for group_id in ids {
                let Some(g) = self.groups.get_mut(&group_id) else {
                    continue;
                };
                if g.writing || !g.core.has_ready() {
                    continue;
                }
                let rd = g.core.ready();
                g.writing = true;
                writes.push((
                    group_id,
                    GroupWrite {
                        storage: g.storage.clone(),
                        hard_state: rd.hard_state,
                        snapshot: rd.snapshot.clone(),
                        entries: rd.entries.clone(),
                    },
                ));
                batch.push((group_id, rd));
            }
            if batch.is_empty() {
                return;
            }

            let (done, done_rx) = oneshot::channel();
            if self
                .write_tx
                .send(WriteRequest {
                    groups: writes,
                    done,
                })
                .is_err()
            {
                error!("raft write thread unavailable");
                return;
            }
            match done_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // A failed write leaves the batch half-applied; there
                    // is no recovery short of restarting the store.
                    panic!("raft storage write failed: {err:#}");
                }
                Err(_) => {
                    error!("raft write thread dropped its ack");
                    return;
                }
            }

            for (group_id, rd) in batch {
                self.handle_write_response(group_id, rd);
            }
        }
    }

    fn handle_write_response(&mut self, group_id: GroupId, rd: Ready) {
        let Some(mut g) = self.groups.remove(&group_id) else {
            debug!(group = group_id, "dropping stale write response");
            return;
        };
        if !g.writing {
            // The group was removed and recreated while the write was in
            // flight; the fresh incarnation must not see this ack.
            debug!(group = group_id, "dropping write response for reincarnated group");
            self.groups.insert(group_id, g);
            return;
        }
        g.writing = false;

        for entry in &rd.committed_entries {
            self.process_committed_entry(group_id, &mut g, entry);
        }

        if let Some(snap) = &rd.snapshot {
            match self.provider.replicas_from_snapshot(snap) {
                Ok(replicas) => {
                    for rep in replicas {
                        Self::add_node(&mut self.nodes, rep.node_id, &mut g);
                    }
                }
                Err(err) => {
                    error!(group = group_id, error = %err, "parsing snapshot membership failed");
                }
            }
        }

        let reproposals = self.maybe_send_leader_event(group_id, &mut g, &rd);

        for msg in &rd.messages {
            match msg.kind {
                // Individual heartbeats are replaced by the coalesced
                // per-node heartbeat.
                MessageKind::Heartbeat | MessageKind::HeartbeatResp => {}
                _ => self.send_group_message(&mut g, msg.clone()),
            }
        }

        g.core.advance(&rd);
        self.groups.insert(group_id, g);

        for prop in reproposals {
            self.deliver_proposal(group_id, prop);
        }
    }

    fn process_committed_entry(&mut self, group_id: GroupId, g: &mut Group, entry: &Entry) {
        match entry.kind {
            EntryKind::Normal => {
                // Empty entries are election markers; skip them.
                if entry.data.is_empty() {
                    return;
                }
                let (command_id, command) = match decode_command(&entry.data) {
                    Ok(parts) => parts,
                    Err(err) => {
                        // A committed entry this node cannot decode can
                        // never be applied consistently anywhere.
                        panic!("undecodable committed raft entry at index {}: {err:#}", entry.index);
                    }
                };
                if let Some(mut p) = g.pending.remove(&command_id) {
                    p.complete(Ok(()));
                }
                let _ = self.events.send(Event::CommandCommitted {
                    group_id,
                    command_id,
                    command: command.to_vec(),
                    index: entry.index,
                });
            }
            EntryKind::ConfChange => {
                let cc: ConfChange = match bincode::deserialize(&entry.data) {
                    Ok(cc) => cc,
                    Err(err) => {
                        panic!("undecodable committed conf change at index {}: {err}", entry.index);
                    }
                };
                let mut command_id = CommandId([0; 16]);
                let mut payload = Vec::new();
                if !cc.context.is_empty() {
                    match bincode::deserialize::<ConfChangeContext>(&cc.context) {
                        Ok(ctx) => {
                            command_id = ctx.command_id;
                            payload = ctx.payload;
                            self.cache_replica_descriptor(group_id, ctx.replica);
                        }
                        Err(err) => {
                            panic!("undecodable conf change context at index {}: {err}", entry.index);
                        }
                    }
                }
                let replica = match self.replica_descriptor(group_id, cc.replica_id) {
                    Ok(desc) => desc,
                    Err(err) => {
                        // Committed config changes must be applied; without
                        // the descriptor the group cannot make progress.
                        panic!(
                            "no replica descriptor for committed conf change (group {group_id}, replica {}): {err}",
                            cc.replica_id
                        );
                    }
                };
                if let Some(mut p) = g.pending.remove(&command_id) {
                    p.complete(Ok(()));
                }
                g.wait_for_callback += 1;
                let callback = ConfChangeCallback {
                    group_id,
                    cc,
                    replica,
                    ops: self.ops.clone(),
                };
                let kind = callback.cc.kind;
                let _ = self.events.send(Event::MembershipChangeCommitted {
                    group_id,
                    command_id,
                    index: entry.index,
                    replica,
                    kind,
                    payload,
                    callback,
                });
            }
        }
    }

    fn conf_change_done(
        &mut self,
        group_id: GroupId,
        cc: ConfChange,
        replica: ReplicaDesc,
        error: Option<String>,
    ) {
        let Some(mut g) = self.groups.remove(&group_id) else {
            return;
        };
        match error {
            None => {
                debug!(group = group_id, replica = replica.replica_id, "applying membership change");
                g.core.apply_conf_change(&cc);
                match cc.kind {
                    ConfChangeKind::AddReplica => {
                        Self::add_node(&mut self.nodes, replica.node_id, &mut g);
                    }
                    ConfChangeKind::RemoveReplica => {
                        Self::remove_node(&mut self.nodes, replica.node_id, &mut g);
                        if replica.store_id == self.cfg.store_id {
                            for (_, mut p) in g.pending.drain() {
                                p.complete(Err(RaftError::GroupDeleted));
                            }
                        }
                    }
                }
            }
            Some(msg) => {
                warn!(group = group_id, error = %msg, "membership change aborted");
            }
        }
        g.wait_for_callback = g.wait_for_callback.saturating_sub(1);
        let reproposals: Vec<PendingProposal> = if g.wait_for_callback == 0 {
            g.pending.drain().map(|(_, p)| p).collect()
        } else {
            Vec::new()
        };
        self.groups.insert(group_id, g);
        for prop in reproposals {
            self.deliver_proposal(group_id, prop);
        }
    }

    /// Emit a leader-election event when the committed term advances, and
    /// collect pending proposals for re-submission.
    fn maybe_send_leader_event(
        &mut self,
        group_id: GroupId,
        g: &mut Group,
        rd: &Ready,
    ) -> Vec<PendingProposal> {
        let mut term = g.committed_term;
        if let Some(ss) = rd.soft_state {
            if ss.leader != g.leader.replica_id {
                if ss.leader == 0 {
                    g.leader = ReplicaDesc::default();
                } else {
                    g.leader = self
                        .replica_descriptor(group_id, ss.leader)
                        .unwrap_or_default();
                }
            }
        }
        if let Some(last) = rd.committed_entries.last() {
            term = last.term;
        }
        if term != g.committed_term && g.leader.replica_id != 0 {
            g.committed_term = term;
            let _ = self.events.send(Event::LeaderElection {
                group_id,
                replica_id: g.leader.replica_id,
                term,
            });
            return g.pending.drain().map(|(_, p)| p).collect();
        }
        Vec::new()
    }

    fn send_group_message(&mut self, g: &mut Group, msg: Message) {
        let group_id = g.group_id;
        let to = match self.replica_descriptor(group_id, msg.to) {
            Ok(desc) => desc,
            Err(err) => {
                warn!(group = group_id, to = msg.to, error = %err, "recipient replica lookup failed");
                return;
            }
        };
        let from = match self.replica_descriptor(group_id, msg.from) {
            Ok(desc) => desc,
            Err(err) => {
                warn!(group = group_id, from = msg.from, error = %err, "sender replica lookup failed");
                return;
            }
        };
        if !self.nodes.contains_key(&to.node_id) {
            Self::add_node(&mut self.nodes, to.node_id, g);
        }
        let to_replica_id = msg.to;
        let is_snap = msg.kind == MessageKind::Snap;
        let req = RaftMessageRequest {
            group_id,
            to_replica: to,
            from_replica: from,
            message: msg,
        };
        if let Err(err) = self.transport.send(req) {
            warn!(group = group_id, to = to_replica_id, error = %err, "message send failed");
            g.core.report_unreachable(to_replica_id);
            if is_snap {
                g.core.report_snapshot_failure(to_replica_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemGroupStorage;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Provider for tests where replica, store, and node IDs coincide.
    struct MemProvider {
        storages: Mutex<HashMap<GroupId, Arc<MemGroupStorage>>>,
        voters: Vec<ReplicaId>,
    }

    impl MemProvider {
        fn new(group_id: GroupId, voters: Vec<ReplicaId>) -> Self {
            let mut storages = HashMap::new();
            storages.insert(
                group_id,
                Arc::new(MemGroupStorage::initialized(voters.clone())),
            );
            Self {
                storages: Mutex::new(storages),
                voters,
            }
        }
    }

    impl StorageProvider for MemProvider {
        fn group_storage(
            &self,
            group_id: GroupId,
            _replica_id: ReplicaId,
        ) -> Result<Arc<dyn GroupStorage>, RaftError> {
            let mut storages = self.storages.lock().expect("storages lock");
            let storage = storages
                .entry(group_id)
                .or_insert_with(|| Arc::new(MemGroupStorage::uninitialized()));
            Ok(storage.clone())
        }

        fn replica_descriptor(
            &self,
            _group_id: GroupId,
            replica_id: ReplicaId,
        ) -> Result<ReplicaDesc, RaftError> {
            Ok(ReplicaDesc {
                node_id: replica_id,
                store_id: replica_id,
                replica_id,
            })
        }

        fn replica_id_for_store(
            &self,
            _group_id: GroupId,
            store_id: StoreId,
        ) -> Result<ReplicaId, RaftError> {
            if self.voters.contains(&store_id) {
                Ok(store_id)
            } else {
                Err(RaftError::GroupNotFound(0))
            }
        }

        fn replicas_from_snapshot(
            &self,
            snap: &Snapshot,
        ) -> Result<Vec<ReplicaDesc>, RaftError> {
            Ok(snap
                .metadata
                .conf_state
                .voters
                .iter()
                .map(|&v| ReplicaDesc {
                    node_id: v,
                    store_id: v,
                    replica_id: v,
                })
                .collect())
        }

        fn can_apply_snapshot(&self, _group_id: GroupId, _snap: &Snapshot) -> bool {
            true
        }

        fn applied_index(&self, group_id: GroupId) -> Result<u64, RaftError> {
            let storages = self.storages.lock().expect("storages lock");
            match storages.get(&group_id) {
                Some(s) => Ok(s.first_index()? - 1),
                None => Ok(0),
            }
        }
    }

    fn config(node: u64) -> MultiRaftConfig {
        MultiRaftConfig {
            node_id: node,
            store_id: node,
            tick_interval: Duration::from_millis(5),
            election_timeout_ticks: 6,
            heartbeat_interval_ticks: 2,
        }
    }

    #[tokio::test]
    async fn single_node_command_commits() {
        const GROUP: GroupId = 7;
        let provider = Arc::new(MemProvider::new(GROUP, vec![1]));
        let transport = Arc::new(crate::transport::LocalTransport::new());
        let (mr, mut events, _task) =
            MultiRaft::start(config(1), provider, transport).expect("start");

        mr.create_group(GROUP, 0).await.expect("create group");
        let id = CommandId::random();
        let committed = mr.submit_command(GROUP, id, b"write".to_vec());

        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, committed)
            .await
            .expect("commit timeout")
            .expect("channel")
            .expect("commit result");

        // The committed command must also surface as an event.
        let mut seen = false;
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Some(Event::CommandCommitted {
                    group_id,
                    command_id,
                    command,
                    ..
                })) => {
                    if group_id == GROUP && command_id == id && command == b"write" {
                        seen = true;
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        assert!(seen, "expected a CommandCommitted event");
        mr.stop();
    }

    #[tokio::test]
    async fn proposals_fail_after_group_removal() {
        const GROUP: GroupId = 7;
        let provider = Arc::new(MemProvider::new(GROUP, vec![1]));
        let transport = Arc::new(crate::transport::LocalTransport::new());
        let (mr, _events, _task) =
            MultiRaft::start(config(1), provider, transport).expect("start");

        mr.create_group(GROUP, 0).await.expect("create group");
        mr.remove_group(GROUP).await.expect("remove group");
        let res = mr
            .submit_command(GROUP, CommandId::random(), b"late".to_vec())
            .await
            .expect("channel");
        assert!(matches!(res, Err(RaftError::GroupDeleted)));
        mr.stop();
    }

    #[tokio::test]
    async fn two_nodes_replicate_a_command() {
        const GROUP: GroupId = 9;
        let transport = Arc::new(crate::transport::LocalTransport::new());
        let provider1 = Arc::new(MemProvider::new(GROUP, vec![1, 2]));
        let provider2 = Arc::new(MemProvider::new(GROUP, vec![1, 2]));

        let (mr1, mut ev1, _t1) =
            MultiRaft::start(config(1), provider1, transport.clone()).expect("start node 1");
        let (mr2, mut ev2, _t2) =
            MultiRaft::start(config(2), provider2, transport.clone()).expect("start node 2");

        // Wire inbound routing for both stores.
        for (store, mr) in [(1u64, mr1.clone()), (2u64, mr2.clone())] {
            let (tx, mut rx) = mpsc::unbounded_channel::<RaftMessageRequest>();
            transport.register(store, tx);
            let mr = mr.clone();
            tokio::spawn(async move {
                while let Some(req) = rx.recv().await {
                    if mr.handle_raft_message(req).is_err() {
                        break;
                    }
                }
            });
        }

        mr1.create_group(GROUP, 0).await.expect("create on 1");
        mr2.create_group(GROUP, 0).await.expect("create on 2");

        // Wait for an election, then propose on whichever node leads.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut leader = None;
        while Instant::now() < deadline && leader.is_none() {
            for (idx, mr) in [(1u64, &mr1), (2u64, &mr2)] {
                if let Some(status) = mr.status(GROUP).await {
                    if status.role == crate::types::Role::Leader {
                        leader = Some(idx);
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leader = leader.expect("a leader should be elected");
        let mr_leader = if leader == 1 { &mr1 } else { &mr2 };

        let id = CommandId::random();
        let commit = mr_leader.submit_command(GROUP, id, b"replicated".to_vec());
        tokio::time::timeout(Duration::from_secs(10), commit)
            .await
            .expect("commit timeout")
            .expect("channel")
            .expect("commit");

        // Both nodes must observe the committed command.
        for events in [&mut ev1, &mut ev2] {
            let mut seen = false;
            let until = Instant::now() + Duration::from_secs(10);
            while Instant::now() < until {
                match tokio::time::timeout(Duration::from_millis(250), events.recv()).await {
                    Ok(Some(Event::CommandCommitted { command, .. })) => {
                        if command == b"replicated" {
                            seen = true;
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            assert!(seen, "both nodes must apply the command");
        }

        mr1.stop();
        mr2.stop();
    }
}
