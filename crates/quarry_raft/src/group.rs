//! Single-group consensus core.
//!
//! The core is a pure state machine owned by the runtime loop: inputs
//! arrive through `step`/`tick`/`propose`, outputs leave through
//! `ready`/`advance`. Durability is the caller's job; the core assumes
//! that between `ready()` and `advance()` no other input is delivered,
//! which the runtime guarantees by blocking the loop on the write task.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::storage::GroupStorage;
use crate::types::{
    ConfChange, ConfChangeKind, ConfState, Entry, EntryKind, GroupId, HardState, Message,
    MessageKind, Ready, ReplicaId, Role, Snapshot, SoftState,
};
use crate::RaftError;

/// Cap on entries shipped in one append message.
const MAX_ENTRIES_PER_APPEND: u64 = 128;

#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    pub election_ticks: usize,
    pub heartbeat_ticks: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    matched: u64,
    next: u64,
    pending_snapshot: bool,
}

/// Point-in-time view of a group, for introspection and tests.
#[derive(Clone, Debug)]
pub struct GroupStatus {
    pub id: ReplicaId,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub role: Role,
    pub leader: ReplicaId,
    pub voters: Vec<ReplicaId>,
}

pub struct RaftCore {
    group_id: GroupId,
    id: ReplicaId,
    cfg: CoreConfig,
    storage: Arc<dyn GroupStorage>,

    term: u64,
    vote: ReplicaId,
    commit: u64,
    applied: u64,
    role: Role,
    leader: ReplicaId,
    voters: Vec<ReplicaId>,
    votes: HashMap<ReplicaId, bool>,
    progress: HashMap<ReplicaId, Progress>,

    // Log position. `stable_index` is the highest index known persisted;
    // `unstable` holds entries accepted but not yet handed to the write
    // task. `last_index`/`last_term` cover both.
    stable_index: u64,
    unstable: Vec<Entry>,
    last_index: u64,
    last_term: u64,
    pending_snapshot: Option<Snapshot>,

    msgs: Vec<Message>,
    prev_hard: HardState,
    prev_soft: Option<SoftState>,

    election_elapsed: usize,
    heartbeat_elapsed: usize,
    randomized_election: usize,
}

impl RaftCore {
    pub fn new(
        group_id: GroupId,
        id: ReplicaId,
        cfg: CoreConfig,
        storage: Arc<dyn GroupStorage>,
        applied: u64,
    ) -> Result<Self, RaftError> {
        let (hs, cs) = storage.initial_state()?;
        let last_index = storage.last_index()?;
        let last_term = if last_index == 0 {
            0
        } else {
            storage.term(last_index).unwrap_or(0)
        };
        let mut core = Self {
            group_id,
            id,
            cfg,
            storage,
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
            applied: applied.max(0),
            role: Role::Follower,
            leader: 0,
            voters: cs.voters,
            votes: HashMap::new(),
            progress: HashMap::new(),
            stable_index: last_index,
            unstable: Vec::new(),
            last_index,
            last_term,
            pending_snapshot: None,
            msgs: Vec::new(),
            prev_hard: hs,
            prev_soft: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election: 0,
        };
        core.reset_randomized_election();
        Ok(core)
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> ReplicaId {
        self.leader
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn voters(&self) -> &[ReplicaId] {
        &self.voters
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            id: self.id,
            term: self.term,
            commit: self.commit,
            applied: self.applied,
            role: self.role,
            leader: self.leader,
            voters: self.voters.clone(),
        }
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn reset_randomized_election(&mut self) {
        let et = self.cfg.election_ticks.max(1);
        self.randomized_election = rand::thread_rng().gen_range(et..2 * et);
    }

    /// Term of entry `i`, consulting the unstable tail, a pending
    /// snapshot boundary, and storage in that order.
    fn term_of(&self, i: u64) -> Option<u64> {
        if i == 0 {
            return Some(0);
        }
        if i > self.last_index {
            return None;
        }
        if let Some(snap) = &self.pending_snapshot {
            if i == snap.metadata.index {
                return Some(snap.metadata.term);
            }
            if i < snap.metadata.index {
                return None;
            }
        }
        if let Some(first) = self.unstable.first() {
            if i >= first.index {
                let off = (i - first.index) as usize;
                return self.unstable.get(off).map(|e| e.term);
            }
        }
        self.storage.term(i).ok()
    }

    /// Entries in `[lo, hi)`, stitched from storage and the unstable tail.
    fn log_slice(&self, lo: u64, hi: u64) -> Result<Vec<Entry>, RaftError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let stable_hi = hi.min(self.stable_index + 1);
        if lo < stable_hi {
            out.extend(self.storage.entries(lo, stable_hi, 0)?);
        }
        if let Some(first) = self.unstable.first() {
            let ulo = lo.max(first.index);
            for ent in &self.unstable {
                if ent.index >= ulo && ent.index < hi {
                    out.push(ent.clone());
                }
            }
        }
        if out.len() as u64 != hi - lo {
            return Err(RaftError::Unavailable);
        }
        Ok(out)
    }

    fn truncate_from(&mut self, index: u64) {
        self.unstable.retain(|e| e.index < index);
        if self.stable_index >= index {
            self.stable_index = index - 1;
        }
        self.last_index = index - 1;
        self.last_term = self.term_of(self.last_index).unwrap_or(0);
    }

    fn append_entry(&mut self, ent: Entry) {
        self.last_index = ent.index;
        self.last_term = ent.term;
        self.unstable.push(ent);
    }

    fn send(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    // ---- role transitions ----

    fn become_follower(&mut self, term: u64, leader: ReplicaId) {
        if term > self.term {
            self.term = term;
            self.vote = 0;
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.progress.clear();
        self.election_elapsed = 0;
        self.reset_randomized_election();
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = self.id;
        self.heartbeat_elapsed = 0;
        self.progress.clear();
        for &v in &self.voters {
            self.progress.insert(
                v,
                Progress {
                    matched: if v == self.id { self.last_index } else { 0 },
                    next: self.last_index + 1,
                    pending_snapshot: false,
                },
            );
        }
        debug!(group = self.group_id, replica = self.id, term = self.term, "became leader");
        // An empty entry at the new term commits everything before it.
        let ent = Entry::new(self.last_index + 1, self.term, EntryKind::Normal, Vec::new());
        self.append_entry(ent);
        self.bcast_append();
    }

    /// Start an election. Called on election timeout and explicitly for
    /// freshly created single-voter groups.
    pub fn campaign(&mut self) {
        if !self.voters.contains(&self.id) {
            return;
        }
        self.role = Role::Candidate;
        self.term += 1;
        self.vote = self.id;
        self.leader = 0;
        self.votes.clear();
        self.votes.insert(self.id, true);
        self.election_elapsed = 0;
        self.reset_randomized_election();
        if self.quorum() == 1 {
            self.become_leader();
            return;
        }
        for &v in self.voters.clone().iter() {
            if v == self.id {
                continue;
            }
            let mut m = Message::new(MessageKind::Vote, self.id, v, self.term);
            m.index = self.last_index;
            m.log_term = self.last_term;
            self.send(m);
        }
    }

    // ---- input ----

    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.cfg.heartbeat_ticks.max(1) {
                    self.heartbeat_elapsed = 0;
                    self.bcast_heartbeat();
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election {
                    self.election_elapsed = 0;
                    self.campaign();
                }
            }
        }
    }

    /// Propose a command. Followers forward to the known leader; with no
    /// leader the proposal fails and the runtime re-submits it after the
    /// next election.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(), RaftError> {
        self.propose_entry(EntryKind::Normal, data)
    }

    pub fn propose_conf_change(&mut self, cc: &ConfChange) -> Result<(), RaftError> {
        let data = bincode::serialize(cc).map_err(|e| RaftError::Internal(e.to_string()))?;
        self.propose_entry(EntryKind::ConfChange, data)
    }

    fn propose_entry(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<(), RaftError> {
        match self.role {
            Role::Leader => {
                let ent = Entry::new(self.last_index + 1, self.term, kind, data);
                self.append_entry(ent);
                if let Some(pr) = self.progress.get_mut(&self.id) {
                    pr.next = self.last_index + 1;
                }
                if self.quorum() == 1 {
                    // Single voter: nothing to replicate, commit advances
                    // once the entry is persisted.
                } else {
                    self.bcast_append();
                }
                Ok(())
            }
            _ if self.leader != 0 => {
                let mut m = Message::new(MessageKind::Propose, self.id, self.leader, self.term);
                m.entries.push(Entry::new(0, 0, kind, data));
                self.send(m);
                Ok(())
            }
            _ => Err(RaftError::NoLeader(self.group_id)),
        }
    }

    pub fn step(&mut self, m: Message) -> Result<(), RaftError> {
        if m.term == 0 {
            // Coalesced heartbeats carry no term; they bypass term checks.
            if !matches!(m.kind, MessageKind::Heartbeat | MessageKind::HeartbeatResp) {
                return Ok(());
            }
        } else if m.term > self.term {
            let leader = match m.kind {
                MessageKind::Append | MessageKind::Heartbeat | MessageKind::Snap => m.from,
                _ => 0,
            };
            self.become_follower(m.term, leader);
        } else if m.term < self.term {
            if m.kind == MessageKind::Vote {
                let mut resp = Message::new(MessageKind::VoteResp, self.id, m.from, self.term);
                resp.reject = true;
                self.send(resp);
            }
            return Ok(());
        }

        match m.kind {
            MessageKind::Vote => self.handle_vote(m),
            MessageKind::VoteResp => self.handle_vote_resp(m),
            MessageKind::Append => self.handle_append(m),
            MessageKind::AppendResp => self.handle_append_resp(m),
            MessageKind::Heartbeat => self.handle_heartbeat(m),
            MessageKind::HeartbeatResp => self.handle_heartbeat_resp(m),
            MessageKind::Snap => self.handle_snap(m),
            MessageKind::Propose => self.handle_propose(m),
        }
        Ok(())
    }

    // ---- message handlers ----

    fn handle_vote(&mut self, m: Message) {
        let can_vote = self.vote == m.from || (self.vote == 0 && self.leader == 0);
        let up_to_date = m.log_term > self.last_term
            || (m.log_term == self.last_term && m.index >= self.last_index);
        let mut resp = Message::new(MessageKind::VoteResp, self.id, m.from, self.term);
        if can_vote && up_to_date {
            self.vote = m.from;
            self.election_elapsed = 0;
        } else {
            resp.reject = true;
        }
        self.send(resp);
    }

    fn handle_vote_resp(&mut self, m: Message) {
        if self.role != Role::Candidate {
            return;
        }
        self.votes.insert(m.from, !m.reject);
        let granted = self.votes.values().filter(|v| **v).count();
        let rejected = self.votes.values().filter(|v| !**v).count();
        if granted >= self.quorum() {
            self.become_leader();
        } else if rejected >= self.quorum() {
            self.become_follower(self.term, 0);
        }
    }

    fn handle_append(&mut self, m: Message) {
        self.election_elapsed = 0;
        if self.role != Role::Follower {
            self.become_follower(self.term, m.from);
        }
        self.leader = m.from;

        let mut resp = Message::new(MessageKind::AppendResp, self.id, m.from, self.term);
        match self.term_of(m.index) {
            Some(t) if t == m.log_term => {
                let last_new = m.index + m.entries.len() as u64;
                for (i, ent) in m.entries.iter().enumerate() {
                    match self.term_of(ent.index) {
                        Some(t) if t == ent.term => continue,
                        _ => {
                            self.truncate_from(ent.index);
                            for e in &m.entries[i..] {
                                self.append_entry(e.clone());
                            }
                            break;
                        }
                    }
                }
                if m.commit > self.commit {
                    self.commit = m.commit.min(last_new);
                }
                resp.index = last_new;
            }
            _ => {
                resp.reject = true;
                resp.index = m.index;
                resp.reject_hint = self.last_index;
            }
        }
        self.send(resp);
    }

    fn handle_append_resp(&mut self, m: Message) {
        if self.role != Role::Leader {
            return;
        }
        let Some(pr) = self.progress.get_mut(&m.from) else {
            return;
        };
        pr.pending_snapshot = false;
        if m.reject {
            pr.next = m.index.min(m.reject_hint + 1).max(1);
            self.maybe_send_append(m.from);
            return;
        }
        if m.index > pr.matched {
            pr.matched = m.index;
        }
        if m.index + 1 > pr.next {
            pr.next = m.index + 1;
        }
        if self.maybe_commit() {
            self.bcast_append();
        } else if self.progress.get(&m.from).map(|p| p.next <= self.last_index) == Some(true) {
            self.maybe_send_append(m.from);
        }
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.election_elapsed = 0;
        if self.role != Role::Follower && m.term >= self.term && m.term != 0 {
            self.become_follower(m.term, m.from);
        }
        if m.term != 0 {
            self.leader = m.from;
        }
        if m.commit > self.commit {
            self.commit = m.commit.min(self.last_index);
        }
        let resp = Message::new(MessageKind::HeartbeatResp, self.id, m.from, self.term);
        self.send(resp);
    }

    fn handle_heartbeat_resp(&mut self, m: Message) {
        if self.role != Role::Leader {
            return;
        }
        let behind = self
            .progress
            .get(&m.from)
            .map(|pr| pr.matched < self.last_index)
            .unwrap_or(false);
        if behind {
            self.maybe_send_append(m.from);
        }
    }

    fn handle_snap(&mut self, m: Message) {
        self.election_elapsed = 0;
        self.leader = m.from;
        let Some(snap) = m.snapshot else {
            return;
        };
        let mut resp = Message::new(MessageKind::AppendResp, self.id, m.from, self.term);
        if snap.metadata.index <= self.commit {
            resp.index = self.commit;
            self.send(resp);
            return;
        }
        debug!(
            group = self.group_id,
            replica = self.id,
            index = snap.metadata.index,
            "restoring from snapshot"
        );
        self.last_index = snap.metadata.index;
        self.last_term = snap.metadata.term;
        self.stable_index = snap.metadata.index;
        self.unstable.clear();
        self.commit = snap.metadata.index;
        self.voters = snap.metadata.conf_state.voters.clone();
        resp.index = snap.metadata.index;
        self.pending_snapshot = Some(snap);
        self.send(resp);
    }

    fn handle_propose(&mut self, m: Message) {
        if self.role != Role::Leader {
            // Not the leader anymore; the proposer will retry after the
            // next leader event.
            return;
        }
        for ent in m.entries {
            let _ = self.propose_entry(ent.kind, ent.data);
        }
    }

    // ---- leader replication ----

    fn bcast_append(&mut self) {
        for v in self.voters.clone() {
            if v != self.id {
                self.maybe_send_append(v);
            }
        }
    }

    fn bcast_heartbeat(&mut self) {
        for v in self.voters.clone() {
            if v == self.id {
                continue;
            }
            let commit = self
                .progress
                .get(&v)
                .map(|p| p.matched.min(self.commit))
                .unwrap_or(0);
            let mut m = Message::new(MessageKind::Heartbeat, self.id, v, self.term);
            m.commit = commit;
            self.send(m);
        }
    }

    fn maybe_send_append(&mut self, to: ReplicaId) {
        let Some(pr) = self.progress.get(&to).copied() else {
            return;
        };
        if pr.pending_snapshot {
            return;
        }
        let prev = pr.next - 1;
        let prev_term = self.term_of(prev);
        let hi = self.last_index.min(pr.next + MAX_ENTRIES_PER_APPEND - 1) + 1;
        let ents = self.log_slice(pr.next, hi);
        match (prev_term, ents) {
            (Some(lt), Ok(entries)) => {
                let mut m = Message::new(MessageKind::Append, self.id, to, self.term);
                m.index = prev;
                m.log_term = lt;
                m.commit = self.commit;
                m.entries = entries;
                self.send(m);
            }
            _ => {
                // The follower is behind the compacted prefix; ship a
                // snapshot instead.
                match self.storage.snapshot() {
                    Ok(snap) => {
                        if let Some(pr) = self.progress.get_mut(&to) {
                            pr.pending_snapshot = true;
                        }
                        let mut m = Message::new(MessageKind::Snap, self.id, to, self.term);
                        m.snapshot = Some(snap);
                        self.send(m);
                    }
                    Err(err) => {
                        warn!(group = self.group_id, to, error = %err, "snapshot for lagging follower failed");
                    }
                }
            }
        }
    }

    fn maybe_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let mut matches: Vec<u64> = self.progress.values().map(|p| p.matched).collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let Some(&candidate) = matches.get(self.quorum() - 1) else {
            return false;
        };
        if candidate > self.commit && self.term_of(candidate) == Some(self.term) {
            self.commit = candidate;
            return true;
        }
        false
    }

    pub fn report_unreachable(&mut self, id: ReplicaId) {
        if let Some(pr) = self.progress.get_mut(&id) {
            pr.next = pr.matched + 1;
        }
    }

    pub fn report_snapshot_failure(&mut self, id: ReplicaId) {
        if let Some(pr) = self.progress.get_mut(&id) {
            pr.pending_snapshot = false;
        }
    }

    /// Apply a committed membership change to the voter set.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> ConfState {
        match cc.kind {
            ConfChangeKind::AddReplica => {
                if !self.voters.contains(&cc.replica_id) {
                    self.voters.push(cc.replica_id);
                    if self.role == Role::Leader {
                        self.progress.insert(
                            cc.replica_id,
                            Progress {
                                matched: 0,
                                next: self.last_index + 1,
                                pending_snapshot: false,
                            },
                        );
                    }
                }
            }
            ConfChangeKind::RemoveReplica => {
                self.voters.retain(|&v| v != cc.replica_id);
                self.progress.remove(&cc.replica_id);
                self.votes.remove(&cc.replica_id);
                if self.role == Role::Leader && self.maybe_commit() {
                    self.bcast_append();
                }
            }
        }
        ConfState {
            voters: self.voters.clone(),
        }
    }

    // ---- output ----

    pub fn has_ready(&self) -> bool {
        if !self.msgs.is_empty() || !self.unstable.is_empty() || self.pending_snapshot.is_some() {
            return true;
        }
        let hs = HardState {
            term: self.term,
            vote: self.vote,
            commit: self.commit,
        };
        if hs != self.prev_hard {
            return true;
        }
        let ss = SoftState {
            leader: self.leader,
            role: self.role,
        };
        if Some(ss) != self.prev_soft {
            return true;
        }
        self.commit.min(self.stable_index) > self.applied
    }

    pub fn ready(&mut self) -> Ready {
        let mut rd = Ready::default();
        let ss = SoftState {
            leader: self.leader,
            role: self.role,
        };
        if Some(ss) != self.prev_soft {
            self.prev_soft = Some(ss);
            rd.soft_state = Some(ss);
        }
        let hs = HardState {
            term: self.term,
            vote: self.vote,
            commit: self.commit,
        };
        if hs != self.prev_hard {
            rd.hard_state = Some(hs);
        }
        rd.entries = self.unstable.clone();
        rd.snapshot = self.pending_snapshot.clone();
        if self.pending_snapshot.is_none() {
            let lo = self.applied + 1;
            let hi = self.commit.min(self.stable_index) + 1;
            if lo < hi {
                match self.log_slice(lo, hi) {
                    Ok(ents) => rd.committed_entries = ents,
                    Err(err) => {
                        warn!(group = self.group_id, error = %err, "reading committed entries failed");
                    }
                }
            }
        }
        rd.messages = std::mem::take(&mut self.msgs);
        rd
    }

    /// Acknowledge that everything in `rd` has been persisted, applied,
    /// and sent.
    pub fn advance(&mut self, rd: &Ready) {
        if let Some(hs) = rd.hard_state {
            self.prev_hard = hs;
        }
        if let Some(snap) = &rd.snapshot {
            self.applied = self.applied.max(snap.metadata.index);
            self.pending_snapshot = None;
        }
        if let Some(last) = rd.entries.last() {
            self.stable_index = last.index;
            self.unstable.retain(|e| e.index > last.index);
            if self.role == Role::Leader {
                let last_index = last.index;
                if let Some(pr) = self.progress.get_mut(&self.id) {
                    pr.matched = last_index;
                    pr.next = last_index + 1;
                }
                if self.maybe_commit() {
                    self.bcast_append();
                }
            }
        }
        if let Some(last) = rd.committed_entries.last() {
            self.applied = self.applied.max(last.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemGroupStorage;

    fn cfg() -> CoreConfig {
        CoreConfig {
            election_ticks: 10,
            heartbeat_ticks: 3,
        }
    }

    fn single_voter_core() -> RaftCore {
        let storage = Arc::new(MemGroupStorage::initialized(vec![1]));
        RaftCore::new(7, 1, cfg(), storage, 10).expect("core")
    }

    /// Drive one persist/apply cycle and return the committed entries.
    fn drain(core: &mut RaftCore) -> Vec<Entry> {
        let mut committed = Vec::new();
        while core.has_ready() {
            let rd = core.ready();
            core.storage.append(&rd.entries).expect("append");
            if let Some(hs) = rd.hard_state {
                core.storage.set_hard_state(&hs).expect("hard state");
            }
            committed.extend(rd.committed_entries.iter().cloned());
            core.advance(&rd);
        }
        committed
    }

    #[test]
    fn single_voter_campaign_elects_immediately() {
        let mut core = single_voter_core();
        core.campaign();
        assert_eq!(core.role(), Role::Leader);
        assert_eq!(core.leader(), 1);
        assert_eq!(core.term(), 6);
    }

    #[test]
    fn single_voter_commits_after_persist() {
        let mut core = single_voter_core();
        core.campaign();
        drain(&mut core);
        core.propose(b"cmd".to_vec()).expect("propose");
        let committed = drain(&mut core);
        assert!(committed.iter().any(|e| e.data == b"cmd"));
        let status = core.status();
        assert!(status.applied <= status.commit);
        assert!(status.commit <= core.last_index);
    }

    #[test]
    fn follower_rejects_append_with_unknown_prev() {
        let storage = Arc::new(MemGroupStorage::initialized(vec![1, 2, 3]));
        let mut core = RaftCore::new(7, 1, cfg(), storage, 10).expect("core");
        let mut m = Message::new(MessageKind::Append, 2, 1, 6);
        m.index = 20;
        m.log_term = 6;
        core.step(m).expect("step");
        let rd = core.ready();
        let resp = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::AppendResp)
            .expect("append resp");
        assert!(resp.reject);
        assert_eq!(resp.reject_hint, 10);
    }

    #[test]
    fn follower_accepts_matching_append_and_commits() {
        let storage = Arc::new(MemGroupStorage::initialized(vec![1, 2, 3]));
        let mut core = RaftCore::new(7, 1, cfg(), storage, 10).expect("core");
        let mut m = Message::new(MessageKind::Append, 2, 1, 6);
        m.index = 10;
        m.log_term = 5;
        m.commit = 11;
        m.entries = vec![Entry::new(11, 6, EntryKind::Normal, b"x".to_vec())];
        core.step(m).expect("step");
        let committed = drain(&mut core);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].index, 11);
    }

    #[test]
    fn vote_granted_only_to_up_to_date_candidate() {
        let storage = Arc::new(MemGroupStorage::initialized(vec![1, 2, 3]));
        let mut core = RaftCore::new(7, 1, cfg(), storage, 10).expect("core");
        // Stale log (index 9 < 10): rejected.
        let mut m = Message::new(MessageKind::Vote, 2, 1, 6);
        m.index = 9;
        m.log_term = 5;
        core.step(m).expect("step");
        let rd = core.ready();
        assert!(rd.messages.iter().any(|m| m.kind == MessageKind::VoteResp && m.reject));
        core.advance(&rd);

        // Up-to-date candidate at a later term: granted.
        let mut m = Message::new(MessageKind::Vote, 3, 1, 7);
        m.index = 10;
        m.log_term = 5;
        core.step(m).expect("step");
        let rd = core.ready();
        assert!(rd
            .messages
            .iter()
            .any(|m| m.kind == MessageKind::VoteResp && !m.reject));
        // The granted vote must be in the hard state of the same ready.
        assert_eq!(rd.hard_state.expect("hard state").vote, 3);
    }

    #[test]
    fn snapshot_restore_resets_log_position() {
        let storage = Arc::new(MemGroupStorage::uninitialized());
        let mut core = RaftCore::new(7, 4, cfg(), storage, 0).expect("core");
        let mut m = Message::new(MessageKind::Snap, 1, 4, 8);
        m.snapshot = Some(Snapshot {
            data: b"state".to_vec(),
            metadata: crate::types::SnapshotMetadata {
                index: 20,
                term: 8,
                conf_state: ConfState { voters: vec![1, 2, 4] },
            },
        });
        core.step(m).expect("step");
        let rd = core.ready();
        assert!(rd.snapshot.is_some());
        core.storage
            .apply_snapshot(rd.snapshot.as_ref().expect("snapshot"))
            .expect("apply");
        core.advance(&rd);
        assert_eq!(core.last_index, 20);
        assert_eq!(core.status().applied, 20);
        assert_eq!(core.voters(), &[1, 2, 4]);
    }

    #[test]
    fn three_voters_replicate_and_commit() {
        // Hand-rolled three-node cluster: route messages between cores.
        let mut cores: HashMap<u64, RaftCore> = HashMap::new();
        for id in 1..=3u64 {
            let storage = Arc::new(MemGroupStorage::initialized(vec![1, 2, 3]));
            cores.insert(id, RaftCore::new(7, id, cfg(), storage, 10).expect("core"));
        }
        cores.get_mut(&1).expect("core 1").campaign();

        let mut all_committed: HashMap<u64, Vec<Entry>> = HashMap::new();
        let mut proposed = false;
        for _ in 0..30 {
            let mut inflight: Vec<Message> = Vec::new();
            for (&id, core) in cores.iter_mut() {
                while core.has_ready() {
                    let rd = core.ready();
                    core.storage.append(&rd.entries).expect("append");
                    if let Some(hs) = rd.hard_state {
                        core.storage.set_hard_state(&hs).expect("hard state");
                    }
                    all_committed
                        .entry(id)
                        .or_default()
                        .extend(rd.committed_entries.iter().cloned());
                    inflight.extend(rd.messages.iter().cloned());
                    core.advance(&rd);
                }
            }
            for m in inflight {
                if let Some(core) = cores.get_mut(&m.to) {
                    core.step(m).expect("step");
                }
            }
            if !proposed {
                if let Some(leader) = cores.values_mut().find(|c| c.role() == Role::Leader) {
                    leader.propose(b"hello".to_vec()).expect("propose");
                    proposed = true;
                }
            }
        }

        for id in 1..=3u64 {
            let committed = all_committed.get(&id).expect("committed entries");
            assert!(
                committed.iter().any(|e| e.data == b"hello"),
                "replica {id} missing the committed command"
            );
        }
    }
}
