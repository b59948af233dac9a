//! Core Raft node.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` over the durable
//! [`RaftLogStorage`]. It owns the peer directory (node id → address) and hands
//! committed command entries to the registered listeners. It never does I/O
//! beyond storage: outbound messages are returned to the caller in a
//! [`ReadyBundle`].

use std::collections::BTreeMap;

use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::{
    ConfChange, ConfChangeType, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use super::storage::RaftLogStorage;
use super::{ClusterError, Listeners, PING_PAYLOAD};

/// Upper bound on the entries carried by one append message.
const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;

/// Creates a logger that discards all output.
///
/// tikv/raft requires an slog logger; this crate logs through `tracing` at the
/// application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What applying a committed entry amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedKind {
    /// Delivered to the listeners.
    Command,
    /// A ping entry; committed but not delivered.
    Probe,
    /// A membership change.
    Membership,
    /// An empty entry: a new leader's no-op, or a proposal raft replaced.
    Noop,
}

/// Raft metadata of one applied entry, used to resolve waiting proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub kind: AppliedKind,
}

/// Output from processing one Ready / LightReady cycle.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// Point-in-time view of a node, published for readers outside the worker.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub address: String,
    pub role: StateRole,
    pub leader_id: u64,
    pub leader_address: Option<String>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub peers: BTreeMap<u64, String>,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }
}

pub struct RaftNode {
    id: u64,
    address: String,
    raw: RawNode<RaftLogStorage>,
    storage: RaftLogStorage,
    peers: BTreeMap<u64, String>,
    listeners: Listeners,
}

impl RaftNode {
    /// Creates the node over `storage`.
    ///
    /// With `bootstrap` set and an empty log, this node founds a new cluster
    /// as its only voter. Otherwise it starts with whatever membership the log
    /// holds, which for a fresh joining node is none: it stays passive until
    /// a leader replicates the log to it.
    ///
    /// `applied` starts at 0, so every committed entry is replayed to the
    /// listeners after a restart.
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: elections after ~1 second without a leader
    /// - `heartbeat_tick: 3`: leader heartbeats every ~300ms
    /// - assumes the runtime ticks every 100ms
    pub fn open(
        id: u64,
        address: String,
        storage: RaftLogStorage,
        listeners: Listeners,
        bootstrap: bool,
    ) -> Result<Self, ClusterError> {
        if bootstrap {
            if storage.is_initialized() {
                info!(id, "existing raft state found, not bootstrapping");
            } else {
                storage.bootstrap(id, &address)?;
            }
        }

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            max_size_per_msg: MAX_SIZE_PER_MSG,
            ..Default::default()
        };
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())?;

        let mut peers = BTreeMap::new();
        peers.insert(id, address.clone());
        let node = Self {
            id,
            address,
            raw,
            storage,
            peers,
            listeners,
        };
        node.refresh_snapshot_data()?;
        Ok(node)
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<(), ClusterError> {
        Ok(self.raw.campaign()?)
    }

    /// Starts an election right away when this node is the only voter.
    ///
    /// Must run after the bootstrap membership entry has been applied; raft
    /// refuses to campaign over unapplied membership changes.
    pub fn campaign_if_sole_voter(&mut self) -> Result<bool, ClusterError> {
        if self.role() == StateRole::Leader || self.storage.conf_state().voters != [self.id] {
            return Ok(false);
        }
        self.campaign()?;
        Ok(true)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Current leader's id, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn address_of(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn leader_address(&self) -> Option<String> {
        self.address_of(self.leader_id()).map(str::to_string)
    }

    pub fn is_voter(&self, id: u64) -> bool {
        self.storage.conf_state().voters.contains(&id)
    }

    pub fn peers(&self) -> &BTreeMap<u64, String> {
        &self.peers
    }

    /// Records the address a peer's traffic arrives from, so replies can reach
    /// it before its membership entry has been applied here.
    pub fn learn_address(&mut self, id: u64, address: &str) {
        if id == 0 || self.peers.contains_key(&id) {
            return;
        }
        debug!(id, address, "learned peer address");
        self.peers.insert(id, address.to_string());
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            address: self.address.clone(),
            role: self.role(),
            leader_id: self.leader_id(),
            leader_address: self.leader_address(),
            term: self.term(),
            commit_index: self.raw.raft.raft_log.committed,
            applied_index: self.raw.raft.raft_log.applied,
            peers: self.peers.clone(),
        }
    }

    fn not_leader(&self) -> ClusterError {
        ClusterError::NotLeader {
            leader: self.leader_address(),
        }
    }

    /// Index and term the most recent proposal landed at.
    fn last_proposal(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    /// Appends `payload` to the leader's log.
    ///
    /// Returns the `(index, term)` the entry occupies; it is committed once an
    /// entry with that index and term is applied.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<(u64, u64), ClusterError> {
        if self.role() != StateRole::Leader {
            return Err(self.not_leader());
        }
        self.raw.propose(vec![], payload)?;
        Ok(self.last_proposal())
    }

    /// Proposes adding `id` as a voter reachable at `address`.
    pub fn propose_add_peer(
        &mut self,
        id: u64,
        address: &str,
    ) -> Result<(u64, u64), ClusterError> {
        if self.role() != StateRole::Leader {
            return Err(self.not_leader());
        }
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = id;
        change.context = address.as_bytes().to_vec().into();
        self.raw.propose_conf_change(vec![], change)?;
        Ok(self.last_proposal())
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<(), ClusterError> {
        Ok(self.raw.step(msg)?)
    }

    /// Checks if Raft has work to do, processes it, and returns the results.
    ///
    /// # Processing flow
    ///
    /// **Ready**:
    /// 1. Collect messages that may go out before persistence
    /// 2. Install a received snapshot
    /// 3. Apply already-persisted committed entries
    /// 4. Persist new entries and the hard state
    /// 5. Collect messages that required persistence
    ///
    /// **LightReady**:
    /// 1. Persist the advanced commit index
    /// 2. Apply the newly committed entries
    /// 3. Collect the remaining messages
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>, ClusterError> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = ready.take_messages();

        if !ready.snapshot().is_empty() {
            self.restore(ready.snapshot().clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state)?;
        }
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }
        outbound.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>, ClusterError> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => AppliedKind::Noop,
                EntryType::EntryNormal if &entry.data[..] == PING_PAYLOAD => AppliedKind::Probe,
                EntryType::EntryNormal => {
                    self.listeners.notify(entry.index, &entry.data);
                    AppliedKind::Command
                }
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring joint membership change");
                    AppliedKind::Noop
                }
            };
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                kind,
            });
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<AppliedKind, ClusterError> {
        let change = ConfChange::decode(&entry.data[..]).map_err(|err| {
            ClusterError::Corrupt(format!("membership entry {}: {err}", entry.index))
        })?;
        let conf_state = self.raw.apply_conf_change(&change)?;
        self.storage.set_conf_state(&conf_state)?;

        let address = String::from_utf8_lossy(&change.context).into_owned();
        match change.change_type() {
            ConfChangeType::RemoveNode => {
                self.peers.remove(&change.node_id);
            }
            _ if !address.is_empty() => {
                self.peers.insert(change.node_id, address.clone());
            }
            _ => {}
        }
        self.refresh_snapshot_data()?;

        info!(
            index = entry.index,
            node = change.node_id,
            address,
            change = ?change.change_type(),
            voters = ?conf_state.voters,
            "applied membership change"
        );
        Ok(AppliedKind::Membership)
    }

    /// Serialized peer directory, the application state carried by snapshots.
    pub fn capture_directory(&self) -> Result<Vec<u8>, ClusterError> {
        bincode::serialize(&self.peers)
            .map_err(|err| ClusterError::Corrupt(format!("peer directory: {err}")))
    }

    fn refresh_snapshot_data(&self) -> Result<(), ClusterError> {
        self.storage.set_snapshot_data(self.capture_directory()?);
        Ok(())
    }

    /// Installs a snapshot received from the leader and replaces the peer
    /// directory with the one it carries.
    fn restore(&mut self, snapshot: Snapshot) -> Result<(), ClusterError> {
        let index = snapshot.get_metadata().index;
        let directory: BTreeMap<u64, String> = if snapshot.data.is_empty() {
            BTreeMap::new()
        } else {
            bincode::deserialize(&snapshot.data)
                .map_err(|err| ClusterError::Corrupt(format!("snapshot directory: {err}")))?
        };
        self.storage.apply_snapshot(snapshot)?;

        self.peers = directory;
        self.peers.insert(self.id, self.address.clone());
        self.refresh_snapshot_data()?;
        warn!(
            index,
            peers = self.peers.len(),
            "installed snapshot; entries up to this index were not replayed locally"
        );
        Ok(())
    }
}
