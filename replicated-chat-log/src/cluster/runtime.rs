//! Worker runtime for a raft-backed [`ClusterStateMachine`].
//!
//! - **Worker thread**: owns the [`RaftNode`], ticks it, steps inbound
//!   messages and resolves callers waiting on their proposals
//! - **Transport threads**: see [`transport`](super::transport)
//! - **[`RaftStateMachine`]**: the handle callers use; it talks to the worker
//!   over a channel and reads role and leader from a published status
//!
//! The worker is single-threaded, so raft state needs no locks. Listeners run
//! on the worker thread as entries are applied.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use raft::StateRole;
use raft::prelude::Message;
use tracing::{debug, error, info, warn};

use super::node::{AppliedKind, ApplyReport, NodeStatus, RaftNode};
use super::storage::RaftLogStorage;
use super::transport::{self, Inbound, ListenerHandle, Outbox};
use super::{
    ClusterError, ClusterStateMachine, Listeners, PING_PAYLOAD, UpdateStateListener,
    node_id_for, resolve_address,
};

/// Raft logical clock interval. Heartbeats every 3 ticks, elections after 10.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub const PING_TIMEOUT: Duration = Duration::from_millis(500);
/// Per-peer wait in [`ClusterStateMachine::add_peers`].
pub const ADD_PEER_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = Sender<Result<(), ClusterError>>;

/// Requests sent from the handle to the worker thread.
enum ClientRequest {
    Propose { payload: Vec<u8>, respond_to: Reply },
    AddPeer { address: SocketAddr, respond_to: Reply },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Entry,
    Membership,
}

/// A proposal waiting for the entry at its index to be applied.
struct Pending {
    term: u64,
    expect: Expect,
    respond_to: Reply,
}

impl Pending {
    fn is_fulfilled_by(&self, report: &ApplyReport) -> bool {
        self.term == report.term
            && match self.expect {
                Expect::Entry => matches!(report.kind, AppliedKind::Command | AppliedKind::Probe),
                Expect::Membership => report.kind == AppliedKind::Membership,
            }
    }
}

/// Raft-backed cluster state machine for one node.
pub struct RaftStateMachine {
    node_id: u64,
    address: String,
    request_tx: Sender<ClientRequest>,
    status: Arc<RwLock<NodeStatus>>,
    listeners: Listeners,
    listener: Mutex<Option<ListenerHandle>>,
    worker: Mutex<WorkerSlot>,
}

/// The worker before [`RaftStateMachine::start`], while running, and after
/// shutdown.
enum WorkerSlot {
    Idle(Box<Worker>),
    Running(JoinHandle<()>),
    Stopped,
}

impl RaftStateMachine {
    /// Opens a node keeping its raft state under `directory` and serving raft
    /// traffic on `bind_address`.
    ///
    /// The bound address is this node's identity and what it advertises to
    /// peers, so it must be reachable from them. `127.0.0.1:0` picks a free
    /// port, useful in tests.
    ///
    /// With `bootstrap` and no existing state, the node founds a single-member
    /// cluster and elects itself. Otherwise it waits to be added by a leader.
    ///
    /// Nothing is applied until [`start`](Self::start): register listeners
    /// first so they see the whole log replayed. Requests made before then
    /// queue up.
    pub fn open(
        directory: impl AsRef<Path>,
        bind_address: &str,
        bootstrap: bool,
    ) -> Result<Self, ClusterError> {
        let directory = directory.as_ref();
        let bind = resolve_address(bind_address)?;
        let listener = TcpListener::bind(bind).map_err(ClusterError::Transport)?;
        let local = listener.local_addr().map_err(ClusterError::Transport)?;
        if local.ip().is_unspecified() {
            warn!(
                address = %local,
                "raft bound to every interface; peers must reach this node at exactly this address"
            );
        }
        let node_id = node_id_for(&local);
        let address = local.to_string();

        let storage = RaftLogStorage::open(directory)?;
        let listeners = Listeners::default();
        let node = RaftNode::open(node_id, address.clone(), storage, listeners.clone(), bootstrap)?;
        let status = Arc::new(RwLock::new(node.status()));

        let (client_tx, client_rx) = unbounded();
        let (network_tx, network_rx) = unbounded();
        let listener = transport::spawn_listener(listener, network_tx)?;
        let outbox = transport::spawn_sender(address.clone())?;
        let worker = Worker::new(node, client_rx, network_rx, outbox, status.clone());

        info!(
            node = node_id,
            address,
            directory = %directory.display(),
            bootstrap,
            "raft state machine opened"
        );

        Ok(Self {
            node_id,
            address,
            request_tx: client_tx,
            status,
            listeners,
            listener: Mutex::new(Some(listener)),
            worker: Mutex::new(WorkerSlot::Idle(Box::new(worker))),
        })
    }

    /// Spawns the worker thread, which replays the log to the registered
    /// listeners and then joins consensus. Later calls do nothing.
    pub fn start(&self) -> Result<(), ClusterError> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let mut worker = match std::mem::replace(&mut *slot, WorkerSlot::Stopped) {
            WorkerSlot::Idle(worker) => worker,
            other => {
                *slot = other;
                return Ok(());
            }
        };
        let node_id = self.node_id;
        let handle = thread::Builder::new()
            .name(format!("raft-worker-{node_id}"))
            .spawn(move || {
                if let Err(err) = worker.run() {
                    error!(node = node_id, error = %err, "raft worker crashed");
                }
            })?;
        *slot = WorkerSlot::Running(handle);
        info!(node = node_id, listeners = self.listeners.len(), "raft state machine started");
        Ok(())
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Most recently published view of this node.
    pub fn status(&self) -> NodeStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops the worker and the transport, releasing the raft database and the
    /// bound port. Later calls fail with [`ClusterError::Shutdown`].
    pub fn shutdown(&self) {
        let slot = std::mem::replace(
            &mut *self.worker.lock().unwrap_or_else(PoisonError::into_inner),
            WorkerSlot::Stopped,
        );
        match slot {
            WorkerSlot::Stopped => return,
            WorkerSlot::Idle(worker) => {
                let mut worker = *worker;
                worker.fail_pending();
            }
            WorkerSlot::Running(handle) => {
                let _ = self.request_tx.send(ClientRequest::Shutdown);
                if handle.join().is_err() {
                    warn!(node = self.node_id, "raft worker panicked");
                }
            }
        }
        if let Some(mut listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.stop();
        }
        info!(node = self.node_id, "raft state machine stopped");
    }

    /// Sends a request to the worker and waits up to `timeout` for its reply.
    fn request(
        &self,
        build: impl FnOnce(Reply) -> ClientRequest,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(build(resp_tx))
            .map_err(|_| ClusterError::Shutdown)?;
        match resp_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ClusterError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ClusterError::Shutdown),
        }
    }

    fn add_peer(&self, peer: &str) -> Result<(), ClusterError> {
        let address = resolve_address(peer)?;
        self.request(
            |respond_to| ClientRequest::AddPeer {
                address,
                respond_to,
            },
            ADD_PEER_TIMEOUT,
        )
    }
}

impl Drop for RaftStateMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ClusterStateMachine for RaftStateMachine {
    fn add_peers(&self, peers: &[String]) -> HashMap<String, ClusterError> {
        let mut failures = HashMap::new();
        for peer in peers {
            info!(peer, "adding peer");
            match self.add_peer(peer) {
                Ok(()) => info!(peer, "peer added"),
                Err(err) => {
                    warn!(peer, error = %err, "failed to add peer");
                    failures.insert(peer.clone(), err);
                }
            }
        }
        failures
    }

    fn ping(&self) -> Result<(), ClusterError> {
        self.apply_message(PING_PAYLOAD.to_vec(), PING_TIMEOUT)
    }

    fn apply_message(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), ClusterError> {
        self.request(
            |respond_to| ClientRequest::Propose {
                payload,
                respond_to,
            },
            timeout,
        )
    }

    fn on_update(&self, listener: Arc<dyn UpdateStateListener>) {
        self.listeners.add(listener);
    }

    fn off_update(&self, listener: &Arc<dyn UpdateStateListener>) {
        self.listeners.remove(listener);
    }

    fn is_leader(&self) -> bool {
        self.status().is_leader()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn leader(&self) -> String {
        self.status().leader_address.unwrap_or_default()
    }
}

/// Owns the RaftNode and processes three types of events:
/// 1. **Client requests** from the handle
/// 2. **Network messages** from peers
/// 3. **Tick events** every 100ms to drive raft timeouts
struct Worker {
    node: RaftNode,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Inbound>,
    outbox: Outbox,
    status: Arc<RwLock<NodeStatus>>,
    pending: HashMap<u64, Pending>,
    last_role: StateRole,
    last_leader: u64,
}

impl Worker {
    fn new(
        node: RaftNode,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Inbound>,
        outbox: Outbox,
        status: Arc<RwLock<NodeStatus>>,
    ) -> Self {
        let last_role = node.role();
        let last_leader = node.leader_id();
        Self {
            node,
            client_rx,
            network_rx,
            outbox,
            status,
            pending: HashMap::new(),
            last_role,
            last_leader,
        }
    }

    fn run(&mut self) -> Result<(), ClusterError> {
        let result = self.event_loop();
        self.fail_pending();
        result
    }

    /// Answers every waiting caller, including requests still queued, with
    /// [`ClusterError::Shutdown`].
    fn fail_pending(&mut self) {
        for (index, pending) in self.pending.drain() {
            debug!(index, "failing pending proposal on shutdown");
            let _ = pending.respond_to.send(Err(ClusterError::Shutdown));
        }
        while let Ok(req) = self.client_rx.try_recv() {
            match req {
                ClientRequest::Propose { respond_to, .. }
                | ClientRequest::AddPeer { respond_to, .. } => {
                    let _ = respond_to.send(Err(ClusterError::Shutdown));
                }
                ClientRequest::Shutdown => {}
            }
        }
    }

    fn event_loop(&mut self) -> Result<(), ClusterError> {
        // Replays the log, which applies the founding membership entry.
        self.process_ready()?;
        if self.node.campaign_if_sole_voter()? {
            info!(node = self.node.id(), "sole voter, campaigning");
        }
        self.process_ready()?;
        self.publish_status();

        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    match inbound {
                        Ok(inbound) => self.handle_inbound(inbound),
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.publish_status();
        }

        Ok(())
    }

    /// Returns `false` once shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> bool {
        match req {
            ClientRequest::Propose {
                payload,
                respond_to,
            } => match self.node.propose(payload) {
                Ok((index, term)) => self.track(index, term, Expect::Entry, respond_to),
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            ClientRequest::AddPeer {
                address,
                respond_to,
            } => {
                let id = node_id_for(&address);
                if self.node.role() == StateRole::Leader && self.node.is_voter(id) {
                    debug!(id, %address, "peer already a member");
                    let _ = respond_to.send(Ok(()));
                    return true;
                }
                match self.node.propose_add_peer(id, &address.to_string()) {
                    Ok((index, term)) => self.track(index, term, Expect::Membership, respond_to),
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn track(&mut self, index: u64, term: u64, expect: Expect, respond_to: Reply) {
        let pending = Pending {
            term,
            expect,
            respond_to,
        };
        // An index reused under a new term means the earlier entry was lost.
        if let Some(stale) = self.pending.insert(index, pending) {
            let _ = stale
                .respond_to
                .send(Err(ClusterError::ProposalDropped { index }));
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            from_address,
            message,
        } = inbound;
        self.node.learn_address(message.from, &from_address);
        let (from, msg_type) = (message.from, message.msg_type());
        if let Err(err) = self.node.step(message) {
            debug!(from, ?msg_type, error = %err, "dropped raft message");
        }
    }

    /// Drains all ready state from raft: sends messages and resolves waiters.
    fn process_ready(&mut self) -> Result<(), ClusterError> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.resolve(report);
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<(), ClusterError> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        match self.node.address_of(msg.to) {
            Some(address) => self.outbox.send(address, &msg),
            None => debug!(to = msg.to, "no address for peer, dropping message"),
        }
        Ok(())
    }

    fn resolve(&mut self, report: ApplyReport) {
        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        let result = if pending.is_fulfilled_by(&report) {
            Ok(())
        } else {
            debug!(index = report.index, ?report.kind, "proposal replaced before commit");
            Err(ClusterError::ProposalDropped {
                index: report.index,
            })
        };
        // The caller may have timed out and gone away.
        let _ = pending.respond_to.send(result);
    }

    fn publish_status(&mut self) {
        let status = self.node.status();
        if status.role != self.last_role || status.leader_id != self.last_leader {
            info!(
                node = status.node_id,
                from = ?self.last_role,
                to = ?status.role,
                leader = status.leader_address.as_deref().unwrap_or(""),
                term = status.term,
                "raft role changed"
            );
            self.last_role = status.role;
            self.last_leader = status.leader_id;
        }
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(index: u64, term: u64, kind: AppliedKind) -> ApplyReport {
        ApplyReport { index, term, kind }
    }

    fn pending(term: u64, expect: Expect) -> Pending {
        let (respond_to, _rx) = bounded(1);
        Pending {
            term,
            expect,
            respond_to,
        }
    }

    #[test]
    fn entry_proposals_accept_commands_and_probes() {
        let waiting = pending(3, Expect::Entry);
        assert!(waiting.is_fulfilled_by(&report(7, 3, AppliedKind::Command)));
        assert!(waiting.is_fulfilled_by(&report(7, 3, AppliedKind::Probe)));
        assert!(!waiting.is_fulfilled_by(&report(7, 3, AppliedKind::Noop)));
        assert!(!waiting.is_fulfilled_by(&report(7, 4, AppliedKind::Command)));
    }

    #[test]
    fn membership_proposals_need_a_membership_entry() {
        let waiting = pending(2, Expect::Membership);
        assert!(waiting.is_fulfilled_by(&report(4, 2, AppliedKind::Membership)));
        // Raft swaps a second concurrent membership change for an empty entry.
        assert!(!waiting.is_fulfilled_by(&report(4, 2, AppliedKind::Noop)));
    }
}
