//! Integration tests for multi-node membership and replication over TCP.
//!
//! The first node founds the cluster; the others start without state and are
//! added by the leader, after which they receive the full log.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use replicated_chat_log::cluster::{ClusterError, ClusterStateMachine, RaftStateMachine};
use replicated_chat_log::message::{ChatMessage, EventMessage};
use replicated_chat_log::store::local::DEFAULT_TABLE;
use replicated_chat_log::store::{ChatLogStore, LocalLogStore, ReplicatedLogStore, StoreError};
use tempfile::TempDir;

struct TestNode {
    state_machine: Arc<RaftStateMachine>,
    local: Arc<LocalLogStore>,
    store: ReplicatedLogStore<LocalLogStore, RaftStateMachine>,
    _dir: TempDir,
}

impl TestNode {
    fn spawn(bootstrap: bool) -> Result<Self> {
        Self::open(tempfile::tempdir()?, "127.0.0.1:0", bootstrap)
    }

    fn open(dir: TempDir, address: &str, bootstrap: bool) -> Result<Self> {
        let state_machine = Arc::new(RaftStateMachine::open(
            dir.path().join("raft"),
            address,
            bootstrap,
        )?);
        let local = Arc::new(LocalLogStore::open(
            dir.path().join("chats.redb"),
            DEFAULT_TABLE,
        )?);
        let store = ReplicatedLogStore::new(local.clone(), state_machine.clone());
        state_machine.start()?;
        Ok(Self {
            state_machine,
            local,
            store,
            _dir: dir,
        })
    }

    fn address(&self) -> String {
        self.state_machine.address()
    }

    /// Stops the node, releases both databases, and opens it again on the same
    /// directory and address.
    fn restart(self) -> Result<Self> {
        let address = self.address();
        let Self {
            state_machine,
            local,
            store,
            _dir: dir,
        } = self;
        state_machine.shutdown();
        drop(store);
        drop(local);
        drop(state_machine);
        Self::open(dir, &address, false)
    }
}

/// Test harness for a cluster founded by node 0.
struct TestCluster {
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Spawns `n` nodes and has the founder add the rest one at a time.
    fn spawn(n: usize) -> Result<Self> {
        let founder = TestNode::spawn(true)?;
        wait_until("founder leadership", Duration::from_secs(5), || {
            founder.state_machine.is_leader()
        })?;

        let mut cluster = Self {
            nodes: vec![founder],
        };
        for _ in 1..n {
            cluster.join(TestNode::spawn(false)?)?;
        }
        Ok(cluster)
    }

    /// Has the founder add `node`, then waits for everyone to catch up.
    fn join(&mut self, node: TestNode) -> Result<()> {
        let failures = self.node(0).state_machine.add_peers(&[node.address()]);
        if !failures.is_empty() {
            bail!("add_peers failed: {failures:?}");
        }
        self.nodes.push(node);
        self.wait_for_catch_up(Duration::from_secs(10))
    }

    fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Waits until every node has applied everything the founder committed
    /// and agrees on the leader.
    fn wait_for_catch_up(&self, timeout: Duration) -> Result<()> {
        let leader = self.node(0).state_machine.status();
        wait_until("catch up", timeout, || {
            self.nodes.iter().all(|node| {
                let status = node.state_machine.status();
                status.applied_index >= leader.commit_index
                    && status.leader_address.as_deref() == Some(leader.address.as_str())
            })
        })
    }

    fn shutdown(self) {
        for node in &self.nodes {
            node.state_machine.shutdown();
        }
    }
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            bail!("timeout waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

fn chat(text: &str) -> EventMessage {
    ChatMessage::new("alice", "lobby", text).into()
}

#[test]
fn unjoined_node_rejects_writes_and_membership_changes() -> Result<()> {
    let node = TestNode::spawn(false)?;
    thread::sleep(Duration::from_millis(300));

    assert!(!node.state_machine.is_leader());
    assert_eq!(node.state_machine.leader(), "");
    assert!(matches!(
        node.state_machine
            .apply_message(b"x".to_vec(), Duration::from_millis(500)),
        Err(ClusterError::NotLeader { leader: None })
    ));
    assert!(matches!(node.state_machine.ping(), Err(ClusterError::NotLeader { .. })));

    let peers = vec!["127.0.0.1:1".to_string()];
    let failures: HashMap<String, ClusterError> = node.state_machine.add_peers(&peers);
    assert_eq!(failures.len(), 1);
    assert!(failures["127.0.0.1:1"].is_not_leader());

    let bad = vec!["not-an-address".to_string()];
    assert!(matches!(
        node.state_machine.add_peers(&bad).get("not-an-address"),
        Some(ClusterError::InvalidAddress { .. })
    ));
    node.state_machine.shutdown();
    Ok(())
}

#[test]
fn writes_reach_every_member() -> Result<()> {
    let cluster = TestCluster::spawn(2)?;
    let (leader, follower) = (cluster.node(0), cluster.node(1));

    leader.store.save("lobby", 1, chat("replicated"))?;

    wait_until("follower materialization", Duration::from_secs(5), || {
        follower.local.get_message(1).is_ok()
    })?;
    assert_eq!(follower.local.get_message(1)?, leader.local.get_message(1)?);
    assert_eq!(follower.state_machine.leader(), leader.address());
    assert_eq!(follower.state_machine.status().peers.len(), 2);

    cluster.shutdown();
    Ok(())
}

#[test]
fn followers_redirect_writes_to_the_leader() -> Result<()> {
    let cluster = TestCluster::spawn(2)?;
    let (leader, follower) = (cluster.node(0), cluster.node(1));

    let err = follower.store.save("lobby", 1, chat("wrong node")).unwrap_err();
    match err {
        StoreError::Cluster(ClusterError::NotLeader { leader: hint }) => {
            assert_eq!(hint, Some(leader.address()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(leader.local.get_message(1).is_err());

    // Adding an existing member is a no-op.
    assert!(leader.state_machine.add_peers(&[follower.address()]).is_empty());

    cluster.shutdown();
    Ok(())
}

#[test]
fn late_joiner_receives_the_whole_history() -> Result<()> {
    let mut cluster = TestCluster::spawn(2)?;
    for id in 1..=3 {
        cluster.node(0).store.save("lobby", id, chat(&format!("m{id}")))?;
    }

    cluster.join(TestNode::spawn(false)?)?;

    let history: Vec<u64> = cluster
        .node(2)
        .local
        .get_messages_for("lobby", "", 0, 10)?
        .iter()
        .map(EventMessage::id)
        .collect();
    assert_eq!(history, vec![3, 2, 1]);

    cluster.shutdown();
    Ok(())
}

#[test]
fn survivors_elect_a_new_leader() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;
    cluster.node(0).store.save("lobby", 1, chat("before failover"))?;
    cluster.node(0).state_machine.shutdown();

    let survivors = &cluster.nodes[1..];
    wait_until("new leader", Duration::from_secs(10), || {
        survivors.iter().any(|node| node.state_machine.is_leader())
    })?;
    let Some(leader) = survivors.iter().find(|node| node.state_machine.is_leader()) else {
        bail!("leader disappeared");
    };

    leader.store.save("lobby", 2, chat("after failover"))?;
    for node in survivors {
        wait_until("survivor materialization", Duration::from_secs(5), || {
            node.local.get_message(2).is_ok()
        })?;
        assert!(node.local.get_message(1).is_ok());
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn timed_out_write_commits_once_quorum_returns() -> Result<()> {
    let mut cluster = TestCluster::spawn(2)?;
    cluster.node(1).state_machine.shutdown();

    // Without its follower the leader cannot commit, but the entry stays in
    // its log.
    match cluster.node(0).store.save("lobby", 1, chat("unknown outcome")) {
        Err(StoreError::Cluster(ClusterError::Timeout(_))) => {}
        other => bail!("expected a timeout, got {other:?}"),
    }
    assert!(cluster.node(0).local.get_message(1).is_err());

    let follower = cluster.nodes.remove(1);
    cluster.nodes.push(follower.restart()?);

    for node in &cluster.nodes {
        wait_until("timed-out entry to commit", Duration::from_secs(10), || {
            node.local.get_message(1).is_ok()
        })?;
    }

    wait_until("a leader", Duration::from_secs(10), || {
        cluster.nodes.iter().any(|node| node.state_machine.is_leader())
    })?;
    let Some(leader) = cluster.nodes.iter().find(|node| node.state_machine.is_leader()) else {
        bail!("leader disappeared");
    };
    leader.store.save("lobby", 2, chat("after recovery"))?;

    for node in &cluster.nodes {
        wait_until("fresh write", Duration::from_secs(5), || {
            node.local.get_message(2).is_ok()
        })?;
        let ids: Vec<u64> = node
            .local
            .get_messages_for("lobby", "", 0, 10)?
            .iter()
            .map(EventMessage::id)
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    cluster.shutdown();
    Ok(())
}
