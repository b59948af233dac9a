//! Cluster state machine: consensus-backed commit of opaque entries.
//!
//! [`ClusterStateMachine`] is the contract the stores depend on. The only
//! implementation, [`RaftStateMachine`], wraps tikv/raft:
//!
//! - [`storage`]: durable raft log, hard state and snapshot metadata (redb)
//! - [`node`]: the `RawNode` wrapper that persists readies and applies entries
//! - [`transport`]: length-prefixed TCP delivery of raft messages
//! - [`runtime`]: the worker thread and the public handle
//!
//! Committed command entries are handed to every registered
//! [`UpdateStateListener`], in registration order, on the worker thread.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::error;

pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use node::NodeStatus;
pub use runtime::RaftStateMachine;

/// Payload committed by [`ClusterStateMachine::ping`]. Never delivered to listeners.
pub const PING_PAYLOAD: &[u8] = b"PING";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("raft storage error: {0}")]
    Storage(#[from] redb::Error),
    #[error("corrupt raft state: {0}")]
    Corrupt(String),
    #[error("node is not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },
    #[error("entry not committed within {0:?}; outcome unknown")]
    Timeout(Duration),
    #[error("proposal at index {index} was replaced before it committed")]
    ProposalDropped { index: u64 },
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),
    #[error("cluster state machine has shut down")]
    Shutdown,
}

macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ClusterError {
                fn from(err: $ty) -> Self {
                    ClusterError::Storage(err.into())
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl ClusterError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ClusterError::NotLeader { .. })
    }
}

/// Receives the raw payload of every committed command entry.
///
/// Called on the consensus apply path: a slow listener stalls every commit on
/// this node, and a listener must never call back into the state machine.
pub trait UpdateStateListener: Send + Sync {
    fn on_state_updated(&self, payload: &[u8]) -> anyhow::Result<()>;
}

/// Consensus-backed replication of opaque entries.
pub trait ClusterStateMachine: Send + Sync {
    /// Adds each address to the membership. Only failures are returned.
    fn add_peers(&self, peers: &[String]) -> HashMap<String, ClusterError>;

    /// Commits a fixed probe entry through consensus.
    fn ping(&self) -> Result<(), ClusterError>;

    /// Submits `payload` and blocks until it is committed and applied locally,
    /// or `timeout` elapses. A timeout leaves the outcome unknown.
    fn apply_message(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), ClusterError>;

    fn on_update(&self, listener: Arc<dyn UpdateStateListener>);
    fn off_update(&self, listener: &Arc<dyn UpdateStateListener>);

    fn is_leader(&self) -> bool;
    fn address(&self) -> String;
    /// Leader address, or an empty string when no leader is known.
    fn leader(&self) -> String;
}

/// Ordered listener registry shared between the handle and the worker.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn UpdateStateListener>>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn UpdateStateListener>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes `listener`, returning whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn UpdateStateListener>) -> bool {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `payload` to every listener in order. Failures are logged and
    /// do not stop delivery to the rest.
    pub fn notify(&self, index: u64, payload: &[u8]) {
        // Deliver from a copy so a listener may (un)register without deadlocking.
        let listeners = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(err) = listener.on_state_updated(payload) {
                error!(index, error = %err, "listener failed to apply committed entry");
            }
        }
    }
}

/// Parses a bind or peer address. A bare `:port` binds every interface.
pub fn resolve_address(address: &str) -> Result<SocketAddr, ClusterError> {
    let candidate = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    let invalid = |reason: String| ClusterError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    candidate
        .to_socket_addrs()
        .map_err(|err| invalid(err.to_string()))?
        .next()
        .ok_or_else(|| invalid("address resolved to nothing".to_string()))
}

/// Raft node id for a peer address. Every node derives the same id.
pub fn node_id_for(address: &SocketAddr) -> u64 {
    let port = u64::from(address.port());
    let host = match address.ip() {
        IpAddr::V4(ip) => u64::from(u32::from(ip)),
        IpAddr::V6(ip) => ip
            .segments()
            .iter()
            .fold(0u64, |acc, segment| acc.rotate_left(16) ^ u64::from(*segment)),
    };
    // 0 is raft's "no node".
    ((host << 16) | port).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl UpdateStateListener for Recorder {
        fn on_state_updated(&self, payload: &[u8]) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, String::from_utf8_lossy(payload)));
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    #[test]
    fn listeners_run_in_registration_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::default();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            listeners.add(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail,
            }));
        }

        listeners.notify(1, b"x");
        assert_eq!(*log.lock().unwrap(), vec!["a:x", "b:x", "c:x"]);
    }

    #[test]
    fn removed_listener_no_longer_receives_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::default();
        let keep: Arc<dyn UpdateStateListener> = Arc::new(Recorder {
            name: "keep",
            log: log.clone(),
            fail: false,
        });
        let drop: Arc<dyn UpdateStateListener> = Arc::new(Recorder {
            name: "drop",
            log: log.clone(),
            fail: false,
        });
        listeners.add(keep.clone());
        listeners.add(drop.clone());

        assert!(listeners.remove(&drop));
        assert!(!listeners.remove(&drop));
        listeners.notify(2, b"y");
        assert_eq!(*log.lock().unwrap(), vec!["keep:y"]);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn node_ids_are_stable_and_distinct() {
        let a: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        let c: SocketAddr = "10.0.0.1:6000".parse().unwrap();
        assert_eq!(node_id_for(&a), node_id_for(&a));
        assert_ne!(node_id_for(&a), node_id_for(&b));
        assert_ne!(node_id_for(&a), node_id_for(&c));
        assert_eq!(node_id_for(&a), (0x7f00_0001u64 << 16) | 6000);
    }

    #[test]
    fn resolves_bare_port_and_rejects_garbage() {
        let addr = resolve_address(":5000").unwrap();
        assert_eq!(addr.port(), 5000);
        assert!(addr.ip().is_unspecified());

        assert!(matches!(
            resolve_address("not an address"),
            Err(ClusterError::InvalidAddress { .. })
        ));
    }
}
