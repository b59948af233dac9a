//! Chat log whose writes go through the cluster state machine.
//!
//! `save` wraps the message in a [`ReplicationEnvelope`] and submits it for
//! consensus. Every node, the writer included, writes the message into its
//! local store only when the committed entry is applied. Reads are served
//! from the local store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{ChatLogStore, StoreError, stamp};
use crate::cluster::{ClusterStateMachine, UpdateStateListener};
use crate::message::EventMessage;

/// How long `save` waits for its entry to commit.
pub const SAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// The replicated payload: where to file the message and its encoded form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub id: u64,
    pub group: String,
    /// [`EventMessage::encode`] output.
    pub message: Vec<u8>,
}

impl ReplicationEnvelope {
    pub fn new(group: &str, id: u64, message: &EventMessage) -> Result<Self, StoreError> {
        Ok(Self {
            id,
            group: group.to_string(),
            message: message.encode()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(StoreError::Envelope)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(StoreError::Envelope)
    }

    pub fn decode_message(&self) -> Result<EventMessage, StoreError> {
        Ok(EventMessage::decode(&self.message)?)
    }
}

/// Writes committed envelopes into a local store.
///
/// Decoding failures are returned; a failed local save is only logged, since
/// the entry is already committed cluster-wide.
fn materialize<L>(local: &L, payload: &[u8]) -> Result<(), StoreError>
where
    L: ChatLogStore + ?Sized,
{
    let envelope = ReplicationEnvelope::decode(payload)?;
    let message = envelope.decode_message()?;
    match local.save(&envelope.group, envelope.id, message) {
        Ok(()) => debug!(group = envelope.group, id = envelope.id, "materialized message"),
        Err(err) => error!(
            group = envelope.group,
            id = envelope.id,
            error = %err,
            "failed to materialize committed message"
        ),
    }
    Ok(())
}

/// Listener registered with the state machine. Holds only the local store so
/// the state machine never keeps the replicated store alive.
struct Materializer<L: ?Sized> {
    local: Arc<L>,
}

impl<L> UpdateStateListener for Materializer<L>
where
    L: ChatLogStore + ?Sized + 'static,
{
    fn on_state_updated(&self, payload: &[u8]) -> anyhow::Result<()> {
        Ok(materialize(&*self.local, payload)?)
    }
}

pub struct ReplicatedLogStore<L: ?Sized, S: ClusterStateMachine + ?Sized> {
    local: Arc<L>,
    state_machine: Arc<S>,
    materializer: Arc<dyn UpdateStateListener>,
}

impl<L, S> ReplicatedLogStore<L, S>
where
    L: ChatLogStore + ?Sized + 'static,
    S: ClusterStateMachine + ?Sized,
{
    /// Registers for committed entries on `state_machine`; dropping the store
    /// unregisters.
    pub fn new(local: Arc<L>, state_machine: Arc<S>) -> Self {
        let materializer: Arc<dyn UpdateStateListener> = Arc::new(Materializer {
            local: local.clone(),
        });
        state_machine.on_update(materializer.clone());
        Self {
            local,
            state_machine,
            materializer,
        }
    }

    /// Applies one committed payload to the local store.
    pub fn on_state_updated(&self, payload: &[u8]) -> Result<(), StoreError> {
        materialize(&*self.local, payload)
    }
}

impl<L: ?Sized, S: ClusterStateMachine + ?Sized> Drop for ReplicatedLogStore<L, S> {
    fn drop(&mut self) {
        self.state_machine.off_update(&self.materializer);
    }
}

impl<L, S> ChatLogStore for ReplicatedLogStore<L, S>
where
    L: ChatLogStore + ?Sized + 'static,
    S: ClusterStateMachine + ?Sized,
{
    /// Success means the entry was accepted by consensus. Local visibility
    /// follows through the commit callback and is not guaranteed on return.
    /// A timeout leaves the outcome unknown: the entry may still commit.
    fn save(&self, group: &str, id: u64, mut message: EventMessage) -> Result<(), StoreError> {
        stamp(group, id, &mut message)?;
        let payload = ReplicationEnvelope::new(group, id, &message)?.encode()?;
        self.state_machine.apply_message(payload, SAVE_TIMEOUT)?;
        Ok(())
    }

    fn get_messages_for(
        &self,
        group: &str,
        start_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EventMessage>, StoreError> {
        self.local.get_messages_for(group, start_id, offset, limit)
    }

    fn get_message(&self, id: u64) -> Result<EventMessage, StoreError> {
        self.local.get_message(id)
    }

    fn cleanup(&self, group: &str) {
        self.local.cleanup(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, Listeners};
    use crate::message::{ChatMessage, MessageError, MessageKind};
    use crate::store::LocalLogStore;
    use crate::store::local::DEFAULT_TABLE;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Commits synchronously to its listeners while it "leads".
    #[derive(Default)]
    struct FakeCluster {
        listeners: Listeners,
        follower: AtomicBool,
        committed: Mutex<Vec<Vec<u8>>>,
    }

    impl ClusterStateMachine for FakeCluster {
        fn add_peers(&self, _peers: &[String]) -> HashMap<String, ClusterError> {
            HashMap::new()
        }

        fn ping(&self) -> Result<(), ClusterError> {
            Ok(())
        }

        fn apply_message(&self, payload: Vec<u8>, _timeout: Duration) -> Result<(), ClusterError> {
            if self.follower.load(Ordering::SeqCst) {
                return Err(ClusterError::NotLeader {
                    leader: Some("127.0.0.1:5000".into()),
                });
            }
            let index = {
                let mut committed = self.committed.lock().unwrap();
                committed.push(payload.clone());
                committed.len() as u64
            };
            self.listeners.notify(index, &payload);
            Ok(())
        }

        fn on_update(&self, listener: Arc<dyn UpdateStateListener>) {
            self.listeners.add(listener);
        }

        fn off_update(&self, listener: &Arc<dyn UpdateStateListener>) {
            self.listeners.remove(listener);
        }

        fn is_leader(&self) -> bool {
            !self.follower.load(Ordering::SeqCst)
        }

        fn address(&self) -> String {
            "127.0.0.1:5000".into()
        }

        fn leader(&self) -> String {
            self.address()
        }
    }

    fn local_store(dir: &tempfile::TempDir, name: &str) -> Arc<LocalLogStore> {
        Arc::new(LocalLogStore::open(dir.path().join(name), DEFAULT_TABLE).unwrap())
    }

    fn chat(text: &str) -> EventMessage {
        ChatMessage::new("alice", "room1", text).into()
    }

    #[test]
    fn save_is_readable_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let store = ReplicatedLogStore::new(local_store(&dir, "a.redb"), cluster.clone());

        store.save("room1", 1, chat("hi")).unwrap();

        let by_id = store.get_message(1).unwrap();
        assert_eq!(by_id.id(), 1);
        assert_eq!(store.get_messages_for("room1", "", 0, 10).unwrap(), vec![by_id]);
        assert_eq!(cluster.committed.lock().unwrap().len(), 1);
    }

    #[test]
    fn every_registered_node_materializes_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let writer = ReplicatedLogStore::new(local_store(&dir, "a.redb"), cluster.clone());
        let follower_local = local_store(&dir, "b.redb");
        let _follower = ReplicatedLogStore::new(follower_local.clone(), cluster.clone());

        writer.save("room1", 5, chat("fan out")).unwrap();

        let seen = follower_local.get_message(5).unwrap();
        assert_eq!(seen, writer.get_message(5).unwrap());
    }

    #[test]
    fn rejected_save_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        cluster.follower.store(true, Ordering::SeqCst);
        let store = ReplicatedLogStore::new(local_store(&dir, "a.redb"), cluster.clone());

        let err = store.save("room1", 1, chat("lost")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Cluster(ClusterError::NotLeader { .. })
        ));
        assert!(matches!(store.get_message(1), Err(StoreError::NotFound(1))));
        assert!(cluster.committed.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_saves_are_rejected_before_replication() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let store = ReplicatedLogStore::new(local_store(&dir, "a.redb"), cluster.clone());

        assert!(matches!(store.save("room1", 0, chat("x")), Err(StoreError::InvalidId)));
        assert!(matches!(store.save("", 1, chat("x")), Err(StoreError::InvalidGroup)));
        assert!(cluster.committed.lock().unwrap().is_empty());
    }

    #[test]
    fn undecodable_payloads_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicatedLogStore::new(
            local_store(&dir, "a.redb"),
            Arc::new(FakeCluster::default()),
        );

        assert!(matches!(
            store.on_state_updated(b"\x01"),
            Err(StoreError::Envelope(_))
        ));

        let unknown = ReplicationEnvelope {
            id: 1,
            group: "room1".into(),
            message: vec![0xee, 0x00],
        };
        assert!(matches!(
            store.on_state_updated(&unknown.encode().unwrap()),
            Err(StoreError::Message(MessageError::UnknownType(0xee)))
        ));
    }

    #[test]
    fn local_save_failures_do_not_fail_the_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicatedLogStore::new(
            local_store(&dir, "a.redb"),
            Arc::new(FakeCluster::default()),
        );
        let envelope = ReplicationEnvelope::new("room1", 0, &chat("bad id")).unwrap();

        store.on_state_updated(&envelope.encode().unwrap()).unwrap();
        assert!(store.get_messages_for("room1", "", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn envelope_keeps_the_message_kind() {
        let envelope = ReplicationEnvelope::new("room1", 3, &chat("x")).unwrap();
        let decoded = ReplicationEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.decode_message().unwrap().kind(), MessageKind::Chat);
    }

    #[test]
    fn dropping_the_store_unregisters_it() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let store = ReplicatedLogStore::new(local_store(&dir, "a.redb"), cluster.clone());
        assert_eq!(cluster.listeners.len(), 1);

        drop(store);
        assert!(cluster.listeners.is_empty());
    }
}
