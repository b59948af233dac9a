//! Durable raft storage backed by `redb`.
//!
//! [`RaftLogStorage`] implements [`raft::Storage`] so `RawNode` can read the
//! log directly, and exposes the write half (`append`, `set_hard_state`, ...)
//! that [`RaftNode`](super::node::RaftNode) calls while handling a `Ready`.
//!
//! Layout of `raft.log.redb`:
//!
//! - `raft_entries`: log index → prost-encoded `Entry`
//! - `raft_meta`: `hard_state`, `conf_state`, `snapshot` → prost-encoded values
//!
//! The log is never compacted. A node that bootstraps a cluster writes its own
//! membership as entry 1, so every node that joins later can replay the whole
//! history from index 1 instead of installing a snapshot.

use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Snapshot,
};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use super::ClusterError;

/// File name of the raft database inside the state directory.
pub const LOG_FILE: &str = "raft.log.redb";

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_entries");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const SNAPSHOT_KEY: &str = "snapshot";

/// Cheaply cloneable handle; `RawNode` and `RaftNode` each hold one.
#[derive(Clone)]
pub struct RaftLogStorage {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    state: RwLock<Cached>,
}

/// In-memory mirror of the metadata table plus the last log index.
#[derive(Default)]
struct Cached {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    last_index: u64,
    /// Application payload attached to snapshots served to peers.
    snapshot_data: Vec<u8>,
}

fn store_error(err: impl std::error::Error + Send + Sync + 'static) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(err)))
}

fn decode_meta<M, T>(table: &T, key: &str) -> Result<Option<M>, ClusterError>
where
    M: ProstMessage + Default,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(bytes) => M::decode(bytes.value())
            .map(Some)
            .map_err(|err| ClusterError::Corrupt(format!("{key}: {err}"))),
        None => Ok(None),
    }
}

impl RaftLogStorage {
    /// Opens (or creates) the raft database inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let db = Database::create(&path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(ENTRIES)?;
            txn.open_table(META)?;
        }
        txn.commit()?;

        let cached = {
            let txn = db.begin_read()?;
            let meta = txn.open_table(META)?;
            let entries = txn.open_table(ENTRIES)?;
            let snapshot: Snapshot = decode_meta(&meta, SNAPSHOT_KEY)?.unwrap_or_default();
            let snapshot_index = snapshot.get_metadata().index;
            let last_entry = entries.last()?.map(|(index, _)| index.value());
            Cached {
                hard_state: decode_meta(&meta, HARD_STATE_KEY)?.unwrap_or_default(),
                conf_state: decode_meta(&meta, CONF_STATE_KEY)?.unwrap_or_default(),
                last_index: last_entry.unwrap_or(snapshot_index).max(snapshot_index),
                snapshot,
                snapshot_data: Vec::new(),
            }
        };

        info!(
            path = %path.display(),
            last_index = cached.last_index,
            term = cached.hard_state.term,
            commit = cached.hard_state.commit,
            voters = ?cached.conf_state.voters,
            "opened raft log"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                state: RwLock::new(cached),
            }),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Cached> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Cached> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once this node holds a membership, either from bootstrapping,
    /// from replaying a join, or from an installed snapshot.
    pub fn is_initialized(&self) -> bool {
        let state = self.read_state();
        !state.conf_state.voters.is_empty() || state.last_index > 0
    }

    pub fn conf_state(&self) -> ConfState {
        self.read_state().conf_state.clone()
    }

    pub fn hard_state(&self) -> HardState {
        self.read_state().hard_state.clone()
    }

    /// Seeds an empty log with a committed entry adding `id` at `address`.
    ///
    /// Followers that join later replay this entry like any other membership
    /// change, which is how they learn the founding member.
    pub fn bootstrap(&self, id: u64, address: &str) -> Result<(), ClusterError> {
        if self.is_initialized() {
            return Err(ClusterError::Corrupt(
                "refusing to bootstrap a non-empty raft log".to_string(),
            ));
        }

        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = id;
        change.context = address.as_bytes().to_vec().into();

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.index = 1;
        entry.term = 1;
        entry.data = change.encode_to_vec().into();

        self.append(&[entry])?;
        let mut hard_state = HardState::default();
        hard_state.term = 1;
        hard_state.commit = 1;
        self.set_hard_state(&hard_state)?;
        self.set_conf_state(&ConfState::from((vec![id], vec![])))?;

        info!(id, address, "bootstrapped single-member raft log");
        Ok(())
    }

    /// Persists `entries`, first discarding any existing suffix they replace.
    pub fn append(&self, entries: &[Entry]) -> Result<(), ClusterError> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        let mut state = self.write_state();
        let snapshot_index = state.snapshot.get_metadata().index;
        if first.index <= snapshot_index {
            return Err(ClusterError::Corrupt(format!(
                "append at {} overlaps snapshot at {snapshot_index}",
                first.index
            )));
        }
        if first.index > state.last_index + 1 {
            return Err(ClusterError::Corrupt(format!(
                "append at {} leaves a gap after {}",
                first.index, state.last_index
            )));
        }

        let txn = self.inner.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            let stale = table
                .range(first.index..)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<Vec<u64>, _>>()?;
            for index in stale {
                table.remove(index)?;
            }
            for entry in entries {
                table.insert(entry.index, entry.encode_to_vec().as_slice())?;
            }
        }
        txn.commit()?;

        state.last_index = last.index;
        Ok(())
    }

    pub fn set_hard_state(&self, hard_state: &HardState) -> Result<(), ClusterError> {
        let mut state = self.write_state();
        self.put_meta(HARD_STATE_KEY, hard_state)?;
        state.hard_state = hard_state.clone();
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), ClusterError> {
        let mut hard_state = self.hard_state();
        hard_state.commit = commit;
        self.set_hard_state(&hard_state)
    }

    pub fn set_conf_state(&self, conf_state: &ConfState) -> Result<(), ClusterError> {
        let mut state = self.write_state();
        self.put_meta(CONF_STATE_KEY, conf_state)?;
        state.conf_state = conf_state.clone();
        Ok(())
    }

    /// Payload attached to snapshots generated for peers.
    pub fn set_snapshot_data(&self, data: Vec<u8>) {
        self.write_state().snapshot_data = data;
    }

    /// Replaces the log with `snapshot`: every entry is dropped and the hard
    /// and conf states are taken from the snapshot metadata.
    pub fn apply_snapshot(&self, mut snapshot: Snapshot) -> Result<(), ClusterError> {
        let mut state = self.write_state();
        let metadata = snapshot.take_metadata();
        if metadata.index <= state.snapshot.get_metadata().index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate).into());
        }

        let mut hard_state = state.hard_state.clone();
        hard_state.term = hard_state.term.max(metadata.term);
        hard_state.commit = metadata.index;
        let conf_state = metadata.get_conf_state().clone();
        let index = metadata.index;
        snapshot.set_metadata(metadata);

        let txn = self.inner.db.begin_write()?;
        {
            txn.delete_table(ENTRIES)?;
            txn.open_table(ENTRIES)?;
            let mut meta = txn.open_table(META)?;
            meta.insert(SNAPSHOT_KEY, snapshot.encode_to_vec().as_slice())?;
            meta.insert(HARD_STATE_KEY, hard_state.encode_to_vec().as_slice())?;
            meta.insert(CONF_STATE_KEY, conf_state.encode_to_vec().as_slice())?;
        }
        txn.commit()?;

        state.snapshot_data = snapshot.data.to_vec();
        state.snapshot = snapshot;
        state.hard_state = hard_state;
        state.conf_state = conf_state;
        state.last_index = index;
        Ok(())
    }

    fn put_meta(&self, key: &str, value: &impl ProstMessage) -> Result<(), ClusterError> {
        let txn = self.inner.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            meta.insert(key, value.encode_to_vec().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_entry(&self, index: u64) -> raft::Result<Option<Entry>> {
        let txn = self.inner.db.begin_read().map_err(store_error)?;
        let table = txn.open_table(ENTRIES).map_err(store_error)?;
        match table.get(index).map_err(store_error)? {
            Some(bytes) => Entry::decode(bytes.value()).map(Some).map_err(store_error),
            None => Ok(None),
        }
    }
}

impl Storage for RaftLogStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let state = self.read_state();
        Ok(RaftState::new(
            state.hard_state.clone(),
            state.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        let state = self.read_state();
        if low <= state.snapshot.get_metadata().index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > state.last_index + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let txn = self.inner.db.begin_read().map_err(store_error)?;
        let table = txn.open_table(ENTRIES).map_err(store_error)?;
        let mut entries = Vec::with_capacity(high.saturating_sub(low) as usize);
        let mut size = 0u64;
        for item in table.range(low..high).map_err(store_error)? {
            let (_, bytes) = item.map_err(store_error)?;
            let entry = Entry::decode(bytes.value()).map_err(store_error)?;
            size += entry.encoded_len() as u64;
            // The first entry is always returned, even when it alone exceeds the limit.
            if !entries.is_empty() && max_size.is_some_and(|max| size > max) {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let state = self.read_state();
        let snapshot = state.snapshot.get_metadata();
        if idx == snapshot.index {
            return Ok(snapshot.term);
        }
        if idx < snapshot.index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > state.last_index {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        self.read_entry(idx)?
            .map(|entry| entry.term)
            .ok_or(raft::Error::Store(StorageError::Unavailable))
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.read_state().snapshot.get_metadata().index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.read_state().last_index)
    }

    /// Snapshot at the current commit index carrying the current membership.
    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let (commit, conf_state, data) = {
            let state = self.read_state();
            (
                state.hard_state.commit,
                state.conf_state.clone(),
                state.snapshot_data.clone(),
            )
        };
        if commit < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let metadata = snapshot.mut_metadata();
        metadata.index = commit;
        metadata.term = self.term(commit)?;
        metadata.set_conf_state(conf_state);
        Ok(snapshot)
    }
}
