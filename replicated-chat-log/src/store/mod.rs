//! Chat log storage.
//!
//! [`ChatLogStore`] is the contract the chat handlers use. Two implementations:
//!
//! - [`LocalLogStore`]: a single `redb` table on this node.
//! - [`ReplicatedLogStore`]: routes writes through the cluster state machine and
//!   materializes committed entries into a local store; reads stay local.
//!
//! # Key layout
//!
//! All records live in one table:
//!
//! - `group ‖ id` → encoded message
//! - `id` → group (reverse index for lookups by id)
//! - `group ‖ u64::MAX` → empty (per-group sentinel, the seek anchor for scans)
//!
//! Ids are big-endian so byte order matches numeric order.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::message::{EventMessage, MessageError};

pub mod local;
pub mod replicated;

pub use local::LocalLogStore;
pub use replicated::{ReplicatedLogStore, ReplicationEnvelope};

pub(crate) const ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no message with id {0}")]
    NotFound(u64),
    #[error("message id must be non-zero")]
    InvalidId,
    #[error("group name must not be empty")]
    InvalidGroup,
    #[error("message already carries id {existing}, refusing to store it as {requested}")]
    IdConflict { existing: u64, requested: u64 },
    #[error("index points at group {group:?} but record {id} is missing")]
    MissingRecord { group: String, id: u64 },
    #[error("message codec error: {0}")]
    Message(#[from] MessageError),
    #[error("replication envelope codec error: {0}")]
    Envelope(#[source] bincode::Error),
    #[error("storage error: {0}")]
    Database(#[from] redb::Error),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

// redb reports each operation with its own error type; funnel them through
// `redb::Error` so callers only deal with one storage variant.
macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Database(err.into())
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

/// Storage contract for the chat log.
pub trait ChatLogStore: Send + Sync {
    /// Stores `message` under `group` with sequence id `id`.
    fn save(&self, group: &str, id: u64, message: EventMessage) -> Result<(), StoreError>;

    /// Newest-first scan of `group`.
    ///
    /// An empty `start_id` starts at the most recent message; otherwise the scan
    /// starts at the literal key `start_id` (inclusive). The first `offset`
    /// records are skipped and at most `limit` messages are returned. Records
    /// that fail to decode are skipped.
    fn get_messages_for(
        &self,
        group: &str,
        start_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EventMessage>, StoreError>;

    fn get_message(&self, id: u64) -> Result<EventMessage, StoreError>;

    /// Retention hook. Does not reclaim space.
    fn cleanup(&self, group: &str);
}

/// Validates a save and stamps `id` into `message` when it carries none.
pub(crate) fn stamp(group: &str, id: u64, message: &mut EventMessage) -> Result<(), StoreError> {
    if id == 0 {
        return Err(StoreError::InvalidId);
    }
    if group.is_empty() {
        return Err(StoreError::InvalidGroup);
    }
    match message.id() {
        0 => message.set_id(id),
        existing if existing != id => {
            return Err(StoreError::IdConflict {
                existing,
                requested: id,
            });
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn id_to_bytes(id: u64) -> [u8; ID_LEN] {
    id.to_be_bytes()
}

/// `group ‖ id`, the primary record key.
pub(crate) fn record_key(group: &str, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.len() + ID_LEN);
    key.extend_from_slice(group.as_bytes());
    key.extend_from_slice(&id_to_bytes(id));
    key
}

/// `group ‖ u64::MAX`, the per-group scan anchor.
pub(crate) fn sentinel_key(group: &str) -> Vec<u8> {
    record_key(group, u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_sort_numerically_within_a_group() {
        let mut keys: Vec<Vec<u8>> = [300u64, 2, 256, 1, 70_000]
            .into_iter()
            .map(|id| record_key("room1", id))
            .collect();
        keys.sort();
        let ids: Vec<u64> = keys
            .iter()
            .map(|k| u64::from_be_bytes(k[5..].try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![1, 2, 256, 300, 70_000]);
    }

    #[test]
    fn sentinel_sorts_after_every_record_of_its_group() {
        let sentinel = sentinel_key("room1");
        assert!(record_key("room1", u64::MAX - 1) < sentinel);
        assert_eq!(sentinel.len(), "room1".len() + ID_LEN);
        assert_eq!(&sentinel[5..], &[0xff; 8]);
    }
}
