//! Durable chat log on this node, backed by a single `redb` table.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::{debug, info};

use super::{ChatLogStore, ID_LEN, StoreError, id_to_bytes, record_key, sentinel_key, stamp};
use crate::message::EventMessage;

/// Table name used by the node binary.
pub const DEFAULT_TABLE: &str = "chats";

pub struct LocalLogStore {
    db: Database,
    table: String,
}

impl LocalLogStore {
    /// Opens (or creates) the database file at `path`, using `table` as the
    /// single section holding every key shape.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path)?;
        info!(path = %path.display(), table, "opened chat log store");
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    fn table(&self) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
        TableDefinition::new(&self.table)
    }
}

/// True for `group ‖ id` keys of exactly this group, sentinel included.
fn belongs_to(key: &[u8], group: &str) -> bool {
    key.len() == group.len() + ID_LEN && key.starts_with(group.as_bytes())
}

impl ChatLogStore for LocalLogStore {
    fn save(&self, group: &str, id: u64, mut message: EventMessage) -> Result<(), StoreError> {
        stamp(group, id, &mut message)?;
        let bytes = message.encode()?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(self.table())?;
            table.insert(record_key(group, id).as_slice(), bytes.as_slice())?;
            table.insert(id_to_bytes(id).as_slice(), group.as_bytes())?;
            table.insert(sentinel_key(group).as_slice(), b"".as_slice())?;
        }
        txn.commit()?;

        debug!(group, id, kind = message.kind().name(), "saved message");
        Ok(())
    }

    fn get_messages_for(
        &self,
        group: &str,
        start_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EventMessage>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(self.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let sentinel = sentinel_key(group);
        let anchor = if start_id.is_empty() {
            sentinel.clone()
        } else {
            start_id.as_bytes().to_vec()
        };

        let mut messages = Vec::new();
        let mut skipped = 0;
        for entry in table.range(..=anchor.as_slice())?.rev() {
            if messages.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(group.as_bytes()) {
                break;
            }
            // Longer group names sharing this prefix interleave with our keys.
            if !belongs_to(key, group) || key == sentinel.as_slice() {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            match EventMessage::decode(value.value()) {
                Ok(message) => messages.push(message),
                Err(err) => debug!(group, error = %err, "skipping undecodable record"),
            }
        }

        Ok(messages)
    }

    fn get_message(&self, id: u64) -> Result<EventMessage, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(self.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Err(StoreError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };

        let Some(group) = table.get(id_to_bytes(id).as_slice())? else {
            return Err(StoreError::NotFound(id));
        };
        let group = String::from_utf8_lossy(group.value()).into_owned();

        let Some(record) = table.get(record_key(&group, id).as_slice())? else {
            return Err(StoreError::MissingRecord { group, id });
        };
        Ok(EventMessage::decode(record.value())?)
    }

    fn cleanup(&self, group: &str) {
        debug!(group, "cleanup requested; retention is not enforced");
    }
}
