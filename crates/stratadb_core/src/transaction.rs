//! Read and read-write transaction surfaces.
//!
//! A transaction borrows its connection mutably for its whole body, so
//! a connection can never run two transactions at once. Reads see the
//! connection's pinned snapshot; writes go straight through to the
//! engine handle while a change tracker records what the commit will
//! announce.

use crate::codec::Value;
use crate::connection::Connection;
use crate::error::CoreResult;
use crate::notify::{ChangeSet, PartitionChanges};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use stratadb_storage::{ExtensionRecord, StoredRow};

pub(crate) type RowKey = (String, String);

/// A snapshot-pinned read transaction.
///
/// Every read observes the same snapshot, regardless of writes
/// committed elsewhere while the transaction runs.
pub struct ReadTransaction<'a> {
    conn: &'a mut Connection,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// The snapshot this transaction observes.
    pub fn snapshot(&self) -> u64 {
        self.conn.snapshot()
    }

    /// Reads the object stored for `key` in `partition`.
    pub fn object(&mut self, partition: &str, key: &str) -> CoreResult<Option<Arc<Value>>> {
        self.conn.fetch_object(partition, key)
    }

    /// Reads the metadata stored for `key` in `partition`.
    pub fn metadata(&mut self, partition: &str, key: &str) -> CoreResult<Option<Arc<Value>>> {
        self.conn.fetch_metadata(partition, key)
    }

    /// Whether `key` exists in `partition`.
    pub fn contains_key(&mut self, partition: &str, key: &str) -> CoreResult<bool> {
        self.conn.row_exists(partition, key)
    }

    /// Lists the keys of `partition`.
    pub fn keys(&mut self, partition: &str) -> CoreResult<Vec<String>> {
        self.conn.partition_keys(partition)
    }

    /// Lists the partitions holding at least one key.
    pub fn partitions(&mut self) -> CoreResult<Vec<String>> {
        self.conn.partition_names()
    }

    /// Reads the persisted record for an extension name.
    pub fn extension_record(&mut self, name: &str) -> CoreResult<Option<ExtensionRecord>> {
        Ok(self.conn.handle_mut()?.storage().extension_record(name)?)
    }

    /// Reads a value from an extension-owned auxiliary table.
    pub fn aux_get(&mut self, table: &str, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.conn.handle_mut()?.storage().aux_get(table, key)?)
    }
}

/// Accumulates what a read-write transaction will announce at commit.
#[derive(Default)]
pub(crate) struct ChangeTracker {
    pub(crate) partitions: BTreeMap<String, PartitionChanges>,
    pub(crate) removed_partitions: BTreeSet<String>,
    pub(crate) all_keys_removed: bool,
    /// Sanitized values written this transaction, for cache staging.
    pub(crate) staged_objects: HashMap<RowKey, Arc<Value>>,
    /// `Some(None)` means the metadata plane was cleared.
    pub(crate) staged_metadata: HashMap<RowKey, Option<Arc<Value>>>,
    /// Whether each touched key existed when first touched, for the
    /// inserted/changed classification.
    present_before_touch: HashMap<RowKey, bool>,
    extension_metadata_changed: bool,
    aux_changed: bool,
}

impl ChangeTracker {
    pub(crate) fn is_empty(&self) -> bool {
        !self.all_keys_removed
            && self.removed_partitions.is_empty()
            && self.partitions.values().all(PartitionChanges::is_empty)
            && !self.extension_metadata_changed
            && !self.aux_changed
    }

    pub(crate) fn into_change_set(
        mut self,
        snapshot: u64,
        connection_id: u64,
        extensions: BTreeMap<String, Vec<u8>>,
        custom: Option<Arc<dyn Any + Send + Sync>>,
    ) -> ChangeSet {
        self.partitions.retain(|_, changes| !changes.is_empty());
        ChangeSet {
            snapshot,
            connection_id,
            partitions: self.partitions,
            removed_partitions: self.removed_partitions,
            all_keys_removed: self.all_keys_removed,
            extensions,
            custom,
        }
    }
}

/// A read-write transaction, admitted one at a time by the write
/// coordinator.
///
/// Reads see the transaction's own uncommitted writes; writes are
/// applied to the engine handle immediately and either committed as a
/// unit or rolled back if the body returns an error.
pub struct WriteTransaction<'a> {
    conn: &'a mut Connection,
    changes: ChangeTracker,
    custom: Option<Arc<dyn Any + Send + Sync>>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self {
            conn,
            changes: ChangeTracker::default(),
            custom: None,
        }
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub(crate) fn into_parts(self) -> (ChangeTracker, Option<Arc<dyn Any + Send + Sync>>) {
        (self.changes, self.custom)
    }

    /// The snapshot this transaction started from. The commit, if any,
    /// is stamped with the next snapshot number.
    pub fn snapshot(&self) -> u64 {
        self.conn.snapshot()
    }

    /// Reads the object stored for `key` in `partition`, including
    /// writes made earlier in this transaction.
    pub fn object(&mut self, partition: &str, key: &str) -> CoreResult<Option<Arc<Value>>> {
        let row_key = (partition.to_owned(), key.to_owned());
        if let Some(value) = self.changes.staged_objects.get(&row_key) {
            return Ok(Some(Arc::clone(value)));
        }
        if self.removed_in_transaction(partition, key) {
            return Ok(None);
        }
        self.conn.fetch_object(partition, key)
    }

    /// Reads the metadata stored for `key` in `partition`, including
    /// writes made earlier in this transaction.
    pub fn metadata(&mut self, partition: &str, key: &str) -> CoreResult<Option<Arc<Value>>> {
        let row_key = (partition.to_owned(), key.to_owned());
        if let Some(staged) = self.changes.staged_metadata.get(&row_key) {
            return Ok(staged.clone());
        }
        if self.removed_in_transaction(partition, key) {
            return Ok(None);
        }
        self.conn.fetch_metadata(partition, key)
    }

    /// Whether `key` exists in `partition`, including writes made
    /// earlier in this transaction.
    pub fn contains_key(&mut self, partition: &str, key: &str) -> CoreResult<bool> {
        let row_key = (partition.to_owned(), key.to_owned());
        if self.changes.staged_objects.contains_key(&row_key) {
            return Ok(true);
        }
        if self.removed_in_transaction(partition, key) {
            return Ok(false);
        }
        self.conn.row_exists(partition, key)
    }

    /// Lists the keys of `partition`, including writes made earlier in
    /// this transaction.
    pub fn keys(&mut self, partition: &str) -> CoreResult<Vec<String>> {
        self.conn.partition_keys(partition)
    }

    /// Lists the partitions holding at least one key, including writes
    /// made earlier in this transaction.
    pub fn partitions(&mut self) -> CoreResult<Vec<String>> {
        self.conn.partition_names()
    }

    /// Writes `object` (and its metadata plane) for `key` in
    /// `partition`, creating the key if needed.
    ///
    /// Passing `None` for `metadata` clears any metadata the key had.
    pub fn put(
        &mut self,
        partition: &str,
        key: &str,
        object: Value,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        let present = self.present_before_touch(partition, key)?;

        let registry = self.conn.database().options().codec_registry().clone();
        let (object_value, object_bytes) =
            registry.object_codec(partition).encode(partition, key, object)?;
        let metadata_entry = match metadata {
            Some(value) => {
                let (value, bytes) =
                    registry.metadata_codec(partition).encode(partition, key, value)?;
                Some((Arc::new(value), bytes))
            }
            None => None,
        };

        let row = StoredRow {
            object: object_bytes,
            metadata: metadata_entry.as_ref().map(|(_, bytes)| bytes.clone()),
        };
        self.conn.handle_mut()?.storage().put(partition, key, row)?;

        let changes = self.changes.partitions.entry(partition.to_owned()).or_default();
        if !present {
            changes.inserted.insert(key.to_owned());
        }
        changes.removed.remove(key);
        changes.object_changes.insert(key.to_owned());
        changes.metadata_changes.insert(key.to_owned());

        let row_key = (partition.to_owned(), key.to_owned());
        self.changes
            .staged_objects
            .insert(row_key.clone(), Arc::new(object_value));
        self.changes
            .staged_metadata
            .insert(row_key, metadata_entry.map(|(value, _)| value));
        Ok(())
    }

    /// Replaces the object for an existing key, leaving its metadata
    /// untouched. Returns `false` without writing when the key does not
    /// exist.
    pub fn replace_object(
        &mut self,
        partition: &str,
        key: &str,
        object: Value,
    ) -> CoreResult<bool> {
        let Some(existing) = self.conn.raw_row(partition, key)? else {
            return Ok(false);
        };
        let registry = self.conn.database().options().codec_registry().clone();
        let (object_value, object_bytes) =
            registry.object_codec(partition).encode(partition, key, object)?;
        self.conn.handle_mut()?.storage().put(
            partition,
            key,
            StoredRow {
                object: object_bytes,
                metadata: existing.metadata,
            },
        )?;

        let changes = self.changes.partitions.entry(partition.to_owned()).or_default();
        changes.object_changes.insert(key.to_owned());
        self.changes.staged_objects.insert(
            (partition.to_owned(), key.to_owned()),
            Arc::new(object_value),
        );
        Ok(true)
    }

    /// Replaces the metadata for an existing key, leaving its object
    /// untouched. `None` clears the metadata. Returns `false` without
    /// writing when the key does not exist.
    pub fn replace_metadata(
        &mut self,
        partition: &str,
        key: &str,
        metadata: Option<Value>,
    ) -> CoreResult<bool> {
        let Some(existing) = self.conn.raw_row(partition, key)? else {
            return Ok(false);
        };
        let registry = self.conn.database().options().codec_registry().clone();
        let metadata_entry = match metadata {
            Some(value) => {
                let (value, bytes) =
                    registry.metadata_codec(partition).encode(partition, key, value)?;
                Some((Arc::new(value), bytes))
            }
            None => None,
        };
        self.conn.handle_mut()?.storage().put(
            partition,
            key,
            StoredRow {
                object: existing.object,
                metadata: metadata_entry.as_ref().map(|(_, bytes)| bytes.clone()),
            },
        )?;

        let changes = self.changes.partitions.entry(partition.to_owned()).or_default();
        changes.metadata_changes.insert(key.to_owned());
        self.changes.staged_metadata.insert(
            (partition.to_owned(), key.to_owned()),
            metadata_entry.map(|(value, _)| value),
        );
        Ok(true)
    }

    /// Removes `key` from `partition`. Removing an absent key is a
    /// no-op and is not announced.
    pub fn remove(&mut self, partition: &str, key: &str) -> CoreResult<()> {
        let present = self.present_before_touch(partition, key)?;
        self.conn.handle_mut()?.storage().delete(partition, key)?;

        let row_key = (partition.to_owned(), key.to_owned());
        self.changes.staged_objects.remove(&row_key);
        self.changes.staged_metadata.remove(&row_key);

        let changes = self.changes.partitions.entry(partition.to_owned()).or_default();
        changes.inserted.remove(key);
        changes.object_changes.remove(key);
        changes.metadata_changes.remove(key);
        if present {
            changes.removed.insert(key.to_owned());
        }
        Ok(())
    }

    /// Removes every key in `partition`.
    pub fn remove_partition(&mut self, partition: &str) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().delete_partition(partition)?;
        self.changes.partitions.remove(partition);
        self.changes.removed_partitions.insert(partition.to_owned());
        self.changes.staged_objects.retain(|(p, _), _| p != partition);
        self.changes.staged_metadata.retain(|(p, _), _| p != partition);
        self.changes
            .present_before_touch
            .retain(|(p, _), _| p != partition);
        Ok(())
    }

    /// Removes every key in every partition.
    pub fn remove_all(&mut self) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().delete_all()?;
        self.changes.partitions.clear();
        self.changes.removed_partitions.clear();
        self.changes.all_keys_removed = true;
        self.changes.staged_objects.clear();
        self.changes.staged_metadata.clear();
        self.changes.present_before_touch.clear();
        Ok(())
    }

    /// Attaches a caller-supplied payload to this transaction's change
    /// set. Later calls replace earlier ones.
    pub fn set_custom_payload(&mut self, payload: Arc<dyn Any + Send + Sync>) {
        self.custom = Some(payload);
    }

    /// Reads a value from an extension-owned auxiliary table.
    pub fn aux_get(&mut self, table: &str, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.conn.handle_mut()?.storage().aux_get(table, key)?)
    }

    /// Writes a value into an extension-owned auxiliary table.
    pub fn aux_put(&mut self, table: &str, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().aux_put(table, key, value)?;
        self.changes.aux_changed = true;
        Ok(())
    }

    /// Deletes a value from an extension-owned auxiliary table.
    pub fn aux_delete(&mut self, table: &str, key: &str) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().aux_delete(table, key)?;
        self.changes.aux_changed = true;
        Ok(())
    }

    /// Drops an extension-owned auxiliary table.
    pub fn aux_drop_table(&mut self, table: &str) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().aux_drop_table(table)?;
        self.changes.aux_changed = true;
        Ok(())
    }

    /// Lists the auxiliary tables that currently exist.
    pub fn aux_table_names(&mut self) -> CoreResult<Vec<String>> {
        Ok(self.conn.handle_mut()?.storage().aux_table_names()?)
    }

    /// Reads the persisted record for an extension name.
    pub fn extension_record(&mut self, name: &str) -> CoreResult<Option<ExtensionRecord>> {
        Ok(self.conn.handle_mut()?.storage().extension_record(name)?)
    }

    pub(crate) fn put_extension_record(
        &mut self,
        name: &str,
        record: &ExtensionRecord,
    ) -> CoreResult<()> {
        self.conn
            .handle_mut()?
            .storage()
            .put_extension_record(name, record)?;
        self.changes.extension_metadata_changed = true;
        Ok(())
    }

    pub(crate) fn delete_extension_record(&mut self, name: &str) -> CoreResult<()> {
        self.conn.handle_mut()?.storage().delete_extension_record(name)?;
        self.changes.extension_metadata_changed = true;
        Ok(())
    }

    /// Partitions with at least one pending key-level change, for
    /// extensions updating derived state before the commit.
    pub fn changed_partitions(&self) -> Vec<String> {
        self.changes
            .partitions
            .iter()
            .filter(|(_, changes)| !changes.is_empty())
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    /// Keys inserted in `partition` so far this transaction.
    pub fn inserted_keys(&self, partition: &str) -> Vec<String> {
        self.key_set(partition, |changes| &changes.inserted)
    }

    /// Keys removed from `partition` so far this transaction.
    pub fn removed_keys(&self, partition: &str) -> Vec<String> {
        self.key_set(partition, |changes| &changes.removed)
    }

    /// Keys whose object changed in `partition` so far this
    /// transaction, including inserts.
    pub fn object_changed_keys(&self, partition: &str) -> Vec<String> {
        self.key_set(partition, |changes| &changes.object_changes)
    }

    /// Keys whose metadata changed in `partition` so far this
    /// transaction, including inserts.
    pub fn metadata_changed_keys(&self, partition: &str) -> Vec<String> {
        self.key_set(partition, |changes| &changes.metadata_changes)
    }

    /// Partitions removed wholesale so far this transaction.
    pub fn removed_partition_names(&self) -> Vec<String> {
        self.changes.removed_partitions.iter().cloned().collect()
    }

    /// Whether this transaction removed every key in the database.
    pub fn all_keys_removed(&self) -> bool {
        self.changes.all_keys_removed
    }

    fn key_set(
        &self,
        partition: &str,
        select: impl Fn(&PartitionChanges) -> &BTreeSet<String>,
    ) -> Vec<String> {
        self.changes
            .partitions
            .get(partition)
            .map(|changes| select(changes).iter().cloned().collect())
            .unwrap_or_default()
    }

    fn removed_in_transaction(&self, partition: &str, key: &str) -> bool {
        if self.changes.all_keys_removed || self.changes.removed_partitions.contains(partition) {
            return true;
        }
        self.changes
            .partitions
            .get(partition)
            .is_some_and(|changes| changes.removed.contains(key))
    }

    fn present_before_touch(&mut self, partition: &str, key: &str) -> CoreResult<bool> {
        let row_key = (partition.to_owned(), key.to_owned());
        if let Some(&present) = self.changes.present_before_touch.get(&row_key) {
            return Ok(present);
        }
        let present = self.conn.row_exists(partition, key)?;
        self.changes.present_before_touch.insert(row_key, present);
        Ok(present)
    }
}
