//! In-memory storage engine with versioned rows.

use crate::engine::{ExtensionRecord, StorageEngine, StorageHandle, StoragePaths, StoredRow};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Version chain for one row, ascending by commit snapshot.
/// `None` entries are tombstones.
type Versions = Vec<(u64, Option<StoredRow>)>;

#[derive(Default)]
struct EngineState {
    rows: BTreeMap<String, BTreeMap<String, Versions>>,
    extensions: BTreeMap<String, ExtensionRecord>,
    aux: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    stored_snapshot: u64,
}

impl EngineState {
    fn row_at(&self, partition: &str, key: &str, snapshot: u64) -> Option<StoredRow> {
        let versions = self.rows.get(partition)?.get(key)?;
        versions
            .iter()
            .rev()
            .find(|(seq, _)| *seq <= snapshot)
            .and_then(|(_, row)| row.clone())
    }

    fn live_keys_at(&self, partition: &str, snapshot: u64) -> Vec<String> {
        match self.rows.get(partition) {
            Some(keys) => keys
                .iter()
                .filter(|(_, versions)| {
                    versions
                        .iter()
                        .rev()
                        .find(|(seq, _)| *seq <= snapshot)
                        .is_some_and(|(_, row)| row.is_some())
                })
                .map(|(k, _)| k.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Clone)]
enum RowOp {
    Put {
        partition: String,
        key: String,
        row: StoredRow,
    },
    Delete {
        partition: String,
        key: String,
    },
    DeletePartition {
        partition: String,
    },
    DeleteAll,
}

enum MetaOp {
    PutExtension(String, ExtensionRecord),
    DeleteExtension(String),
    AuxPut(String, String, Vec<u8>),
    AuxDelete(String, String),
    AuxDropTable(String),
}

#[derive(Default)]
struct Pending {
    rows: Vec<RowOp>,
    meta: Vec<MetaOp>,
}

enum TxnState {
    Idle,
    Read,
    Write(Pending),
}

/// An in-process storage engine keeping all committed row versions in
/// memory.
///
/// Every commit appends a new version stamped with the commit snapshot,
/// so point reads at older snapshots keep seeing the state they pinned.
/// This mirrors the isolation a WAL-mode SQL engine provides to
/// concurrent read transactions, which makes `MemoryEngine` a faithful
/// stand-in for tests.
///
/// The engine outlives any `Database` opened on it; reopening a
/// database on the same engine instance models a new session against
/// the same storage location.
pub struct MemoryEngine {
    state: Arc<RwLock<EngineState>>,
    paths: StoragePaths,
}

impl MemoryEngine {
    /// Creates a new, empty in-memory engine with a unique synthetic
    /// storage location.
    pub fn new() -> Self {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            paths: StoragePaths::for_main(format!(":memory:/{id}.db")),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn open_handle(&self) -> StorageResult<Box<dyn StorageHandle>> {
        Ok(Box::new(MemoryHandle {
            state: Arc::clone(&self.state),
            txn: TxnState::Idle,
        }))
    }

    fn paths(&self) -> StoragePaths {
        self.paths.clone()
    }
}

struct MemoryHandle {
    state: Arc<RwLock<EngineState>>,
    txn: TxnState,
}

impl MemoryHandle {
    fn pending(&self) -> Option<&Pending> {
        match &self.txn {
            TxnState::Write(pending) => Some(pending),
            _ => None,
        }
    }

    fn pending_mut(&mut self) -> StorageResult<&mut Pending> {
        match &mut self.txn {
            TxnState::Write(pending) => Ok(pending),
            _ => Err(StorageError::invalid_state(
                "write outside a write transaction",
            )),
        }
    }

    fn require_txn(&self) -> StorageResult<()> {
        match self.txn {
            TxnState::Idle => Err(StorageError::invalid_state(
                "read outside a transaction",
            )),
            _ => Ok(()),
        }
    }

    /// Net effect of the pending write ops on one row, if any.
    fn pending_row(&self, partition: &str, key: &str) -> Option<Option<StoredRow>> {
        let pending = self.pending()?;
        let mut effect = None;
        for op in &pending.rows {
            match op {
                RowOp::Put {
                    partition: p,
                    key: k,
                    row,
                } if p == partition && k == key => effect = Some(Some(row.clone())),
                RowOp::Delete {
                    partition: p,
                    key: k,
                } if p == partition && k == key => effect = Some(None),
                RowOp::DeletePartition { partition: p } if p == partition => {
                    effect = Some(None);
                }
                RowOp::DeleteAll => effect = Some(None),
                _ => {}
            }
        }
        effect
    }
}

impl StorageHandle for MemoryHandle {
    fn begin_read(&mut self) -> StorageResult<()> {
        match self.txn {
            TxnState::Idle => {
                self.txn = TxnState::Read;
                Ok(())
            }
            _ => Err(StorageError::invalid_state("transaction already active")),
        }
    }

    fn end_read(&mut self) -> StorageResult<()> {
        match self.txn {
            TxnState::Read => {
                self.txn = TxnState::Idle;
                Ok(())
            }
            _ => Err(StorageError::invalid_state("no read transaction active")),
        }
    }

    fn begin_write(&mut self) -> StorageResult<()> {
        match self.txn {
            TxnState::Idle => {
                self.txn = TxnState::Write(Pending::default());
                Ok(())
            }
            _ => Err(StorageError::invalid_state("transaction already active")),
        }
    }

    fn commit(&mut self, snapshot: u64) -> StorageResult<()> {
        let pending = match std::mem::replace(&mut self.txn, TxnState::Idle) {
            TxnState::Write(pending) => pending,
            other => {
                self.txn = other;
                return Err(StorageError::invalid_state("no write transaction active"));
            }
        };

        let mut state = self.state.write();
        for op in pending.rows {
            match op {
                RowOp::Put {
                    partition,
                    key,
                    row,
                } => {
                    state
                        .rows
                        .entry(partition)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .push((snapshot, Some(row)));
                }
                RowOp::Delete { partition, key } => {
                    state
                        .rows
                        .entry(partition)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .push((snapshot, None));
                }
                RowOp::DeletePartition { partition } => {
                    let live: Vec<String> = state.live_keys_at(&partition, u64::MAX);
                    if let Some(keys) = state.rows.get_mut(&partition) {
                        for key in live {
                            if let Some(versions) = keys.get_mut(&key) {
                                versions.push((snapshot, None));
                            }
                        }
                    }
                }
                RowOp::DeleteAll => {
                    let partitions: Vec<String> = state.rows.keys().cloned().collect();
                    for partition in partitions {
                        let live = state.live_keys_at(&partition, u64::MAX);
                        if let Some(keys) = state.rows.get_mut(&partition) {
                            for key in live {
                                if let Some(versions) = keys.get_mut(&key) {
                                    versions.push((snapshot, None));
                                }
                            }
                        }
                    }
                }
            }
        }
        for op in pending.meta {
            match op {
                MetaOp::PutExtension(name, record) => {
                    state.extensions.insert(name, record);
                }
                MetaOp::DeleteExtension(name) => {
                    state.extensions.remove(&name);
                }
                MetaOp::AuxPut(table, key, value) => {
                    state.aux.entry(table).or_default().insert(key, value);
                }
                MetaOp::AuxDelete(table, key) => {
                    if let Some(rows) = state.aux.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
                MetaOp::AuxDropTable(table) => {
                    state.aux.remove(&table);
                }
            }
        }
        state.stored_snapshot = snapshot;
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        match std::mem::replace(&mut self.txn, TxnState::Idle) {
            TxnState::Write(_) => Ok(()),
            other => {
                self.txn = other;
                Err(StorageError::invalid_state("no write transaction active"))
            }
        }
    }

    fn get(
        &mut self,
        partition: &str,
        key: &str,
        snapshot: u64,
    ) -> StorageResult<Option<StoredRow>> {
        self.require_txn()?;
        if let Some(effect) = self.pending_row(partition, key) {
            return Ok(effect);
        }
        Ok(self.state.read().row_at(partition, key, snapshot))
    }

    fn put(&mut self, partition: &str, key: &str, row: StoredRow) -> StorageResult<()> {
        self.pending_mut()?.rows.push(RowOp::Put {
            partition: partition.to_owned(),
            key: key.to_owned(),
            row,
        });
        Ok(())
    }

    fn delete(&mut self, partition: &str, key: &str) -> StorageResult<()> {
        self.pending_mut()?.rows.push(RowOp::Delete {
            partition: partition.to_owned(),
            key: key.to_owned(),
        });
        Ok(())
    }

    fn delete_partition(&mut self, partition: &str) -> StorageResult<()> {
        self.pending_mut()?.rows.push(RowOp::DeletePartition {
            partition: partition.to_owned(),
        });
        Ok(())
    }

    fn delete_all(&mut self) -> StorageResult<()> {
        self.pending_mut()?.rows.push(RowOp::DeleteAll);
        Ok(())
    }

    fn keys(&mut self, partition: &str, snapshot: u64) -> StorageResult<Vec<String>> {
        self.require_txn()?;
        let mut keys: Vec<String> = self.state.read().live_keys_at(partition, snapshot);
        if let Some(pending) = self.pending() {
            for op in &pending.rows {
                match op {
                    RowOp::Put {
                        partition: p, key, ..
                    } if p == partition => {
                        if !keys.contains(key) {
                            keys.push(key.clone());
                        }
                    }
                    RowOp::Delete { partition: p, key } if p == partition => {
                        keys.retain(|k| k != key);
                    }
                    RowOp::DeletePartition { partition: p } if p == partition => keys.clear(),
                    RowOp::DeleteAll => keys.clear(),
                    _ => {}
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn partitions(&mut self, snapshot: u64) -> StorageResult<Vec<String>> {
        self.require_txn()?;
        let mut names: Vec<String> = {
            let state = self.state.read();
            state.rows.keys().cloned().collect()
        };
        if let Some(pending) = self.pending() {
            for op in &pending.rows {
                if let RowOp::Put { partition, .. } = op {
                    if !names.contains(partition) {
                        names.push(partition.clone());
                    }
                }
            }
        }
        let mut live = Vec::new();
        for name in names {
            if !self.keys(&name, snapshot)?.is_empty() {
                live.push(name);
            }
        }
        live.sort();
        Ok(live)
    }

    fn stored_snapshot(&mut self) -> StorageResult<u64> {
        Ok(self.state.read().stored_snapshot)
    }

    fn extension_record(&mut self, name: &str) -> StorageResult<Option<ExtensionRecord>> {
        if let Some(pending) = self.pending() {
            let mut effect = None;
            for op in &pending.meta {
                match op {
                    MetaOp::PutExtension(n, record) if n == name => {
                        effect = Some(Some(record.clone()));
                    }
                    MetaOp::DeleteExtension(n) if n == name => effect = Some(None),
                    _ => {}
                }
            }
            if let Some(effect) = effect {
                return Ok(effect);
            }
        }
        Ok(self.state.read().extensions.get(name).cloned())
    }

    fn put_extension_record(
        &mut self,
        name: &str,
        record: &ExtensionRecord,
    ) -> StorageResult<()> {
        self.pending_mut()?
            .meta
            .push(MetaOp::PutExtension(name.to_owned(), record.clone()));
        Ok(())
    }

    fn delete_extension_record(&mut self, name: &str) -> StorageResult<()> {
        self.pending_mut()?
            .meta
            .push(MetaOp::DeleteExtension(name.to_owned()));
        Ok(())
    }

    fn extension_records(&mut self) -> StorageResult<Vec<(String, ExtensionRecord)>> {
        let mut records = self.state.read().extensions.clone();
        if let Some(pending) = self.pending() {
            for op in &pending.meta {
                match op {
                    MetaOp::PutExtension(name, record) => {
                        records.insert(name.clone(), record.clone());
                    }
                    MetaOp::DeleteExtension(name) => {
                        records.remove(name);
                    }
                    _ => {}
                }
            }
        }
        Ok(records.into_iter().collect())
    }

    fn aux_get(&mut self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = self.pending() {
            let mut effect = None;
            for op in &pending.meta {
                match op {
                    MetaOp::AuxPut(t, k, value) if t == table && k == key => {
                        effect = Some(Some(value.clone()));
                    }
                    MetaOp::AuxDelete(t, k) if t == table && k == key => effect = Some(None),
                    MetaOp::AuxDropTable(t) if t == table => effect = Some(None),
                    _ => {}
                }
            }
            if let Some(effect) = effect {
                return Ok(effect);
            }
        }
        Ok(self
            .state
            .read()
            .aux
            .get(table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn aux_put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.pending_mut()?
            .meta
            .push(MetaOp::AuxPut(table.to_owned(), key.to_owned(), value));
        Ok(())
    }

    fn aux_delete(&mut self, table: &str, key: &str) -> StorageResult<()> {
        self.pending_mut()?
            .meta
            .push(MetaOp::AuxDelete(table.to_owned(), key.to_owned()));
        Ok(())
    }

    fn aux_drop_table(&mut self, table: &str) -> StorageResult<()> {
        self.pending_mut()?
            .meta
            .push(MetaOp::AuxDropTable(table.to_owned()));
        Ok(())
    }

    fn aux_table_names(&mut self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.state.read().aux.keys().cloned().collect();
        if let Some(pending) = self.pending() {
            for op in &pending.meta {
                match op {
                    MetaOp::AuxPut(table, _, _) => {
                        if !names.contains(table) {
                            names.push(table.clone());
                        }
                    }
                    MetaOp::AuxDropTable(table) => names.retain(|t| t != table),
                    _ => {}
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(bytes: &[u8]) -> StoredRow {
        StoredRow {
            object: bytes.to_vec(),
            metadata: None,
        }
    }

    fn commit_put(handle: &mut Box<dyn StorageHandle>, p: &str, k: &str, v: &[u8], snap: u64) {
        handle.begin_write().unwrap();
        handle.put(p, k, row(v)).unwrap();
        handle.commit(snap).unwrap();
    }

    #[test]
    fn committed_rows_visible_at_snapshot() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        commit_put(&mut handle, "p", "k", &[1], 1);

        handle.begin_read().unwrap();
        assert_eq!(handle.get("p", "k", 1).unwrap(), Some(row(&[1])));
        assert_eq!(handle.get("p", "k", 0).unwrap(), None);
        handle.end_read().unwrap();
    }

    #[test]
    fn old_snapshot_sees_old_version() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        commit_put(&mut handle, "p", "k", &[1], 1);
        commit_put(&mut handle, "p", "k", &[2], 2);

        handle.begin_read().unwrap();
        assert_eq!(handle.get("p", "k", 1).unwrap(), Some(row(&[1])));
        assert_eq!(handle.get("p", "k", 2).unwrap(), Some(row(&[2])));
        handle.end_read().unwrap();
    }

    #[test]
    fn tombstone_hides_row_from_newer_snapshots_only() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        commit_put(&mut handle, "p", "k", &[1], 1);

        handle.begin_write().unwrap();
        handle.delete("p", "k").unwrap();
        handle.commit(2).unwrap();

        handle.begin_read().unwrap();
        assert_eq!(handle.get("p", "k", 1).unwrap(), Some(row(&[1])));
        assert_eq!(handle.get("p", "k", 2).unwrap(), None);
        handle.end_read().unwrap();
    }

    #[test]
    fn pending_writes_visible_to_own_handle_only() {
        let engine = MemoryEngine::new();
        let mut writer = engine.open_handle().unwrap();
        let mut reader = engine.open_handle().unwrap();

        writer.begin_write().unwrap();
        writer.put("p", "k", row(&[9])).unwrap();
        assert_eq!(writer.get("p", "k", 0).unwrap(), Some(row(&[9])));

        reader.begin_read().unwrap();
        assert_eq!(reader.get("p", "k", u64::MAX).unwrap(), None);
        reader.end_read().unwrap();

        writer.rollback().unwrap();
        reader.begin_read().unwrap();
        assert_eq!(reader.get("p", "k", u64::MAX).unwrap(), None);
        reader.end_read().unwrap();
    }

    #[test]
    fn delete_partition_tombstones_all_live_keys() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        commit_put(&mut handle, "p", "a", &[1], 1);
        commit_put(&mut handle, "p", "b", &[2], 2);

        handle.begin_write().unwrap();
        handle.delete_partition("p").unwrap();
        assert!(handle.keys("p", 2).unwrap().is_empty());
        handle.commit(3).unwrap();

        handle.begin_read().unwrap();
        assert_eq!(handle.keys("p", 2).unwrap(), vec!["a", "b"]);
        assert!(handle.keys("p", 3).unwrap().is_empty());
        assert!(handle.partitions(3).unwrap().is_empty());
        handle.end_read().unwrap();
    }

    #[test]
    fn keys_merge_pending_ops() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        commit_put(&mut handle, "p", "a", &[1], 1);

        handle.begin_write().unwrap();
        handle.put("p", "b", row(&[2])).unwrap();
        handle.delete("p", "a").unwrap();
        assert_eq!(handle.keys("p", 1).unwrap(), vec!["b"]);
        handle.rollback().unwrap();
    }

    #[test]
    fn stored_snapshot_advances_on_commit() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        assert_eq!(handle.stored_snapshot().unwrap(), 0);
        commit_put(&mut handle, "p", "k", &[1], 7);
        assert_eq!(handle.stored_snapshot().unwrap(), 7);
    }

    #[test]
    fn extension_records_roundtrip() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        let record = ExtensionRecord {
            class_id: "idx".into(),
            version: 1,
        };

        handle.begin_write().unwrap();
        handle.put_extension_record("names", &record).unwrap();
        assert_eq!(handle.extension_record("names").unwrap(), Some(record.clone()));
        handle.commit(1).unwrap();

        assert_eq!(handle.extension_record("names").unwrap(), Some(record));
        assert_eq!(handle.extension_records().unwrap().len(), 1);

        handle.begin_write().unwrap();
        handle.delete_extension_record("names").unwrap();
        handle.commit(2).unwrap();
        assert_eq!(handle.extension_record("names").unwrap(), None);
    }

    #[test]
    fn extension_records_merge_pending_ops() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        let record = ExtensionRecord {
            class_id: "idx".into(),
            version: 1,
        };

        handle.begin_write().unwrap();
        handle.put_extension_record("a", &record).unwrap();
        handle.commit(1).unwrap();

        handle.begin_write().unwrap();
        handle.put_extension_record("b", &record).unwrap();
        handle.delete_extension_record("a").unwrap();
        let names: Vec<String> = handle
            .extension_records()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["b"]);
        handle.rollback().unwrap();

        let names: Vec<String> = handle
            .extension_records()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn aux_tables_roundtrip_and_drop() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();

        handle.begin_write().unwrap();
        handle.aux_put("t", "k", vec![1]).unwrap();
        assert_eq!(handle.aux_get("t", "k").unwrap(), Some(vec![1]));
        handle.commit(1).unwrap();

        assert_eq!(handle.aux_table_names().unwrap(), vec!["t"]);

        handle.begin_write().unwrap();
        handle.aux_drop_table("t").unwrap();
        assert_eq!(handle.aux_get("t", "k").unwrap(), None);
        handle.commit(2).unwrap();
        assert!(handle.aux_table_names().unwrap().is_empty());
    }

    #[test]
    fn writes_outside_transaction_fail() {
        let engine = MemoryEngine::new();
        let mut handle = engine.open_handle().unwrap();
        assert!(handle.put("p", "k", row(&[1])).is_err());
        assert!(handle.get("p", "k", 0).is_err());
    }

    #[test]
    fn engines_have_unique_paths() {
        let a = MemoryEngine::new();
        let b = MemoryEngine::new();
        assert_ne!(a.paths().main, b.paths().main);
        assert!(a.paths().wal.to_string_lossy().ends_with("-wal"));
        assert!(a.paths().shm.to_string_lossy().ends_with("-shm"));
    }
}
