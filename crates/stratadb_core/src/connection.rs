//! Connections: snapshot-pinned access points with per-connection
//! caches.

use crate::codec::Value;
use crate::config::{CachePolicy, ConnectionConfig};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::pool::PooledHandle;
use crate::transaction::{ChangeTracker, ReadTransaction, RowKey, WriteTransaction};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use stratadb_storage::StoredRow;

/// One access point to the database.
///
/// A connection runs one transaction at a time (the transaction borrows
/// it mutably) and carries its own decoded-object and decoded-metadata
/// caches, sized and governed by its [`ConnectionConfig`]. Connections
/// are cheap: the expensive engine handle underneath is recycled
/// through the connection pool when the connection is dropped.
pub struct Connection {
    db: Database,
    handle: Option<PooledHandle>,
    id: u64,
    config: ConnectionConfig,
    snapshot: u64,
    object_cache: Option<LruCache<RowKey, Arc<Value>>>,
    metadata_cache: Option<LruCache<RowKey, Arc<Value>>>,
}

fn build_cache(enabled: bool, limit: usize) -> Option<LruCache<RowKey, Arc<Value>>> {
    let limit = NonZeroUsize::new(limit)?;
    enabled.then(|| LruCache::new(limit))
}

impl Connection {
    pub(crate) fn new(
        db: Database,
        handle: PooledHandle,
        id: u64,
        config: ConnectionConfig,
        snapshot: u64,
    ) -> Self {
        let object_cache = build_cache(config.object_cache_enabled, config.object_cache_limit);
        let metadata_cache =
            build_cache(config.metadata_cache_enabled, config.metadata_cache_limit);
        Self {
            db,
            handle: Some(handle),
            id,
            config,
            snapshot,
            object_cache,
            metadata_cache,
        }
    }

    /// Identifier of this connection, carried in the change sets of the
    /// commits it performs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The snapshot this connection last observed.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// This connection's configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The database this connection belongs to.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs a read transaction. Every read inside the closure observes
    /// the snapshot pinned at entry, regardless of concurrent commits.
    pub fn read<T>(
        &mut self,
        f: impl FnOnce(&mut ReadTransaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.handle_mut()?.storage().begin_read()?;
        let result = (|| {
            let stored = self.handle_mut()?.storage().stored_snapshot()?;
            self.observe_snapshot(stored);
            let mut tx = ReadTransaction::new(self);
            f(&mut tx)
        })();
        if let Ok(handle) = self.handle_mut() {
            let _ = handle.storage().end_read();
        }
        if self.config.auto_flush_memory {
            self.flush_memory();
        }
        result
    }

    /// Runs a read-write transaction, blocking until the write slot is
    /// free.
    ///
    /// If the body returns an error the transaction is rolled back, the
    /// snapshot counter is not advanced, and nothing is announced. A
    /// body that writes nothing also commits nothing.
    pub fn read_write<T>(
        &mut self,
        body: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let db = self.db.clone();
        let ticket = db.write_queue().ticket();
        let guard = db.write_queue().admit(ticket);
        let outcome = crate::database::run_write(&db, self, body);
        if matches!(&outcome, Ok((_, Some(_)))) {
            crate::extension::run_pending_sweep(&db);
        }
        drop(guard);
        if self.config.auto_flush_memory {
            self.flush_memory();
        }
        outcome.map(|(value, _)| value)
    }

    /// Queues a read-write transaction and returns immediately.
    ///
    /// The write order slot is claimed now, so transactions run in
    /// submission order relative to all other writers, sync or async.
    /// The connection is handed back through `completion`, delivered on
    /// `queue` (or the database's default completion queue).
    pub fn read_write_async<F, C>(
        mut self,
        body: F,
        queue: Option<Arc<crate::completion::CompletionQueue>>,
        completion: C,
    ) where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<()> + Send + 'static,
        C: FnOnce(Connection, CoreResult<()>) + Send + 'static,
    {
        let db = self.db.clone();
        let submitter = db.clone();
        let ticket = submitter.write_queue().ticket();
        submitter.write_queue().submit(Box::new(move || {
            let guard = db.write_queue().admit(ticket);
            let outcome = crate::database::run_write(&db, &mut self, body);
            if matches!(&outcome, Ok((_, Some(_)))) {
                crate::extension::run_pending_sweep(&db);
            }
            drop(guard);
            if self.config.auto_flush_memory {
                self.flush_memory();
            }
            let result = outcome.map(|(value, _)| value);
            let queue = queue.unwrap_or_else(|| db.default_completion_queue());
            queue.post(Box::new(move || completion(self, result)));
        }));
    }

    /// Empties this connection's caches.
    pub fn flush_memory(&mut self) {
        if let Some(cache) = &mut self.object_cache {
            cache.clear();
        }
        if let Some(cache) = &mut self.metadata_cache {
            cache.clear();
        }
    }

    pub(crate) fn handle_mut(&mut self) -> CoreResult<&mut PooledHandle> {
        self.handle
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("connection handle already released"))
    }

    /// Moves to `snapshot`, dropping cached values from the old one.
    pub(crate) fn observe_snapshot(&mut self, snapshot: u64) {
        if snapshot != self.snapshot {
            self.snapshot = snapshot;
            self.flush_memory();
        }
    }

    pub(crate) fn fetch_object(
        &mut self,
        partition: &str,
        key: &str,
    ) -> CoreResult<Option<Arc<Value>>> {
        let row_key = (partition.to_owned(), key.to_owned());
        if let Some(cache) = &mut self.object_cache {
            if let Some(value) = cache.get(&row_key) {
                return Ok(Some(Arc::clone(value)));
            }
        }
        let snapshot = self.snapshot;
        let row = self.handle_mut()?.storage().get(partition, key, snapshot)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value = self
            .db
            .options()
            .codec_registry()
            .object_codec(partition)
            .decode(partition, key, &row.object)?;
        let value = Arc::new(value);
        if let Some(cache) = &mut self.object_cache {
            cache.put(row_key, Arc::clone(&value));
        }
        Ok(Some(value))
    }

    pub(crate) fn fetch_metadata(
        &mut self,
        partition: &str,
        key: &str,
    ) -> CoreResult<Option<Arc<Value>>> {
        let row_key = (partition.to_owned(), key.to_owned());
        if let Some(cache) = &mut self.metadata_cache {
            if let Some(value) = cache.get(&row_key) {
                return Ok(Some(Arc::clone(value)));
            }
        }
        let snapshot = self.snapshot;
        let row = self.handle_mut()?.storage().get(partition, key, snapshot)?;
        let Some(bytes) = row.and_then(|row| row.metadata) else {
            return Ok(None);
        };
        let value = self
            .db
            .options()
            .codec_registry()
            .metadata_codec(partition)
            .decode(partition, key, &bytes)?;
        let value = Arc::new(value);
        if let Some(cache) = &mut self.metadata_cache {
            cache.put(row_key, Arc::clone(&value));
        }
        Ok(Some(value))
    }

    /// Existence check straight from the handle; never consults the
    /// caches, so it stays correct mid-write-transaction.
    pub(crate) fn row_exists(&mut self, partition: &str, key: &str) -> CoreResult<bool> {
        let snapshot = self.snapshot;
        Ok(self
            .handle_mut()?
            .storage()
            .get(partition, key, snapshot)?
            .is_some())
    }

    pub(crate) fn raw_row(
        &mut self,
        partition: &str,
        key: &str,
    ) -> CoreResult<Option<StoredRow>> {
        let snapshot = self.snapshot;
        Ok(self.handle_mut()?.storage().get(partition, key, snapshot)?)
    }

    pub(crate) fn partition_keys(&mut self, partition: &str) -> CoreResult<Vec<String>> {
        let snapshot = self.snapshot;
        Ok(self.handle_mut()?.storage().keys(partition, snapshot)?)
    }

    pub(crate) fn partition_names(&mut self) -> CoreResult<Vec<String>> {
        let snapshot = self.snapshot;
        Ok(self.handle_mut()?.storage().partitions(snapshot)?)
    }

    pub(crate) fn begin_engine_write(&mut self) -> CoreResult<()> {
        Ok(self.handle_mut()?.storage().begin_write()?)
    }

    pub(crate) fn commit_engine_write(&mut self, snapshot: u64) -> CoreResult<()> {
        Ok(self.handle_mut()?.storage().commit(snapshot)?)
    }

    pub(crate) fn rollback_engine_write(&mut self) -> CoreResult<()> {
        Ok(self.handle_mut()?.storage().rollback()?)
    }

    /// Applies a committed transaction's effects to this connection:
    /// advance the snapshot and reconcile the caches per policy.
    pub(crate) fn finish_commit(&mut self, snapshot: u64, changes: &ChangeTracker) {
        self.snapshot = snapshot;
        if changes.all_keys_removed || !changes.removed_partitions.is_empty() {
            self.flush_memory();
            return;
        }
        for (partition, partition_changes) in &changes.partitions {
            for key in &partition_changes.removed {
                let row_key = (partition.clone(), key.clone());
                if let Some(cache) = &mut self.object_cache {
                    cache.pop(&row_key);
                }
                if let Some(cache) = &mut self.metadata_cache {
                    cache.pop(&row_key);
                }
            }
        }
        if let Some(cache) = &mut self.object_cache {
            match self.config.object_policy {
                CachePolicy::Share => {
                    for (row_key, value) in &changes.staged_objects {
                        cache.put(row_key.clone(), Arc::clone(value));
                    }
                }
                CachePolicy::Containment => {
                    for row_key in changes.staged_objects.keys() {
                        cache.pop(row_key);
                    }
                }
            }
        }
        if let Some(cache) = &mut self.metadata_cache {
            match self.config.metadata_policy {
                CachePolicy::Share => {
                    for (row_key, staged) in &changes.staged_metadata {
                        match staged {
                            Some(value) => {
                                cache.put(row_key.clone(), Arc::clone(value));
                            }
                            None => {
                                cache.pop(row_key);
                            }
                        }
                    }
                }
                CachePolicy::Containment => {
                    for row_key in changes.staged_metadata.keys() {
                        cache.pop(row_key);
                    }
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.db.pool().release(handle);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
