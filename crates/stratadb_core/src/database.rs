//! The database root: shared state, opening, and the commit path.

use crate::completion::CompletionQueue;
use crate::config::{ConnectionConfig, Options};
use crate::connection::Connection;
use crate::error::{CoreError, CoreResult};
use crate::extension::{self, Extension, ExtensionRegistry};
use crate::notify::{ChangeNotifier, ChangeSet, DatabaseEvent, ExternalNotifier};
use crate::pool::ConnectionPool;
use crate::snapshot::SnapshotCounter;
use crate::transaction::WriteTransaction;
use crate::write_queue::WriteQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use stratadb_storage::{MemoryEngine, StorageEngine, StoragePaths};

/// Storage locations currently held open by this process. Two live
/// database instances over one location would each believe they owned
/// the write slot, so opening is refused.
fn open_locations() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCATIONS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCATIONS.get_or_init(|| Mutex::new(HashSet::new()))
}

pub(crate) struct DatabaseInner {
    engine: Arc<dyn StorageEngine>,
    paths: StoragePaths,
    options: Options,
    snapshot: SnapshotCounter,
    pool: ConnectionPool,
    write_queue: WriteQueue,
    registry: ExtensionRegistry,
    notifier: ChangeNotifier,
    delivery: Arc<CompletionQueue>,
    next_connection_id: AtomicU64,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        self.notifier.publish(DatabaseEvent::Closed {
            paths: self.paths.clone(),
        });
        open_locations().lock().remove(&self.paths.main);
        tracing::debug!(path = %self.paths.main.display(), "database closed");
    }
}

/// An embedded, multi-connection database.
///
/// `Database` is a cheap handle over shared state: clone it freely and
/// hand clones across threads. The storage location is released, and a
/// [`DatabaseEvent::Closed`] published, when the last handle and the
/// last connection are dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database over `engine`.
    ///
    /// The snapshot counter resumes from the engine's persisted
    /// snapshot, and extensions persisted by earlier sessions are noted
    /// for the orphan sweep. Fails if this process already holds the
    /// location open.
    pub fn open(engine: Arc<dyn StorageEngine>, options: Options) -> CoreResult<Database> {
        let paths = engine.paths();
        {
            let mut locations = open_locations().lock();
            if !locations.insert(paths.main.clone()) {
                return Err(CoreError::AlreadyOpen {
                    path: paths.main.display().to_string(),
                });
            }
        }
        match Self::open_registered(engine, options, paths.clone()) {
            Ok(db) => Ok(db),
            Err(e) => {
                open_locations().lock().remove(&paths.main);
                Err(e)
            }
        }
    }

    /// Opens a database over a fresh in-memory engine.
    pub fn open_in_memory() -> CoreResult<Database> {
        Self::open(Arc::new(MemoryEngine::new()), Options::default())
    }

    fn open_registered(
        engine: Arc<dyn StorageEngine>,
        options: Options,
        paths: StoragePaths,
    ) -> CoreResult<Database> {
        let mut handle = engine.open_handle()?;
        let stored = handle.stored_snapshot()?;
        let persisted = handle.extension_records()?;
        drop(handle);

        let previously_registered: Vec<String> =
            persisted.into_iter().map(|(name, _)| name).collect();
        tracing::info!(
            path = %paths.main.display(),
            snapshot = stored,
            persisted_extensions = previously_registered.len(),
            "database opened"
        );

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                pool: ConnectionPool::new(Arc::clone(&engine)),
                engine,
                paths,
                options,
                snapshot: SnapshotCounter::new(stored),
                write_queue: WriteQueue::new(),
                registry: ExtensionRegistry::new(previously_registered),
                notifier: ChangeNotifier::new(),
                delivery: Arc::new(CompletionQueue::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    /// The file path triple of this database's storage location.
    pub fn paths(&self) -> &StoragePaths {
        &self.inner.paths
    }

    /// The options this database was opened with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// The current snapshot number: the number of mutating read-write
    /// transactions committed against this storage location.
    pub fn snapshot(&self) -> u64 {
        self.inner.snapshot.current()
    }

    /// Creates a new connection, inheriting the database's connection
    /// defaults unless `config` overrides them.
    pub fn new_connection(&self, config: Option<ConnectionConfig>) -> CoreResult<Connection> {
        let config = config.unwrap_or_else(|| self.inner.options.connection_defaults.clone());
        let handle = self.inner.pool.acquire()?;
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Ok(Connection::new(
            self.clone(),
            handle,
            id,
            config,
            self.snapshot(),
        ))
    }

    /// Subscribes to this database's event feed.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<DatabaseEvent> {
        self.inner.notifier.subscribe()
    }

    /// Registers `extension` under `name`, installing its persistent
    /// structures in their own commit.
    ///
    /// Returns `Ok(false)`, with no side effects, when an extension is
    /// already active under `name`. Install failures roll the
    /// registration back and propagate.
    pub fn register_extension(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
        config: Option<ConnectionConfig>,
    ) -> CoreResult<bool> {
        let mut conn = self.new_connection(config)?;
        let ticket = self.inner.write_queue.ticket();
        let guard = self.inner.write_queue.admit(ticket);
        let result = extension::register_locked(self, &mut conn, name, extension);
        drop(guard);
        result
    }

    /// Queues a registration on the write coordinator, claiming its
    /// write order slot now. `completion` receives whether the
    /// extension became active, delivered on `queue` (or the default
    /// completion queue).
    pub fn async_register_extension(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
        config: Option<ConnectionConfig>,
        queue: Option<Arc<CompletionQueue>>,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        let db = self.clone();
        let name = name.to_owned();
        let ticket = self.inner.write_queue.ticket();
        self.inner.write_queue.submit(Box::new(move || {
            // The slot is taken before anything fallible: the guard must
            // be released even when no connection can be acquired, or no
            // later writer would ever be admitted.
            let guard = db.inner.write_queue.admit(ticket);
            let result = db
                .new_connection(config)
                .and_then(|mut conn| extension::register_locked(&db, &mut conn, &name, extension));
            drop(guard);
            let ready = match result {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "async extension registration failed");
                    false
                }
            };
            let queue = queue.unwrap_or_else(|| db.default_completion_queue());
            queue.post(Box::new(move || completion(ready)));
        }));
    }

    /// Unregisters the extension named `name`, tearing down its
    /// persistent structures in their own commit.
    ///
    /// Works without a live instance: the persisted class identifier is
    /// used to build a transient one from the registered extension
    /// classes. Unregistering an unknown name is a no-op.
    pub fn unregister_extension(&self, name: &str) -> CoreResult<()> {
        let mut conn = self.new_connection(None)?;
        let ticket = self.inner.write_queue.ticket();
        let guard = self.inner.write_queue.admit(ticket);
        let result = extension::unregister_locked(self, &mut conn, name);
        drop(guard);
        result
    }

    /// Queues an unregistration on the write coordinator, claiming its
    /// write order slot now.
    pub fn async_unregister_extension(
        &self,
        name: &str,
        queue: Option<Arc<CompletionQueue>>,
        completion: impl FnOnce() + Send + 'static,
    ) {
        let db = self.clone();
        let name = name.to_owned();
        let ticket = self.inner.write_queue.ticket();
        self.inner.write_queue.submit(Box::new(move || {
            // Slot first, fallible work second, as in registration.
            let guard = db.inner.write_queue.admit(ticket);
            let result = db
                .new_connection(None)
                .and_then(|mut conn| extension::unregister_locked(&db, &mut conn, &name));
            drop(guard);
            if let Err(e) = result {
                tracing::warn!(name = %name, error = %e, "async extension unregistration failed");
            }
            let queue = queue.unwrap_or_else(|| db.default_completion_queue());
            queue.post(Box::new(completion));
        }));
    }

    /// Queues a barrier behind every previously queued write and
    /// registration request; `completion` runs once they have all
    /// finished, delivered on `queue` (or the default completion
    /// queue).
    pub fn flush_extension_requests(
        &self,
        queue: Option<Arc<CompletionQueue>>,
        completion: impl FnOnce() + Send + 'static,
    ) {
        let db = self.clone();
        let ticket = self.inner.write_queue.ticket();
        self.inner.write_queue.submit(Box::new(move || {
            // Claiming and releasing the slot is the barrier.
            drop(db.inner.write_queue.admit(ticket));
            let queue = queue.unwrap_or_else(|| db.default_completion_queue());
            queue.post(Box::new(completion));
        }));
    }

    /// The active extension registered under `name`, if any.
    pub fn registered_extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.inner.registry.active_instance(name)
    }

    /// All active extensions, keyed by name.
    pub fn registered_extensions(&self) -> BTreeMap<String, Arc<dyn Extension>> {
        self.inner.registry.active_extensions().into_iter().collect()
    }

    /// Names of extensions persisted by an earlier session and not yet
    /// re-registered or swept. Cleared by the orphan sweep at the first
    /// mutating commit.
    pub fn previously_registered_extension_names(&self) -> Vec<String> {
        self.inner.registry.previously_registered()
    }

    /// Idle capacity of the connection pool.
    pub fn connection_pool_capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Sets the idle capacity of the connection pool.
    pub fn set_connection_pool_capacity(&self, capacity: usize) {
        self.inner.pool.set_capacity(capacity);
    }

    /// Idle lifetime of pooled handles. `Duration::ZERO` means eviction
    /// is disabled.
    pub fn connection_pool_lifetime(&self) -> Duration {
        self.inner.pool.lifetime()
    }

    /// Sets the idle lifetime of pooled handles. `Duration::ZERO`
    /// disables eviction. Applies to handles pooled after the call.
    pub fn set_connection_pool_lifetime(&self, lifetime: Duration) {
        self.inner.pool.set_lifetime(lifetime);
    }

    /// Installs the hook invoked after each local commit, for telling
    /// sibling processes to resync. Requires multiprocess support.
    pub fn set_external_notifier(&self, notifier: Arc<dyn ExternalNotifier>) -> CoreResult<()> {
        if !self.inner.options.multiprocess_support {
            return Err(CoreError::invalid_operation(
                "external notifier requires multiprocess support",
            ));
        }
        self.inner.notifier.set_external(notifier);
        Ok(())
    }

    /// Tells this instance that a sibling process committed to the
    /// storage location: advances the snapshot counter to the persisted
    /// snapshot and publishes a [`DatabaseEvent::ModifiedExternally`].
    pub fn note_external_modification(&self) -> CoreResult<()> {
        if !self.inner.options.multiprocess_support {
            return Err(CoreError::invalid_operation(
                "external modification tracking requires multiprocess support",
            ));
        }
        let mut handle = self.inner.pool.acquire()?;
        let stored = handle.storage().stored_snapshot()?;
        self.inner.pool.release(handle);
        self.inner.snapshot.advance_to(stored);
        self.inner
            .notifier
            .publish(DatabaseEvent::ModifiedExternally { snapshot: stored });
        Ok(())
    }

    /// The queue async completions are delivered on when the caller
    /// does not supply one.
    pub fn default_completion_queue(&self) -> Arc<CompletionQueue> {
        Arc::clone(&self.inner.delivery)
    }

    pub(crate) fn write_queue(&self) -> &WriteQueue {
        &self.inner.write_queue
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn registry(&self) -> &ExtensionRegistry {
        &self.inner.registry
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("paths", &self.inner.paths)
            .field("snapshot", &self.snapshot())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// Runs one read-write transaction body against `conn` and commits or
/// rolls back. The caller must hold the write slot.
///
/// Returns the published change set alongside the body's value, or
/// `None` when nothing was written (the engine transaction is rolled
/// back and the snapshot counter left alone).
pub(crate) fn run_write<T>(
    db: &Database,
    conn: &mut Connection,
    body: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
) -> CoreResult<(T, Option<Arc<ChangeSet>>)> {
    // Holding the write slot, the counter is the committed state.
    conn.observe_snapshot(db.snapshot());
    conn.begin_engine_write()?;

    let body_outcome = {
        let mut tx = WriteTransaction::new(conn);
        match body(&mut tx) {
            Ok(value) => {
                let mut blobs = BTreeMap::new();
                if tx.has_changes() {
                    for (name, extension) in db.registry().active_extensions() {
                        if let Some(blob) = extension.commit_changeset(&mut tx) {
                            blobs.insert(name, blob);
                        }
                    }
                }
                Ok((value, tx.into_parts(), blobs))
            }
            Err(e) => Err(e),
        }
    };

    let (value, (changes, custom), blobs) = match body_outcome {
        Ok(parts) => parts,
        Err(e) => {
            if let Err(rollback_err) = conn.rollback_engine_write() {
                tracing::warn!(error = %rollback_err, "rollback after failed transaction body");
            }
            return Err(e);
        }
    };

    if changes.is_empty() {
        conn.rollback_engine_write()?;
        return Ok((value, None));
    }

    let new_snapshot = db.snapshot() + 1;
    if let Err(e) = conn.commit_engine_write(new_snapshot) {
        let _ = conn.rollback_engine_write();
        return Err(e);
    }
    db.inner.snapshot.increment();
    conn.finish_commit(new_snapshot, &changes);

    let change_set = Arc::new(changes.into_change_set(new_snapshot, conn.id(), blobs, custom));
    db.notifier()
        .publish(DatabaseEvent::Modified(Arc::clone(&change_set)));
    if db.options().multiprocess_support {
        if let Some(external) = db.notifier().external() {
            external.post_commit(&change_set);
        }
    }
    tracing::trace!(
        snapshot = new_snapshot,
        connection = change_set.connection_id,
        "transaction committed"
    );
    Ok((value, Some(change_set)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::error::CoreResult;
    use crate::transaction::WriteTransaction;
    use parking_lot::Mutex as PlMutex;
    use std::sync::mpsc;
    use stratadb_storage::MemoryEngine;

    fn int(n: i64) -> Value {
        Value::Integer(n.into())
    }

    fn as_int(value: &Value) -> i64 {
        match value {
            Value::Integer(i) => i128::from(*i) as i64,
            other => panic!("expected integer, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_counts_mutating_commits() {
        let db = Database::open_in_memory().unwrap();
        let mut conn = db.new_connection(None).unwrap();
        assert_eq!(db.snapshot(), 0);

        for n in 1..=5i64 {
            conn.read_write(|tx| tx.put("p", "k", int(n), None)).unwrap();
            assert_eq!(db.snapshot(), n as u64);
        }
    }

    #[test]
    fn empty_transaction_commits_nothing() {
        let db = Database::open_in_memory().unwrap();
        let rx = db.subscribe();
        let mut conn = db.new_connection(None).unwrap();

        conn.read_write(|_tx| Ok(())).unwrap();
        assert_eq!(db.snapshot(), 0);
        assert!(rx.try_recv().is_err());

        // Removing an absent key writes nothing either.
        conn.read_write(|tx| tx.remove("p", "missing")).unwrap();
        assert_eq!(db.snapshot(), 0);
    }

    #[test]
    fn failed_body_rolls_back_without_advancing_the_counter() {
        let db = Database::open_in_memory().unwrap();
        let rx = db.subscribe();
        let mut conn = db.new_connection(None).unwrap();

        let err = conn
            .read_write(|tx| {
                tx.put("p", "k", int(1), None)?;
                Err::<(), _>(CoreError::aborted("changed my mind"))
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Aborted { .. }));
        assert_eq!(db.snapshot(), 0);
        assert!(rx.try_recv().is_err());
        assert!(conn.read(|tx| tx.object("p", "k")).unwrap().is_none());
    }

    #[test]
    fn read_transactions_are_repeatable_under_concurrent_writes() {
        let db = Database::open_in_memory().unwrap();
        let mut writer = db.new_connection(None).unwrap();
        writer.read_write(|tx| tx.put("p", "k", int(1), None)).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (committed_tx, committed_rx) = mpsc::channel::<()>();
        let reader_db = db.clone();
        let reader = std::thread::spawn(move || {
            let mut conn = reader_db.new_connection(None).unwrap();
            conn.read(|tx| {
                let first = tx.object("p", "k")?.unwrap();
                entered_tx.send(()).unwrap();
                committed_rx.recv().unwrap();
                let second = tx.object("p", "k")?.unwrap();
                assert_eq!(as_int(&first), 1);
                assert_eq!(as_int(&second), 1);
                Ok(())
            })
            .unwrap();
        });

        entered_rx.recv().unwrap();
        writer.read_write(|tx| tx.put("p", "k", int(2), None)).unwrap();
        committed_tx.send(()).unwrap();
        reader.join().unwrap();

        // A fresh read transaction observes the new commit.
        let mut conn = db.new_connection(None).unwrap();
        let value = conn.read(|tx| tx.object("p", "k")).unwrap().unwrap();
        assert_eq!(as_int(&value), 2);
    }

    #[test]
    fn serialized_writers_lose_no_updates() {
        let db = Database::open_in_memory().unwrap();
        let mut workers = Vec::new();
        for _ in 0..4 {
            let db = db.clone();
            workers.push(std::thread::spawn(move || {
                let mut conn = db.new_connection(None).unwrap();
                for _ in 0..10 {
                    conn.read_write(|tx| {
                        let current = tx
                            .object("counters", "hits")?
                            .map(|value| as_int(&value))
                            .unwrap_or(0);
                        tx.put("counters", "hits", int(current + 1), None)
                    })
                    .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        let mut conn = db.new_connection(None).unwrap();
        let total = conn.read(|tx| tx.object("counters", "hits")).unwrap().unwrap();
        assert_eq!(as_int(&total), 40);
        assert_eq!(db.snapshot(), 40);
    }

    #[test]
    fn change_set_describes_the_commit() {
        let db = Database::open_in_memory().unwrap();
        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| tx.put("p", "old", int(0), None)).unwrap();

        let rx = db.subscribe();
        conn.read_write(|tx| {
            tx.put("p", "fresh", int(1), None)?;
            tx.remove("p", "old")?;
            tx.put("q", "annotated", int(2), Some(Value::Text("meta".into())))
        })
        .unwrap();

        let DatabaseEvent::Modified(changes) = rx.try_recv().unwrap() else {
            panic!("expected a modified event");
        };
        assert_eq!(changes.snapshot, db.snapshot());
        assert_eq!(changes.connection_id, conn.id());
        assert!(!changes.all_keys_removed);
        assert!(changes.removed_partitions.is_empty());

        let p = changes.partition("p").unwrap();
        assert!(p.inserted.contains("fresh"));
        assert!(p.object_changes.contains("fresh"));
        assert!(p.removed.contains("old"));
        assert!(!p.inserted.contains("old"));

        let q = changes.partition("q").unwrap();
        assert!(q.inserted.contains("annotated"));
        assert!(q.metadata_changes.contains("annotated"));
    }

    #[test]
    fn wholesale_removals_are_announced() {
        let db = Database::open_in_memory().unwrap();
        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| {
            tx.put("p", "a", int(1), None)?;
            tx.put("q", "b", int(2), None)
        })
        .unwrap();

        let rx = db.subscribe();
        conn.read_write(|tx| tx.remove_partition("p")).unwrap();
        let DatabaseEvent::Modified(changes) = rx.try_recv().unwrap() else {
            panic!("expected a modified event");
        };
        assert!(changes.removed_partitions.contains("p"));
        assert!(changes.touches("p", "a"));

        conn.read_write(|tx| tx.remove_all()).unwrap();
        let DatabaseEvent::Modified(changes) = rx.try_recv().unwrap() else {
            panic!("expected a modified event");
        };
        assert!(changes.all_keys_removed);
        assert!(changes.touches("q", "b"));
    }

    #[test]
    fn async_writes_commit_in_submission_order() {
        let db = Database::open_in_memory().unwrap();
        let async_conn = db.new_connection(None).unwrap();
        let mut sync_conn = db.new_connection(None).unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        async_conn.read_write_async(
            |tx| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                tx.put("log", "async", int(1), None)
            },
            None,
            move |conn, result| {
                result.unwrap();
                done_tx.send(conn).unwrap();
            },
        );

        // This writer took a later ticket, so the async transaction has
        // committed by the time it is admitted.
        sync_conn
            .read_write(|tx| {
                assert!(tx.contains_key("log", "async")?);
                tx.put("log", "sync", int(2), None)
            })
            .unwrap();

        let returned = done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        assert!(returned.snapshot() >= 1);
        assert_eq!(db.snapshot(), 2);
    }

    #[test]
    fn custom_payload_rides_the_change_set() {
        let db = Database::open_in_memory().unwrap();
        let rx = db.subscribe();
        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| {
            tx.set_custom_payload(Arc::new("deployment-42".to_owned()));
            tx.put("p", "k", int(1), None)
        })
        .unwrap();

        let DatabaseEvent::Modified(changes) = rx.try_recv().unwrap() else {
            panic!("expected a modified event");
        };
        let payload = changes.custom.as_ref().unwrap();
        assert_eq!(
            payload.downcast_ref::<String>().unwrap(),
            "deployment-42"
        );
    }

    struct Marker(&'static str);

    impl crate::extension::Extension for Marker {
        fn class_id(&self) -> &str {
            self.0
        }
        fn install(&self, tx: &mut WriteTransaction<'_>) -> CoreResult<()> {
            tx.aux_put(self.0, "ready", vec![1])
        }
        fn teardown(&self, tx: &mut WriteTransaction<'_>) -> CoreResult<()> {
            tx.aux_drop_table(self.0)
        }
    }

    #[test]
    fn flush_extension_requests_waits_for_queued_requests() {
        let db = Database::open_in_memory().unwrap();
        let completions = Arc::new(PlMutex::new(Vec::new()));

        let log = Arc::clone(&completions);
        db.async_register_extension("first", Arc::new(Marker("first")), None, None, move |ready| {
            assert!(ready);
            log.lock().push("register first");
        });
        let log = Arc::clone(&completions);
        db.async_register_extension("second", Arc::new(Marker("second")), None, None, move |ready| {
            assert!(ready);
            log.lock().push("register second");
        });
        let log = Arc::clone(&completions);
        db.async_unregister_extension("first", None, move || {
            log.lock().push("unregister first");
        });

        let (flushed_tx, flushed_rx) = mpsc::channel();
        let flushed_db = db.clone();
        let log = Arc::clone(&completions);
        db.flush_extension_requests(None, move || {
            // Every request queued ahead of this barrier is done.
            assert!(flushed_db.registered_extension("first").is_none());
            assert!(flushed_db.registered_extension("second").is_some());
            log.lock().push("flush");
            flushed_tx.send(()).unwrap();
        });

        flushed_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        assert_eq!(
            *completions.lock(),
            vec!["register first", "register second", "unregister first", "flush"]
        );
        assert_eq!(db.snapshot(), 3);
    }

    #[test]
    fn failed_async_registration_still_serves_later_writers() {
        use std::sync::atomic::AtomicUsize;
        use stratadb_storage::{StorageError, StorageHandle, StorageResult};

        struct FlakyEngine {
            inner: MemoryEngine,
            failing_opens: AtomicUsize,
        }
        impl StorageEngine for FlakyEngine {
            fn open_handle(&self) -> StorageResult<Box<dyn StorageHandle>> {
                let armed = self
                    .failing_opens
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if armed {
                    return Err(StorageError::unopenable("injected open failure"));
                }
                self.inner.open_handle()
            }
            fn paths(&self) -> StoragePaths {
                self.inner.paths()
            }
        }

        let engine = Arc::new(FlakyEngine {
            inner: MemoryEngine::new(),
            failing_opens: AtomicUsize::new(0),
        });
        let db =
            Database::open(Arc::clone(&engine) as Arc<dyn StorageEngine>, Options::default())
                .unwrap();

        // The registration's connection acquisition fails inside the
        // queued job.
        engine.failing_opens.store(1, Ordering::SeqCst);
        let (ready_tx, ready_rx) = mpsc::channel();
        db.async_register_extension("idx", Arc::new(Marker("idx")), None, None, move |ready| {
            ready_tx.send(ready).unwrap();
        });
        assert!(!ready_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap());
        assert!(db.registered_extension("idx").is_none());

        // The coordinator must advance past the failed request.
        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| tx.put("p", "k", int(1), None)).unwrap();
        assert_eq!(db.snapshot(), 1);
    }

    #[test]
    fn opening_the_same_location_twice_is_refused() {
        let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let db = Database::open(Arc::clone(&engine), Options::default()).unwrap();

        let err = Database::open(Arc::clone(&engine), Options::default()).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyOpen { .. }));

        drop(db);
        assert!(Database::open(engine, Options::default()).is_ok());
    }

    #[test]
    fn closing_publishes_an_event() {
        let db = Database::open_in_memory().unwrap();
        let rx = db.subscribe();
        let expected = db.paths().clone();
        drop(db);

        match rx.try_recv().unwrap() {
            DatabaseEvent::Closed { paths } => assert_eq!(paths, expected),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn snapshot_resumes_from_persisted_state() {
        let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let db = Database::open(Arc::clone(&engine), Options::default()).unwrap();
        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| tx.put("p", "k", int(7), None)).unwrap();
        conn.read_write(|tx| tx.put("p", "k", int(8), None)).unwrap();
        drop(conn);
        drop(db);

        let db = Database::open(engine, Options::default()).unwrap();
        assert_eq!(db.snapshot(), 2);
        let mut conn = db.new_connection(None).unwrap();
        let value = conn.read(|tx| tx.object("p", "k")).unwrap().unwrap();
        assert_eq!(as_int(&value), 8);
    }

    #[test]
    fn external_notifier_requires_multiprocess_support() {
        struct Recorder;
        impl ExternalNotifier for Recorder {
            fn post_commit(&self, _changes: &ChangeSet) {}
        }

        let db = Database::open_in_memory().unwrap();
        assert!(db.set_external_notifier(Arc::new(Recorder)).is_err());
        assert!(db.note_external_modification().is_err());
    }

    #[test]
    fn external_notifier_sees_every_commit() {
        struct Recorder(PlMutex<Vec<u64>>);
        impl ExternalNotifier for Recorder {
            fn post_commit(&self, changes: &ChangeSet) {
                self.0.lock().push(changes.snapshot);
            }
        }

        let options = Options::new().multiprocess_support(true);
        let db = Database::open(Arc::new(MemoryEngine::new()), options).unwrap();
        let recorder = Arc::new(Recorder(PlMutex::new(Vec::new())));
        db.set_external_notifier(Arc::clone(&recorder) as Arc<dyn ExternalNotifier>)
            .unwrap();

        let mut conn = db.new_connection(None).unwrap();
        conn.read_write(|tx| tx.put("p", "a", int(1), None)).unwrap();
        conn.read_write(|tx| tx.put("p", "b", int(2), None)).unwrap();
        assert_eq!(*recorder.0.lock(), vec![1, 2]);
    }

    #[test]
    fn external_modification_advances_the_counter() {
        let options = Options::new().multiprocess_support(true);
        let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let db = Database::open(Arc::clone(&engine), options).unwrap();
        let rx = db.subscribe();

        // A sibling process commits directly through the engine.
        let (_, bytes) = crate::codec::Codec::cbor().encode("p", "k", int(9)).unwrap();
        let mut handle = engine.open_handle().unwrap();
        handle.begin_write().unwrap();
        handle
            .put("p", "k", stratadb_storage::StoredRow { object: bytes, metadata: None })
            .unwrap();
        handle.commit(1).unwrap();

        db.note_external_modification().unwrap();
        assert_eq!(db.snapshot(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            DatabaseEvent::ModifiedExternally { snapshot: 1 }
        ));

        let mut conn = db.new_connection(None).unwrap();
        let value = conn.read(|tx| tx.object("p", "k")).unwrap().unwrap();
        assert_eq!(as_int(&value), 9);
    }
}
