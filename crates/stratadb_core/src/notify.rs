//! Change notification: per-commit change sets and the event feed.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use stratadb_storage::StoragePaths;

/// Key-level changes within a single partition, part of a
/// [`ChangeSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionChanges {
    /// Keys that did not exist before this commit.
    pub inserted: BTreeSet<String>,
    /// Keys removed by this commit (only keys that existed before it).
    pub removed: BTreeSet<String>,
    /// Keys whose object changed, including inserts.
    pub object_changes: BTreeSet<String>,
    /// Keys whose metadata changed, including inserts that set
    /// metadata.
    pub metadata_changes: BTreeSet<String>,
}

impl PartitionChanges {
    /// Whether no key in this partition changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.removed.is_empty()
            && self.object_changes.is_empty()
            && self.metadata_changes.is_empty()
    }
}

/// The immutable description of one committed read-write transaction.
///
/// Published to subscribers after every mutating commit; also handed to
/// the external notifier when multiprocess support is on.
pub struct ChangeSet {
    /// The post-commit snapshot number.
    pub snapshot: u64,
    /// Identifier of the connection that performed the commit.
    pub connection_id: u64,
    /// Key-level changes, keyed by partition.
    pub partitions: BTreeMap<String, PartitionChanges>,
    /// Partitions removed wholesale by this commit.
    pub removed_partitions: BTreeSet<String>,
    /// Whether the commit removed every key in the database.
    pub all_keys_removed: bool,
    /// Opaque per-extension change descriptions, keyed by extension
    /// name.
    pub extensions: BTreeMap<String, Vec<u8>>,
    /// Caller-supplied payload attached during the transaction.
    pub custom: Option<Arc<dyn Any + Send + Sync>>,
}

impl ChangeSet {
    /// The changes within `partition`, if any key in it changed.
    pub fn partition(&self, partition: &str) -> Option<&PartitionChanges> {
        self.partitions.get(partition)
    }

    /// Whether `key` in `partition` was touched by this commit, either
    /// directly or through a partition-wide removal.
    pub fn touches(&self, partition: &str, key: &str) -> bool {
        if self.all_keys_removed || self.removed_partitions.contains(partition) {
            return true;
        }
        self.partitions.get(partition).is_some_and(|changes| {
            changes.object_changes.contains(key)
                || changes.metadata_changes.contains(key)
                || changes.removed.contains(key)
        })
    }
}

impl std::fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSet")
            .field("snapshot", &self.snapshot)
            .field("connection_id", &self.connection_id)
            .field("partitions", &self.partitions)
            .field("removed_partitions", &self.removed_partitions)
            .field("all_keys_removed", &self.all_keys_removed)
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// Events published by the database.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// A read-write transaction committed through this database
    /// instance.
    Modified(Arc<ChangeSet>),
    /// Another process modified the storage location; `snapshot` is the
    /// persisted snapshot it committed.
    ModifiedExternally {
        /// The snapshot number the external process committed.
        snapshot: u64,
    },
    /// The last handle to the database was dropped.
    Closed {
        /// The storage location that was closed.
        paths: StoragePaths,
    },
}

/// Hook invoked after each local commit when multiprocess support is
/// enabled, so sibling processes can be told to resync.
pub trait ExternalNotifier: Send + Sync {
    /// Called with the change set of every mutating commit, while the
    /// write slot is still held.
    fn post_commit(&self, changes: &ChangeSet);
}

/// Fan-out of [`DatabaseEvent`]s to any number of subscribers.
///
/// Subscribers that drop their receiver are pruned on the next publish.
pub struct ChangeNotifier {
    subscribers: RwLock<Vec<Sender<DatabaseEvent>>>,
    external: RwLock<Option<Arc<dyn ExternalNotifier>>>,
}

impl ChangeNotifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            external: RwLock::new(None),
        }
    }

    /// Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&self) -> Receiver<DatabaseEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes `event` to all live subscribers, pruning any whose
    /// receiver has been dropped.
    pub fn publish(&self, event: DatabaseEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers at the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub(crate) fn set_external(&self, notifier: Arc<dyn ExternalNotifier>) {
        *self.external.write() = Some(notifier);
    }

    pub(crate) fn external(&self) -> Option<Arc<dyn ExternalNotifier>> {
        self.external.read().clone()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscriber_count", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_set(snapshot: u64) -> Arc<ChangeSet> {
        let mut partitions = BTreeMap::new();
        let mut changes = PartitionChanges::default();
        changes.inserted.insert("key".into());
        changes.object_changes.insert("key".into());
        partitions.insert("partition".into(), changes);
        Arc::new(ChangeSet {
            snapshot,
            connection_id: 1,
            partitions,
            removed_partitions: BTreeSet::new(),
            all_keys_removed: false,
            extensions: BTreeMap::new(),
            custom: None,
        })
    }

    #[test]
    fn publishes_to_all_subscribers() {
        let notifier = ChangeNotifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();

        notifier.publish(DatabaseEvent::Modified(change_set(1)));

        for rx in [a, b] {
            match rx.try_recv().unwrap() {
                DatabaseEvent::Modified(changes) => assert_eq!(changes.snapshot, 1),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn prunes_dropped_subscribers() {
        let notifier = ChangeNotifier::new();
        let keep = notifier.subscribe();
        drop(notifier.subscribe());

        notifier.publish(DatabaseEvent::ModifiedExternally { snapshot: 7 });
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(matches!(
            keep.try_recv().unwrap(),
            DatabaseEvent::ModifiedExternally { snapshot: 7 }
        ));
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let notifier = ChangeNotifier::new();
        let rx = notifier.subscribe();
        for snapshot in 1..=4 {
            notifier.publish(DatabaseEvent::Modified(change_set(snapshot)));
        }
        for expected in 1..=4 {
            match rx.try_recv().unwrap() {
                DatabaseEvent::Modified(changes) => assert_eq!(changes.snapshot, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn touches_accounts_for_wholesale_removals() {
        let mut set = Arc::try_unwrap(change_set(3)).ok().unwrap();
        set.removed_partitions.insert("gone".into());

        assert!(set.touches("partition", "key"));
        assert!(!set.touches("partition", "other"));
        assert!(set.touches("gone", "anything"));

        set.all_keys_removed = true;
        assert!(set.touches("unrelated", "anything"));
    }
}
