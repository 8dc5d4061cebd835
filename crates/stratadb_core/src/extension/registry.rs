//! Extension lifecycle: registration, unregistration, and the orphan
//! sweep.

use super::Extension;
use crate::config::ClassMismatchPolicy;
use crate::connection::Connection;
use crate::database::{run_write, Database};
use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratadb_storage::ExtensionRecord;

/// Tracks which extensions are active in this session and which are
/// persisted leftovers from earlier sessions awaiting the orphan sweep.
pub(crate) struct ExtensionRegistry {
    active: RwLock<BTreeMap<String, Arc<dyn Extension>>>,
    /// Names persisted by an earlier session, until the sweep clears
    /// them.
    previously_registered: Mutex<Vec<String>>,
    /// Names registered at any point in this session; never swept even
    /// if later unregistered.
    session_registered: Mutex<HashSet<String>>,
    sweep_pending: AtomicBool,
}

impl ExtensionRegistry {
    pub(crate) fn new(previously_registered: Vec<String>) -> Self {
        let sweep_pending = !previously_registered.is_empty();
        Self {
            active: RwLock::new(BTreeMap::new()),
            previously_registered: Mutex::new(previously_registered),
            session_registered: Mutex::new(HashSet::new()),
            sweep_pending: AtomicBool::new(sweep_pending),
        }
    }

    pub(crate) fn active_instance(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.active.read().get(name).cloned()
    }

    pub(crate) fn active_extensions(&self) -> Vec<(String, Arc<dyn Extension>)> {
        self.active
            .read()
            .iter()
            .map(|(name, extension)| (name.clone(), Arc::clone(extension)))
            .collect()
    }

    pub(crate) fn previously_registered(&self) -> Vec<String> {
        self.previously_registered.lock().clone()
    }

    fn is_active(&self, name: &str) -> bool {
        self.active.read().contains_key(name)
    }

    fn insert_active(&self, name: &str, extension: Arc<dyn Extension>) {
        self.active.write().insert(name.to_owned(), extension);
        self.session_registered.lock().insert(name.to_owned());
    }

    fn remove_active(&self, name: &str) {
        self.active.write().remove(name);
    }

    fn take_sweep_pending(&self) -> bool {
        self.sweep_pending.swap(false, Ordering::SeqCst)
    }

    /// Persisted names neither re-registered this session nor active.
    fn orphaned_names(&self) -> Vec<String> {
        let session = self.session_registered.lock();
        let active = self.active.read();
        self.previously_registered
            .lock()
            .iter()
            .filter(|name| !session.contains(*name) && !active.contains_key(*name))
            .cloned()
            .collect()
    }

    fn clear_previously_registered(&self) {
        self.previously_registered.lock().clear();
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("active", &self.active.read().keys().collect::<Vec<_>>())
            .field("previously_registered", &*self.previously_registered.lock())
            .finish_non_exhaustive()
    }
}

/// Installs `extension` under `name` in its own commit. The caller must
/// hold the write slot.
pub(crate) fn register_locked(
    db: &Database,
    conn: &mut Connection,
    name: &str,
    extension: Arc<dyn Extension>,
) -> CoreResult<bool> {
    if db.registry().is_active(name) {
        tracing::debug!(name, "extension already registered under this name");
        return Ok(false);
    }

    run_write(db, conn, |tx| {
        if let Some(record) = tx.extension_record(name)? {
            if record.class_id != extension.class_id() {
                match db.options().class_mismatch_policy {
                    ClassMismatchPolicy::Fail => {
                        return Err(CoreError::ExtensionClassMismatch {
                            name: name.to_owned(),
                            persisted: record.class_id,
                            registered: extension.class_id().to_owned(),
                        });
                    }
                    ClassMismatchPolicy::DropAndReinstall => {
                        match db.options().extension_factory(&record.class_id) {
                            Some(factory) => factory().teardown(tx)?,
                            None => tracing::warn!(
                                name,
                                class = %record.class_id,
                                "no factory for persisted class; stale structures left behind"
                            ),
                        }
                    }
                }
            }
        }
        tx.put_extension_record(
            name,
            &ExtensionRecord {
                class_id: extension.class_id().to_owned(),
                version: extension.version(),
            },
        )?;
        extension.install(tx)
    })?;

    db.registry().insert_active(name, extension);
    tracing::info!(name, "extension registered");
    Ok(true)
}

/// Tears down the extension named `name` in its own commit. The caller
/// must hold the write slot.
///
/// Works without a live instance: the persisted class identifier is
/// resolved through the registered extension classes to build a
/// transient one. When the class is unknown, only the persisted record
/// is removed.
pub(crate) fn unregister_locked(db: &Database, conn: &mut Connection, name: &str) -> CoreResult<()> {
    let active = db.registry().active_instance(name);

    run_write(db, conn, |tx| {
        let record = tx.extension_record(name)?;
        if record.is_none() && active.is_none() {
            return Ok(());
        }
        let instance = active.clone().or_else(|| {
            record
                .as_ref()
                .and_then(|record| db.options().extension_factory(&record.class_id))
                .map(|factory| factory())
        });
        match instance {
            Some(extension) => extension.teardown(tx)?,
            None => tracing::warn!(
                name,
                "no class factory for persisted extension; removing its record only"
            ),
        }
        if record.is_some() {
            tx.delete_extension_record(name)?;
        }
        Ok(())
    })?;

    db.registry().remove_active(name);
    tracing::info!(name, "extension unregistered");
    Ok(())
}

/// Cleans up extensions persisted by an earlier session and not
/// re-registered in this one. Runs at most once per session, after the
/// first mutating commit, while the write slot is still held.
///
/// Each orphan is torn down in its own commit; a failure is logged and
/// never affects the commit that triggered the sweep.
pub(crate) fn run_pending_sweep(db: &Database) {
    let registry = db.registry();
    if !registry.take_sweep_pending() {
        return;
    }
    for name in registry.orphaned_names() {
        let result = db
            .new_connection(None)
            .and_then(|mut conn| unregister_locked(db, &mut conn, &name));
        match result {
            Ok(()) => tracing::info!(name = %name, "cleaned up orphaned extension"),
            Err(e) => tracing::warn!(name = %name, error = %e, "orphaned extension cleanup failed"),
        }
    }
    registry.clear_previously_registered();
}
