//! Extension framework: pluggable components that maintain derived
//! state inside the same commits as the user data they index.

mod registry;

pub(crate) use registry::{
    register_locked, run_pending_sweep, unregister_locked, ExtensionRegistry,
};

use crate::error::CoreResult;
use crate::transaction::WriteTransaction;
use std::sync::Arc;

/// Builds a fresh instance of an extension class. Used to tear down
/// extensions that are persisted but not registered in this session.
pub type ExtensionFactory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// A pluggable component that maintains derived state (an index, a
/// view, a search structure) alongside the primary data.
///
/// All hooks run inside the write slot, within the same engine
/// transaction as the commit that triggered them. Extensions keep their
/// private state in auxiliary tables (`aux_*` operations on
/// [`WriteTransaction`]).
pub trait Extension: Send + Sync {
    /// Stable identifier of the implementing class, persisted so the
    /// extension can be torn down in a later session without the class
    /// being registered.
    fn class_id(&self) -> &str;

    /// Version of the persisted structures. Bump it when the on-disk
    /// layout changes; the persisted record keeps the version the
    /// structures were installed with.
    fn version(&self) -> u64 {
        1
    }

    /// Creates the extension's persistent structures, inside the
    /// registration commit; failure aborts the registration. Called
    /// again when the extension is re-registered in a later session, so
    /// it must tolerate structures that already exist.
    fn install(&self, tx: &mut WriteTransaction<'_>) -> CoreResult<()>;

    /// Removes the extension's persistent structures. Runs inside the
    /// unregistration commit.
    fn teardown(&self, tx: &mut WriteTransaction<'_>) -> CoreResult<()>;

    /// Called at the end of every mutating transaction, before the
    /// commit. The extension may inspect the transaction's pending
    /// changes, update its derived state, and return an opaque
    /// description of its own changes for inclusion in the published
    /// change set.
    fn commit_changeset(&self, tx: &mut WriteTransaction<'_>) -> Option<Vec<u8>> {
        let _ = tx;
        None
    }
}
