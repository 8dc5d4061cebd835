//! Storage engine traits.

use crate::error::StorageResult;
use std::path::PathBuf;

/// The file path triple of a storage location.
///
/// Mirrors the on-disk footprint of a WAL-mode embedded SQL engine:
/// the main database file, the write-ahead log, and the shared-memory
/// index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Main database file.
    pub main: PathBuf,
    /// Write-ahead log file.
    pub wal: PathBuf,
    /// Shared-memory index file.
    pub shm: PathBuf,
}

impl StoragePaths {
    /// Derives the conventional path triple from a main database path.
    pub fn for_main(main: impl Into<PathBuf>) -> Self {
        let main = main.into();
        let mut wal = main.as_os_str().to_owned();
        wal.push("-wal");
        let mut shm = main.as_os_str().to_owned();
        shm.push("-shm");
        Self {
            main,
            wal: PathBuf::from(wal),
            shm: PathBuf::from(shm),
        }
    }
}

/// A stored row: the serialized object and its optional metadata blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Serialized object bytes.
    pub object: Vec<u8>,
    /// Serialized metadata bytes, if any.
    pub metadata: Option<Vec<u8>>,
}

/// Persisted record for a registered extension.
///
/// One record is kept per extension name in a reserved metadata area.
/// This is the only format contract the coordination layer owns;
/// extension-internal table layouts are the extension's own concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRecord {
    /// Identifier of the implementing class.
    pub class_id: String,
    /// Version of the extension's persisted structures.
    pub version: u64,
}

/// A factory for storage handles bound to one storage location.
///
/// Engines must be shareable across threads; each handle is used by a
/// single connection at a time.
pub trait StorageEngine: Send + Sync + 'static {
    /// Opens a new handle to this storage location.
    fn open_handle(&self) -> StorageResult<Box<dyn StorageHandle>>;

    /// Returns the file path triple of this storage location.
    fn paths(&self) -> StoragePaths;
}

/// One connection to the underlying storage engine.
///
/// Handles are stateful: reads outside a transaction are an error, and
/// writes must happen between `begin_write` and `commit`/`rollback`.
/// A read transaction pins the committed version observed at
/// `begin_read`; all point reads additionally take an explicit snapshot
/// so the coordination layer controls exactly which version is seen.
pub trait StorageHandle: Send {
    /// Begins a read transaction.
    fn begin_read(&mut self) -> StorageResult<()>;

    /// Ends a read transaction.
    fn end_read(&mut self) -> StorageResult<()>;

    /// Begins a write transaction.
    fn begin_write(&mut self) -> StorageResult<()>;

    /// Commits the write transaction, stamping it with `snapshot`.
    ///
    /// The stored version-tracking primitive is advanced to `snapshot`
    /// atomically with the commit.
    fn commit(&mut self, snapshot: u64) -> StorageResult<()>;

    /// Rolls back the write transaction, discarding pending writes.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Reads a row as of `snapshot`.
    ///
    /// Inside a write transaction, uncommitted writes made through this
    /// handle are visible and take precedence over committed versions.
    fn get(&mut self, partition: &str, key: &str, snapshot: u64)
        -> StorageResult<Option<StoredRow>>;

    /// Writes a row. Valid only inside a write transaction.
    fn put(&mut self, partition: &str, key: &str, row: StoredRow) -> StorageResult<()>;

    /// Deletes a row. Valid only inside a write transaction.
    fn delete(&mut self, partition: &str, key: &str) -> StorageResult<()>;

    /// Deletes every row in a partition. Valid only inside a write
    /// transaction.
    fn delete_partition(&mut self, partition: &str) -> StorageResult<()>;

    /// Deletes every row in every partition. Valid only inside a write
    /// transaction.
    fn delete_all(&mut self) -> StorageResult<()>;

    /// Lists the live keys of a partition as of `snapshot`, merged with
    /// any uncommitted writes on this handle.
    fn keys(&mut self, partition: &str, snapshot: u64) -> StorageResult<Vec<String>>;

    /// Lists the partitions holding at least one live key as of
    /// `snapshot`, merged with any uncommitted writes on this handle.
    fn partitions(&mut self, snapshot: u64) -> StorageResult<Vec<String>>;

    /// Reads the persisted version-tracking primitive.
    fn stored_snapshot(&mut self) -> StorageResult<u64>;

    /// Reads the persisted record for an extension name.
    fn extension_record(&mut self, name: &str) -> StorageResult<Option<ExtensionRecord>>;

    /// Writes the persisted record for an extension name. Valid only
    /// inside a write transaction.
    fn put_extension_record(&mut self, name: &str, record: &ExtensionRecord)
        -> StorageResult<()>;

    /// Deletes the persisted record for an extension name. Valid only
    /// inside a write transaction.
    fn delete_extension_record(&mut self, name: &str) -> StorageResult<()>;

    /// Lists all persisted extension records.
    fn extension_records(&mut self) -> StorageResult<Vec<(String, ExtensionRecord)>>;

    /// Reads a value from an extension-owned auxiliary table.
    fn aux_get(&mut self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes a value into an extension-owned auxiliary table. Valid
    /// only inside a write transaction.
    fn aux_put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Deletes a value from an extension-owned auxiliary table. Valid
    /// only inside a write transaction.
    fn aux_delete(&mut self, table: &str, key: &str) -> StorageResult<()>;

    /// Drops an extension-owned auxiliary table. Valid only inside a
    /// write transaction.
    fn aux_drop_table(&mut self, table: &str) -> StorageResult<()>;

    /// Lists the auxiliary tables that currently exist.
    fn aux_table_names(&mut self) -> StorageResult<Vec<String>>;
}
