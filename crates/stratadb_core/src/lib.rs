//! stratadb core: an embedded, multi-connection data store layering
//! snapshot-isolated reads, single-writer commits, connection pooling,
//! an extension framework, and change notification over a pluggable
//! storage engine.
//!
//! The database is a logical clock plus coordination: every mutating
//! read-write transaction advances a 64-bit snapshot counter, readers
//! pin a snapshot for the whole transaction, and exactly one writer is
//! admitted at a time, in strict FIFO order across sync and async
//! requests. Committed changes are announced as immutable
//! [`ChangeSet`]s on the database's event feed.
//!
//! ```no_run
//! use stratadb_core::{Database, Value};
//!
//! # fn main() -> stratadb_core::CoreResult<()> {
//! let db = Database::open_in_memory()?;
//! let mut conn = db.new_connection(None)?;
//!
//! conn.read_write(|tx| {
//!     tx.put("books", "dune", Value::Text("Frank Herbert".into()), None)
//! })?;
//!
//! let author = conn.read(|tx| tx.object("books", "dune"))?;
//! assert!(author.is_some());
//! assert_eq!(db.snapshot(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod completion;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod extension;
pub mod notify;
pub mod pool;
pub mod snapshot;
pub mod transaction;
pub mod write_queue;

pub use codec::{Codec, CodecError, CodecRegistry, CodecResult, Value};
pub use completion::CompletionQueue;
pub use config::{CachePolicy, ClassMismatchPolicy, ConnectionConfig, Options};
pub use connection::Connection;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use extension::{Extension, ExtensionFactory};
pub use notify::{ChangeSet, DatabaseEvent, ExternalNotifier, PartitionChanges};
pub use pool::{DEFAULT_POOL_CAPACITY, DEFAULT_POOL_LIFETIME};
pub use transaction::{ReadTransaction, WriteTransaction};

pub use stratadb_storage::{
    ExtensionRecord, MemoryEngine, StorageEngine, StorageError, StorageHandle, StoragePaths,
    StorageResult, StoredRow,
};
