//! # stratadb Storage
//!
//! Storage engine interface for stratadb.
//!
//! stratadb treats the underlying embedded SQL engine as an external
//! collaborator. This crate defines the contract that collaborator must
//! present:
//!
//! - a durable keyed row store grouped into named partitions
//! - atomic begin/commit/rollback transactions
//! - a persisted version-tracking primitive (the stored snapshot)
//! - a reserved metadata area recording registered extensions
//! - opaque auxiliary tables for extension-owned structures
//!
//! The coordination layer in `stratadb_core` never interprets how rows
//! are laid out on disk; it only sequences calls through these traits.
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - an MVCC-versioned in-process engine for testing
//!   and ephemeral databases

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod memory;

pub use engine::{ExtensionRecord, StorageEngine, StorageHandle, StoragePaths, StoredRow};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryEngine;
