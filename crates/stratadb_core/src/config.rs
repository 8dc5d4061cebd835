//! Database and connection configuration.

use crate::codec::CodecRegistry;
use crate::extension::ExtensionFactory;
use std::collections::HashMap;

/// How a connection's caches treat values written through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// The cache only ever holds values decoded from storage. Values
    /// written through the connection are invalidated at commit and
    /// re-decoded on the next read.
    #[default]
    Containment,
    /// The cache shares the sanitized value written through the
    /// connection, avoiding the decode on the next read.
    Share,
}

/// How to reconcile registering an extension under a name whose
/// persisted record names a different implementing class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassMismatchPolicy {
    /// Fail the registration and leave the persisted structures alone.
    #[default]
    Fail,
    /// Tear down the stale structures and install the new class.
    DropAndReinstall,
}

/// Per-connection configuration.
///
/// New connections inherit the database's `connection_defaults`; a
/// config passed to `new_connection` overrides them for that
/// connection only.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Whether the decoded-object cache is enabled.
    pub object_cache_enabled: bool,
    /// Capacity of the decoded-object cache.
    pub object_cache_limit: usize,
    /// Whether the decoded-metadata cache is enabled.
    pub metadata_cache_enabled: bool,
    /// Capacity of the decoded-metadata cache.
    pub metadata_cache_limit: usize,
    /// Cache policy for objects written through this connection.
    pub object_policy: CachePolicy,
    /// Cache policy for metadata written through this connection.
    pub metadata_policy: CachePolicy,
    /// Whether to flush the caches after every transaction.
    pub auto_flush_memory: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            object_cache_enabled: true,
            object_cache_limit: 250,
            metadata_cache_enabled: true,
            metadata_cache_limit: 500,
            object_policy: CachePolicy::default(),
            metadata_policy: CachePolicy::default(),
            auto_flush_memory: false,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the object cache.
    #[must_use]
    pub const fn object_cache_enabled(mut self, value: bool) -> Self {
        self.object_cache_enabled = value;
        self
    }

    /// Sets the object cache capacity.
    #[must_use]
    pub const fn object_cache_limit(mut self, limit: usize) -> Self {
        self.object_cache_limit = limit;
        self
    }

    /// Enables or disables the metadata cache.
    #[must_use]
    pub const fn metadata_cache_enabled(mut self, value: bool) -> Self {
        self.metadata_cache_enabled = value;
        self
    }

    /// Sets the metadata cache capacity.
    #[must_use]
    pub const fn metadata_cache_limit(mut self, limit: usize) -> Self {
        self.metadata_cache_limit = limit;
        self
    }

    /// Sets the object cache policy.
    #[must_use]
    pub const fn object_policy(mut self, policy: CachePolicy) -> Self {
        self.object_policy = policy;
        self
    }

    /// Sets the metadata cache policy.
    #[must_use]
    pub const fn metadata_policy(mut self, policy: CachePolicy) -> Self {
        self.metadata_policy = policy;
        self
    }

    /// Enables or disables cache flushing after every transaction.
    #[must_use]
    pub const fn auto_flush_memory(mut self, value: bool) -> Self {
        self.auto_flush_memory = value;
        self
    }
}

/// Options for opening a database. Immutable after construction.
#[derive(Clone)]
pub struct Options {
    /// Whether another process may modify the same storage location.
    /// Enables the external notifier hook and externally-modified
    /// events.
    pub multiprocess_support: bool,
    /// Defaults inherited by new connections.
    pub connection_defaults: ConnectionConfig,
    /// Reconciliation policy for extension class mismatches.
    pub class_mismatch_policy: ClassMismatchPolicy,
    codecs: CodecRegistry,
    extension_classes: HashMap<String, ExtensionFactory>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            multiprocess_support: false,
            connection_defaults: ConnectionConfig::default(),
            class_mismatch_policy: ClassMismatchPolicy::default(),
            codecs: CodecRegistry::new(),
            extension_classes: HashMap::new(),
        }
    }
}

impl Options {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables multiprocess support.
    #[must_use]
    pub fn multiprocess_support(mut self, value: bool) -> Self {
        self.multiprocess_support = value;
        self
    }

    /// Sets the defaults inherited by new connections.
    #[must_use]
    pub fn connection_defaults(mut self, config: ConnectionConfig) -> Self {
        self.connection_defaults = config;
        self
    }

    /// Sets the extension class-mismatch reconciliation policy.
    #[must_use]
    pub fn class_mismatch_policy(mut self, policy: ClassMismatchPolicy) -> Self {
        self.class_mismatch_policy = policy;
        self
    }

    /// Sets the serializer table.
    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Registers an extension class factory, used to build transient
    /// instances when tearing down extensions that are persisted but
    /// not registered in this session.
    #[must_use]
    pub fn extension_class(mut self, class_id: impl Into<String>, factory: ExtensionFactory) -> Self {
        self.extension_classes.insert(class_id.into(), factory);
        self
    }

    pub(crate) fn codec_registry(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub(crate) fn extension_factory(&self, class_id: &str) -> Option<ExtensionFactory> {
        self.extension_classes.get(class_id).cloned()
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("multiprocess_support", &self.multiprocess_support)
            .field("connection_defaults", &self.connection_defaults)
            .field("class_mismatch_policy", &self.class_mismatch_policy)
            .field(
                "extension_classes",
                &self.extension_classes.keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
