//! Log store contract consumed by `Tasklane`.
//!
//! The replicated log engine itself is an external collaborator. This
//! module pins down what the rest of the crate needs from it:
//!
//! - [`LogStore`]: one opened database (`put`/`get`/`delete`/`list_all`
//!   plus a change broadcast).
//! - [`LogProvider`]: opens databases by name or by content-derived
//!   address, with an encryption configuration and an
//!   [`AccessController`].
//!
//! [`memory::MemoryProvider`] is an in-process implementation used by the
//! tests and the CLI. Every handle it hands out sees the same databases,
//! so several "peers" can share one provider.

pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;

use tokio::sync::broadcast;

use tasklane_proto::action::ACTION_KEY_PREFIX;
use tasklane_proto::entry::LogEntry;
use tasklane_proto::registry::EncryptionConfig;

/// Errors that can occur during log store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No database exists at the given name or address.
    #[error("database not found: {0}")]
    NotFound(String),

    /// The writing identity is not allowed to write this key.
    #[error("write to {key} denied for {identity}")]
    AccessDenied {
        /// Identity that attempted the write.
        identity: String,
        /// Key that was targeted.
        key: String,
    },

    /// The key lives in an append-only namespace and already exists, or a
    /// delete was attempted on it.
    #[error("key is append-only: {0}")]
    AppendOnly(String),

    /// The database was opened with a different encryption configuration.
    #[error("encryption mismatch for {db}: stored as {actual}")]
    EncryptionMismatch {
        /// Database name.
        db: String,
        /// Configuration the database actually uses.
        actual: EncryptionConfig,
    },

    /// The handle was closed.
    #[error("database handle closed: {0}")]
    Closed(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Content-derived address of a database.
///
/// Two peers opening the same address always reach the same database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbAddress(String);

impl DbAddress {
    /// Wraps an address string.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DbAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write rules enforced at the store boundary.
///
/// Only `writers` may write keys outside the append prefixes. Under an
/// append prefix anyone may create a key, but nobody may overwrite or
/// delete one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessController {
    writers: BTreeSet<String>,
    append_prefixes: Vec<String>,
}

impl AccessController {
    /// Writable by `identity_id` only.
    #[must_use]
    pub fn restricted_to(identity_id: &str) -> Self {
        Self {
            writers: BTreeSet::from([identity_id.to_string()]),
            append_prefixes: Vec::new(),
        }
    }

    /// Task list rules: canonical keys belong to `owner`, while the
    /// delegation action namespace is open for appends.
    #[must_use]
    pub fn task_list(owner: &str) -> Self {
        Self {
            writers: BTreeSet::from([owner.to_string()]),
            append_prefixes: vec![ACTION_KEY_PREFIX.to_string()],
        }
    }

    /// Returns `true` if `identity_id` has full write access.
    #[must_use]
    pub fn is_writer(&self, identity_id: &str) -> bool {
        self.writers.contains(identity_id)
    }

    /// Returns `true` if `key` is in an append-only namespace.
    #[must_use]
    pub fn is_append_only(&self, key: &str) -> bool {
        self.append_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Stable textual form, part of the address derivation.
    #[must_use]
    pub fn manifest(&self) -> String {
        let writers: Vec<&str> = self.writers.iter().map(String::as_str).collect();
        format!(
            "write={};append={}",
            writers.join(","),
            self.append_prefixes.join(",")
        )
    }
}

/// How to find a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocator {
    /// By database name.
    Name(String),
    /// By content-derived address.
    Address(DbAddress),
}

impl std::fmt::Display for DbLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name {name}"),
            Self::Address(address) => write!(f, "address {address}"),
        }
    }
}

/// Parameters for [`LogProvider::open`].
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Which database to open.
    pub locator: DbLocator,
    /// Create the database if it does not exist (name locators only).
    pub create: bool,
    /// Expected encryption configuration.
    pub encryption: EncryptionConfig,
    /// Access rules, used when the database is created.
    pub access: AccessController,
    /// Identity that will write through the handle.
    pub identity: String,
}

impl OpenRequest {
    /// Opens an existing database by name, plaintext, writable only by
    /// `identity` if it ends up being created.
    #[must_use]
    pub fn by_name(name: impl Into<String>, identity: &str) -> Self {
        Self {
            locator: DbLocator::Name(name.into()),
            create: false,
            encryption: EncryptionConfig::plaintext(),
            access: AccessController::restricted_to(identity),
            identity: identity.to_string(),
        }
    }

    /// Opens an existing database by address.
    #[must_use]
    pub fn by_address(address: DbAddress, identity: &str) -> Self {
        Self {
            locator: DbLocator::Address(address),
            ..Self::by_name(String::new(), identity)
        }
    }

    /// Allows creating the database.
    #[must_use]
    pub const fn create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Sets the encryption configuration.
    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    /// Sets the access rules for creation.
    #[must_use]
    pub fn access(mut self, access: AccessController) -> Self {
        self.access = access;
        self
    }
}

/// Kind of change announced on a store's broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A key was written.
    Put,
    /// A key was deleted.
    Delete,
}

/// Notification that a database changed, locally or through replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Affected key.
    pub key: String,
    /// Identity behind the change.
    pub origin: String,
    /// What happened.
    pub kind: ChangeKind,
}

/// One opened database in the replicated log.
///
/// Last write wins per key. `list_all` returns entries in log order.
pub trait LogStore: Send + Sync {
    /// Database name.
    fn db_name(&self) -> &str;

    /// Content-derived address.
    fn address(&self) -> &DbAddress;

    /// Encryption configuration the database was created with.
    fn encryption(&self) -> &EncryptionConfig;

    /// Writes `value` at `key`.
    fn put(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads the value at `key`.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, StoreError>> + Send;

    /// Deletes `key`.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns every live entry, in log order.
    fn list_all(&self) -> impl Future<Output = Result<Vec<LogEntry>, StoreError>> + Send;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Closes the handle. Later operations fail with [`StoreError::Closed`].
    fn close(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Opens databases in the replicated log.
pub trait LogProvider: Send + Sync {
    /// Handle type returned by [`open`](Self::open).
    type Store: LogStore + 'static;

    /// Opens (and optionally creates) a database.
    fn open(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = Result<Self::Store, StoreError>> + Send;
}
