//! In-process implementation of the log store contract.
//!
//! [`MemoryProvider`] keeps every database in a shared map, so cloned
//! providers behave like peers attached to the same replicated log: a write
//! through one handle is immediately visible to, and announced on, every
//! other handle of the same database.
//!
//! Values are held as serialized bytes. Databases created with encryption
//! enabled seal those bytes through [`crate::crypto`] before storing them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use tasklane_proto::entry::LogEntry;
use tasklane_proto::registry::EncryptionConfig;

use super::{
    AccessController, ChangeKind, DbAddress, DbLocator, LogProvider, LogStore, OpenRequest,
    StoreChange, StoreError,
};
use crate::crypto::stub::StubCipher;
use crate::crypto::{AtRestCipher, cipher_for};

/// Default capacity of each database's change channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 256;

/// Prefix of every address produced by [`derive_address`].
pub const ADDRESS_PREFIX: &str = "/tasklane/";

/// Derives the content address of a database from its manifest.
///
/// The same name, access rules, and encryption always yield the same
/// address.
#[must_use]
pub fn derive_address(
    name: &str,
    access: &AccessController,
    encryption: &EncryptionConfig,
) -> DbAddress {
    let manifest = format!("name={name};{};enc={encryption}", access.manifest());
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, manifest.as_bytes());
    DbAddress::new(format!("{ADDRESS_PREFIX}{id}/{name}"))
}

#[derive(Debug, Clone)]
struct StoredValue {
    seq: u64,
    bytes: Vec<u8>,
}

struct MemoryDb {
    name: String,
    address: DbAddress,
    encryption: EncryptionConfig,
    access: AccessController,
    cipher: Option<StubCipher>,
    entries: RwLock<BTreeMap<String, StoredValue>>,
    next_seq: AtomicU64,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryDb {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        Ok(match &self.cipher {
            Some(cipher) => cipher.seal(&bytes),
            None => bytes,
        })
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<serde_json::Value, StoreError> {
        let plain = match &self.cipher {
            Some(cipher) => cipher
                .open(bytes)
                .map_err(|e| StoreError::ReadFailed(format!("{key}: {e}")))?,
            None => bytes.to_vec(),
        };
        serde_json::from_slice(&plain).map_err(|e| StoreError::ReadFailed(format!("{key}: {e}")))
    }

    fn announce(&self, key: &str, origin: &str, kind: ChangeKind) {
        // No subscribers is fine.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            origin: origin.to_string(),
            kind,
        });
    }
}

#[derive(Default)]
struct Network {
    by_address: HashMap<DbAddress, Arc<MemoryDb>>,
    by_name: HashMap<String, DbAddress>,
}

/// Shared in-memory "network" of databases.
#[derive(Clone)]
pub struct MemoryProvider {
    network: Arc<Mutex<Network>>,
    change_buffer: usize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::with_change_buffer(DEFAULT_CHANGE_BUFFER)
    }

    /// Creates an empty provider whose databases buffer `capacity`
    /// change notifications per subscriber.
    #[must_use]
    pub fn with_change_buffer(capacity: usize) -> Self {
        Self {
            network: Arc::new(Mutex::new(Network::default())),
            change_buffer: capacity.max(1),
        }
    }

    /// Names of every database created so far, sorted.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let network = self.network.lock();
        let mut names: Vec<String> = network.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Address of the database called `name`, if it exists.
    #[must_use]
    pub fn address_of(&self, name: &str) -> Option<DbAddress> {
        self.network.lock().by_name.get(name).cloned()
    }

    /// Stored bytes of every entry in the database at `address`, in log
    /// order. Encrypted databases return ciphertext.
    #[must_use]
    pub fn raw_entries(&self, address: &DbAddress) -> Option<Vec<(String, Vec<u8>)>> {
        let db = self.network.lock().by_address.get(address).cloned()?;
        let entries = db.entries.read();
        let mut raw: Vec<(u64, String, Vec<u8>)> = entries
            .iter()
            .map(|(k, v)| (v.seq, k.clone(), v.bytes.clone()))
            .collect();
        raw.sort_by_key(|(seq, _, _)| *seq);
        Some(raw.into_iter().map(|(_, k, b)| (k, b)).collect())
    }

    fn create_db(&self, name: &str, request: &OpenRequest) -> Result<Arc<MemoryDb>, StoreError> {
        let address = derive_address(name, &request.access, &request.encryption);
        let cipher = if request.encryption.enabled {
            Some(
                cipher_for(request.encryption.method.as_deref(), address.as_str())
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?,
            )
        } else {
            None
        };
        let (changes, _) = broadcast::channel(self.change_buffer);
        Ok(Arc::new(MemoryDb {
            name: name.to_string(),
            address,
            encryption: request.encryption.clone(),
            access: request.access.clone(),
            cipher,
            entries: RwLock::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            changes,
        }))
    }

    fn locate_or_create(&self, request: &OpenRequest) -> Result<Arc<MemoryDb>, StoreError> {
        let mut network = self.network.lock();
        let existing = match &request.locator {
            DbLocator::Address(address) => Some(
                network
                    .by_address
                    .get(address)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(address.to_string()))?,
            ),
            DbLocator::Name(name) => network
                .by_name
                .get(name)
                .and_then(|address| network.by_address.get(address))
                .cloned(),
        };

        if let Some(db) = existing {
            if db.encryption.enabled != request.encryption.enabled {
                return Err(StoreError::EncryptionMismatch {
                    db: db.name.clone(),
                    actual: db.encryption.clone(),
                });
            }
            return Ok(db);
        }

        let DbLocator::Name(name) = &request.locator else {
            return Err(StoreError::NotFound(request.locator.to_string()));
        };
        if !request.create {
            return Err(StoreError::NotFound(name.clone()));
        }

        let db = self.create_db(name, request)?;
        network.by_name.insert(name.clone(), db.address.clone());
        network.by_address.insert(db.address.clone(), Arc::clone(&db));
        tracing::debug!(db = %name, address = %db.address, encryption = %db.encryption, "created database");
        Ok(db)
    }
}

impl LogProvider for MemoryProvider {
    type Store = MemoryLog;

    async fn open(&self, request: OpenRequest) -> Result<MemoryLog, StoreError> {
        let db = self.locate_or_create(&request)?;
        Ok(MemoryLog {
            db,
            identity: request.identity,
            closed: AtomicBool::new(false),
        })
    }
}

/// A handle onto one database of a [`MemoryProvider`].
pub struct MemoryLog {
    db: Arc<MemoryDb>,
    identity: String,
    closed: AtomicBool,
}

impl MemoryLog {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.db.name.clone()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str, deleting: bool) -> Result<(), StoreError> {
        if self.db.access.is_append_only(key) {
            if deleting || self.db.entries.read().contains_key(key) {
                return Err(StoreError::AppendOnly(key.to_string()));
            }
            return Ok(());
        }
        if !self.db.access.is_writer(&self.identity) {
            return Err(StoreError::AccessDenied {
                identity: self.identity.clone(),
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

impl LogStore for MemoryLog {
    fn db_name(&self) -> &str {
        &self.db.name
    }

    fn address(&self) -> &DbAddress {
        &self.db.address
    }

    fn encryption(&self) -> &EncryptionConfig {
        &self.db.encryption
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_write(key, false)?;
        let bytes = self.db.encode(&value)?;
        let seq = self.db.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.db.entries.write();
            if self.db.access.is_append_only(key) && entries.contains_key(key) {
                return Err(StoreError::AppendOnly(key.to_string()));
            }
            entries.insert(key.to_string(), StoredValue { seq, bytes });
        }
        self.db.announce(key, &self.identity, ChangeKind::Put);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.ensure_open()?;
        let stored = self.db.entries.read().get(key).cloned();
        stored.map(|v| self.db.decode(key, &v.bytes)).transpose()
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_write(key, true)?;
        let removed = self.db.entries.write().remove(key).is_some();
        if removed {
            self.db.announce(key, &self.identity, ChangeKind::Delete);
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_open()?;
        let mut stored: Vec<(String, StoredValue)> = self
            .db
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        stored.sort_by_key(|(_, v)| v.seq);
        stored
            .into_iter()
            .map(|(key, v)| {
                self.db
                    .decode(&key, &v.bytes)
                    .map(|value| LogEntry::new(key, value))
            })
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.db.changes.subscribe()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        tracing::debug!(db = %self.db.name, identity = %self.identity, "closed database handle");
        Ok(())
    }
}
