//! Per-identity registry of lists.
//!
//! [`RegistrySession`] owns everything registry-related for one running
//! client: the cached handle on `<identity>_registry`, the in-memory
//! listing, and the guard that stops two callers from opening the
//! registry at the same time. Its lifecycle is `new` → use → [`close`].
//!
//! The identity arrives asynchronously on a `watch` channel. Until it is
//! set, listings are empty and resolution fails with
//! [`RegistryError::IdentityNotReady`]. An id that cannot prefix a
//! database name is refused with [`RegistryError::InvalidIdentity`].
//!
//! [`close`]: RegistrySession::close

pub mod hierarchy;
pub mod resolve;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::time::Instant;

use tasklane_proto::entry::{RegistryRecord, decode_registry_entry};
use tasklane_proto::registry::{
    EncryptionConfig, ListAddress, ROOT_LIST_NAME, RegistryEntry, registry_db_name,
};

pub use hierarchy::{PathSegment, build_hierarchy_path, children};
pub use resolve::ResolvedList;

use crate::identity::{Identity, IdentityWatch, is_valid_identity_id};
use crate::store::{AccessController, LogProvider, LogStore, OpenRequest, StoreError};

/// Default interval between checks while another open is in flight.
pub const DEFAULT_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for another open before proceeding anyway.
pub const DEFAULT_OPEN_MAX_WAIT: Duration = Duration::from_secs(5);

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The identity has not been established yet.
    #[error("identity not ready")]
    IdentityNotReady,
    /// The identity id cannot be used as a database-name owner prefix.
    #[error("identity id {0:?} cannot own lists")]
    InvalidIdentity(String),
    /// No list matches and the requester may not create it.
    #[error("list not found: {0}")]
    ListNotFound(String),
    /// A list with this display name is already registered.
    #[error("a list named {name} already exists under {parent}")]
    DuplicateName {
        /// Display name.
        name: String,
        /// Parent of the existing entry.
        parent: String,
    },
    /// The display name is not usable.
    #[error("invalid list name: {0}")]
    InvalidName(String),
    /// The root list cannot be removed.
    #[error("the root list cannot be removed")]
    RootProtected,
    /// The registry log failed.
    #[error("registry storage error: {0}")]
    Store(#[from] StoreError),
    /// An entry could not be serialized.
    #[error("failed to encode registry entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Tuning for the in-flight open guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Interval between checks while another open is in flight.
    pub open_poll_interval: Duration,
    /// Time to wait before proceeding anyway.
    pub open_max_wait: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            open_poll_interval: DEFAULT_OPEN_POLL_INTERVAL,
            open_max_wait: DEFAULT_OPEN_MAX_WAIT,
        }
    }
}

/// Validates a list display name.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidName`] for blank names, names with
/// surrounding whitespace, or names containing `/`.
pub fn validate_list_name(name: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::InvalidName("name cannot be empty".to_string()));
    }
    if name.trim() != name {
        return Err(RegistryError::InvalidName(format!(
            "{name:?} has surrounding whitespace"
        )));
    }
    if name.contains('/') {
        return Err(RegistryError::InvalidName(format!("{name:?} contains '/'")));
    }
    Ok(())
}

fn check_identity(id: &str) -> Result<(), RegistryError> {
    if is_valid_identity_id(id) {
        return Ok(());
    }
    tracing::warn!(target: "tasklane::security", identity = %id, "refusing identity id");
    Err(RegistryError::InvalidIdentity(id.to_string()))
}

/// Clears the in-flight flag when the open attempt ends, including by
/// cancellation.
struct OpeningGuard<'a>(&'a AtomicBool);

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry state for one client session.
pub struct RegistrySession<P: LogProvider> {
    provider: Arc<P>,
    identity: IdentityWatch,
    settings: RegistrySettings,
    handle: Mutex<Option<Arc<P::Store>>>,
    opening: AtomicBool,
    listing: RwLock<Vec<RegistryRecord>>,
}

impl<P: LogProvider> RegistrySession<P> {
    /// Creates a session. Nothing is opened until first use.
    #[must_use]
    pub fn new(provider: Arc<P>, identity: IdentityWatch, settings: RegistrySettings) -> Self {
        Self {
            provider,
            identity,
            settings,
            handle: Mutex::new(None),
            opening: AtomicBool::new(false),
            listing: RwLock::new(Vec::new()),
        }
    }

    /// The log provider.
    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// The current identity, if ready.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    fn identity_id(&self) -> Result<String, RegistryError> {
        let id = self
            .identity
            .borrow()
            .as_ref()
            .map(|i| i.id.clone())
            .ok_or(RegistryError::IdentityNotReady)?;
        check_identity(&id)?;
        Ok(id)
    }

    /// Waits until an identity is available.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdentityNotReady`] if the identity channel
    /// closes first, or [`RegistryError::InvalidIdentity`] if the identity
    /// that arrives cannot own lists.
    pub async fn wait_for_identity(&self) -> Result<Identity, RegistryError> {
        let mut rx = self.identity.clone();
        let identity = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RegistryError::IdentityNotReady)?
            .clone()
            .ok_or(RegistryError::IdentityNotReady)?;
        check_identity(&identity.id)?;
        Ok(identity)
    }

    fn cached_handle(&self) -> Option<Arc<P::Store>> {
        self.handle.lock().clone()
    }

    fn install_handle(&self, store: P::Store) -> Arc<P::Store> {
        let mut slot = self.handle.lock();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let store = Arc::new(store);
        *slot = Some(Arc::clone(&store));
        store
    }

    /// Returns the registry log handle, opening it on first use.
    async fn registry_store(&self) -> Result<Arc<P::Store>, RegistryError> {
        if let Some(handle) = self.cached_handle() {
            return Ok(handle);
        }
        let identity = self.identity_id()?;

        if self.opening.swap(true, Ordering::AcqRel) {
            let deadline = Instant::now() + self.settings.open_max_wait;
            loop {
                tokio::time::sleep(self.settings.open_poll_interval).await;
                if let Some(handle) = self.cached_handle() {
                    return Ok(handle);
                }
                if !self.opening.load(Ordering::Acquire) {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(
                        waited = ?self.settings.open_max_wait,
                        "registry open still in flight, proceeding with a second open"
                    );
                    break;
                }
            }
            self.opening.store(true, Ordering::Release);
        }
        let _guard = OpeningGuard(&self.opening);

        let store = self
            .provider
            .open(
                OpenRequest::by_name(registry_db_name(&identity), &identity)
                    .create()
                    .access(AccessController::restricted_to(&identity)),
            )
            .await?;
        ensure_root(&store, &identity).await?;
        let handle = self.install_handle(store);
        tracing::debug!(identity = %identity, db = %handle.db_name(), "registry opened");
        Ok(handle)
    }

    /// Re-reads the registry log into the listing cache.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdentityNotReady`] before the identity is
    /// set, or [`RegistryError::Store`] if the log cannot be read.
    pub async fn refresh(&self) -> Result<Vec<RegistryRecord>, RegistryError> {
        let store = self.registry_store().await?;
        let entries = store.list_all().await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match decode_registry_entry(entry) {
                Ok(record) => records.push(record),
                Err(skipped) => {
                    tracing::warn!(key = %skipped.key, reason = %skipped.reason, "skipping malformed registry entry");
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        (*self.listing.write()).clone_from(&records);
        Ok(records)
    }

    /// Lists every registered list. Empty while the identity is not ready.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the registry cannot be read.
    pub async fn list_available(&self) -> Result<Vec<RegistryRecord>, RegistryError> {
        match self.refresh().await {
            Err(RegistryError::IdentityNotReady) => Ok(Vec::new()),
            other => other,
        }
    }

    /// The listing as of the last refresh.
    #[must_use]
    pub fn cached_listing(&self) -> Vec<RegistryRecord> {
        self.listing.read().clone()
    }

    /// Looks up `name` in the cached listing.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<RegistryRecord> {
        self.listing.read().iter().find(|r| r.name == name).cloned()
    }

    async fn ensure_loaded(&self) -> Result<(), RegistryError> {
        if self.cached_handle().is_none() || self.listing.read().is_empty() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Registers (or re-registers) a list under `name`.
    ///
    /// An existing entry keeps its creation time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] for a bad name, or a store
    /// error if the write fails.
    pub async fn add_to_registry(
        &self,
        name: &str,
        db_name: &str,
        address: Option<&str>,
        parent: Option<&str>,
        encryption: &EncryptionConfig,
    ) -> Result<RegistryRecord, RegistryError> {
        validate_list_name(name)?;
        let store = self.registry_store().await?;
        let created_at = match store.get(name).await? {
            Some(value) => serde_json::from_value::<RegistryEntry>(value)
                .map(|e| e.created_at)
                .unwrap_or_else(|_| Utc::now()),
            None => Utc::now(),
        };
        let mut entry = RegistryEntry {
            db_name: db_name.to_string(),
            address: address.map(str::to_string),
            parent: parent.map(str::to_string),
            encryption_enabled: false,
            encryption_method: None,
            created_at,
        };
        entry.set_encryption(encryption);
        store.put(name, serde_json::to_value(&entry)?).await?;
        tracing::info!(list = %name, db = %db_name, parent = ?parent, "registered list");
        self.refresh().await?;
        Ok(RegistryRecord {
            name: name.to_string(),
            owner: ListAddress::from_entry(name, &entry),
            entry,
        })
    }

    /// Applies `change` to the entry stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ListNotFound`] if there is no such entry,
    /// or a store error if the write fails.
    pub async fn update_entry(
        &self,
        name: &str,
        change: impl FnOnce(&mut RegistryEntry) + Send,
    ) -> Result<RegistryRecord, RegistryError> {
        let store = self.registry_store().await?;
        let value = store
            .get(name)
            .await?
            .ok_or_else(|| RegistryError::ListNotFound(name.to_string()))?;
        let mut entry: RegistryEntry = serde_json::from_value(value)?;
        change(&mut entry);
        store.put(name, serde_json::to_value(&entry)?).await?;
        self.refresh().await?;
        Ok(RegistryRecord {
            name: name.to_string(),
            owner: ListAddress::from_entry(name, &entry),
            entry,
        })
    }

    /// Removes the entry stored under `name`. The list database itself is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RootProtected`] for the root list, or a
    /// store error if the delete fails.
    pub async fn remove_entry(&self, name: &str) -> Result<(), RegistryError> {
        if name == ROOT_LIST_NAME {
            return Err(RegistryError::RootProtected);
        }
        let store = self.registry_store().await?;
        store.delete(name).await?;
        tracing::info!(list = %name, "removed registry entry");
        self.refresh().await?;
        Ok(())
    }

    /// Root-first path to `name`, from the cached listing.
    #[must_use]
    pub fn hierarchy_path(&self, name: &str) -> Vec<PathSegment> {
        build_hierarchy_path(&self.listing.read(), name)
    }

    /// Direct sub-lists of `name`, from the cached listing.
    #[must_use]
    pub fn children_of(&self, name: &str) -> Vec<RegistryRecord> {
        children(&self.listing.read(), name)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Closes the registry handle and clears the listing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the handle fails to close.
    pub async fn close(&self) -> Result<(), RegistryError> {
        let handle = self.handle.lock().take();
        self.listing.write().clear();
        if let Some(handle) = handle {
            handle.close().await?;
        }
        Ok(())
    }
}

async fn ensure_root<S: LogStore>(store: &S, identity: &str) -> Result<(), RegistryError> {
    if store.get(ROOT_LIST_NAME).await?.is_some() {
        return Ok(());
    }
    let mut entry = RegistryEntry {
        db_name: ListAddress::new(identity, ROOT_LIST_NAME).db_name(),
        address: None,
        parent: None,
        encryption_enabled: false,
        encryption_method: None,
        created_at: Utc::now(),
    };
    entry.set_encryption(&EncryptionConfig::plaintext());
    store
        .put(ROOT_LIST_NAME, serde_json::to_value(&entry)?)
        .await?;
    tracing::info!(identity = %identity, "created root list entry");
    Ok(())
}
