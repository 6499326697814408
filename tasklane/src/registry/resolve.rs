//! Display name → opened list database.

use std::sync::Arc;

use tasklane_proto::registry::{EncryptionConfig, ListAddress};

use super::{RegistryError, RegistrySession};
use crate::store::{
    AccessController, DbAddress, LogProvider, LogStore, OpenRequest, StoreError,
};

/// An opened list.
pub struct ResolvedList<S> {
    /// Display name the list was resolved from.
    pub name: String,
    /// Parent recorded in the registry.
    pub parent: Option<String>,
    /// Owner locator.
    pub owner: ListAddress,
    /// Opened store.
    pub store: Arc<S>,
    /// `true` if the database was created by this call.
    pub created: bool,
}

impl<S: LogStore> ResolvedList<S> {
    /// Address of the opened database.
    #[must_use]
    pub fn address(&self) -> &DbAddress {
        self.store.address()
    }
}

impl<P: LogProvider> RegistrySession<P> {
    /// Resolves `display_name` to an opened list database.
    ///
    /// 1. Look the name up in the listing. `parent = None` matches any
    ///    parent.
    /// 2. If the entry records an address, open by address.
    /// 3. Otherwise open by database name (recorded, or derived as
    ///    `<owner>_<display name>`) and backfill the address.
    /// 4. If nothing exists and the requester owns the name, create the
    ///    list and register it under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdentityNotReady`] before the identity is
    /// set, [`RegistryError::ListNotFound`] if the list does not exist and
    /// belongs to someone else, or a store error.
    pub async fn resolve(
        &self,
        display_name: &str,
        parent: Option<&str>,
    ) -> Result<ResolvedList<P::Store>, RegistryError> {
        let requester = self.identity_id()?;
        self.ensure_loaded().await?;

        let existing = self.find(display_name);
        // An entry keeps its recorded parent even when the caller asked
        // under a different one.
        let recorded_parent = existing
            .as_ref()
            .and_then(|r| r.entry.parent.clone())
            .or_else(|| parent.map(str::to_string));
        let cached = existing.filter(|record| {
            parent.is_none_or(|p| record.entry.parent.as_deref() == Some(p))
        });
        let owner = cached
            .as_ref()
            .and_then(|r| r.owner.clone())
            .unwrap_or_else(|| ListAddress::new(&requester, display_name));
        let encryption = cached
            .as_ref()
            .map_or_else(EncryptionConfig::plaintext, |r| r.entry.encryption());

        if let Some(address) = cached.as_ref().and_then(|r| r.entry.address.clone()) {
            let request = OpenRequest::by_address(DbAddress::new(address.clone()), &requester)
                .encryption(encryption.clone());
            match self.provider.open(request).await {
                Ok(store) => {
                    tracing::debug!(list = %display_name, %address, "opened list by address");
                    return Ok(ResolvedList {
                        name: display_name.to_string(),
                        parent: recorded_parent,
                        owner,
                        store: Arc::new(store),
                        created: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(list = %display_name, %address, error = %e, "open by address failed, falling back to name");
                }
            }
        }

        let db_name = cached
            .as_ref()
            .map_or_else(|| owner.db_name(), |r| r.entry.db_name.clone());
        let by_name = OpenRequest::by_name(db_name.clone(), &requester).encryption(encryption.clone());
        match self.provider.open(by_name).await {
            Ok(store) => {
                self.backfill(display_name, &db_name, store.address(), recorded_parent.as_deref(), &encryption)
                    .await?;
                return Ok(ResolvedList {
                    name: display_name.to_string(),
                    parent: recorded_parent,
                    owner,
                    store: Arc::new(store),
                    created: false,
                });
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if !owner.is_owned_by(&requester) {
            tracing::info!(list = %owner, requester = %requester, "list not found and not ours to create");
            return Err(RegistryError::ListNotFound(owner.to_string()));
        }

        let store = self
            .provider
            .open(
                OpenRequest::by_name(db_name.clone(), &requester)
                    .create()
                    .encryption(encryption.clone())
                    .access(AccessController::task_list(&requester)),
            )
            .await?;
        self.add_to_registry(
            display_name,
            &db_name,
            Some(store.address().as_str()),
            recorded_parent.as_deref(),
            &encryption,
        )
        .await?;
        tracing::info!(list = %display_name, db = %db_name, "created list");
        Ok(ResolvedList {
            name: display_name.to_string(),
            parent: recorded_parent,
            owner,
            store: Arc::new(store),
            created: true,
        })
    }

    async fn backfill(
        &self,
        display_name: &str,
        db_name: &str,
        address: &DbAddress,
        parent: Option<&str>,
        encryption: &EncryptionConfig,
    ) -> Result<(), RegistryError> {
        if self
            .find(display_name)
            .is_some_and(|r| r.entry.address.as_deref() == Some(address.as_str()))
        {
            return Ok(());
        }
        self.add_to_registry(
            display_name,
            db_name,
            Some(address.as_str()),
            parent,
            encryption,
        )
        .await?;
        tracing::debug!(list = %display_name, %address, "backfilled list address");
        Ok(())
    }
}
